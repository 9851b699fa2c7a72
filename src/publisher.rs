// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Sends raw byte payloads to an exchange/routing-key pair. Publication is
//! fire-and-forget: the call returns once the broker accepted the command,
//! without waiting for a publisher confirm. Persistence is chosen per message.

use crate::{
    channel::{AmqpChannel, PublishProperties},
    errors::AmqpError,
    exchange::DEFAULT_EXCHANGE,
    otel,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Content type stamped on every publication.
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) data: Vec<u8>,
    pub(crate) persistent: bool,
    pub(crate) headers: BTreeMap<String, String>,
}

impl PublishMessage {
    /// A transient message for `exchange` with the given routing key.
    ///
    /// # Parameters
    /// * `exchange` - Exchange name, empty for the default exchange
    /// * `routing_key` - Routing key, ignored by fanout exchanges
    /// * `data` - Raw body
    pub fn new(exchange: &str, routing_key: &str, data: impl Into<Vec<u8>>) -> Self {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.into(),
            persistent: false,
            headers: BTreeMap::new(),
        }
    }

    /// A message for the default exchange, which routes it straight to `queue`.
    pub fn to_queue(queue: &str, data: impl Into<Vec<u8>>) -> Self {
        Self::new(DEFAULT_EXCHANGE, queue, data)
    }

    /// Asks the broker to keep the message across restarts. Has no effect
    /// unless the destination queue is durable.
    pub fn persistent(self) -> Self {
        self.with_persistence(true)
    }

    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}

/// Publishes messages to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `msg`, propagating the trace context in `ctx`.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the message headers
    /// * `msg` - Destination, body, persistence flag and extra headers
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the command, or `PublishingError`
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError>;
}

/// [`Publisher`] issuing `basic.publish` on a channel.
pub struct RabbitMQPublisher {
    channel: Arc<dyn AmqpChannel>,
}

impl RabbitMQPublisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channel` - Channel the messages are published on
    ///
    /// # Returns
    /// A shareable publisher
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { channel })
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        let mut headers = msg.headers.clone();
        otel::inject(ctx, &mut headers);

        let props = PublishProperties {
            persistent: msg.persistent,
            message_id: Some(Uuid::new_v4().to_string()),
            content_type: Some(BINARY_CONTENT_TYPE.to_owned()),
            headers,
        };

        debug!(
            exchange = %msg.exchange,
            routing_key = %msg.routing_key,
            persistent = msg.persistent,
            "publishing message"
        );

        match self
            .channel
            .basic_publish(&msg.exchange, &msg.routing_key, &msg.data, &props)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(err)
            }
            _ => Ok(()),
        }
    }
}

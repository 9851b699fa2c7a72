// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel and Connection Seams
//!
//! Every broker command goes through the [`AmqpChannel`] trait and channels are
//! obtained from an [`AmqpConnection`]. The production implementation wraps
//! lapin (see [`crate::connection`]); keeping the seam object-safe lets the
//! topology, publisher and dispatcher run unchanged against any
//! AMQP-0-9-1-compatible backend.
//!
//! A channel is not meant to be driven by several callers issuing commands at
//! the same time. Callers serialise their commands on one channel and open
//! another channel when they need independent work.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeHandle},
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::Stream;
use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};
use tracing::{debug, error};

/// Stream of deliveries pushed by the broker for one consumer.
///
/// The stream ends when the consumer is cancelled or its channel closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, AmqpError>> + Send>>;

/// A message handed to a consumer by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Per-channel monotonic identifier used to acknowledge this delivery
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    /// Set when the message was delivered before and never acknowledged
    pub redelivered: bool,
    pub persistent: bool,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

/// Message properties sent along with a publication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    /// Ask the broker to store the message on disk. Only effective when the
    /// destination queue is durable.
    pub persistent: bool,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Commands issued on a single broker channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Whether the channel can still accept commands.
    fn is_open(&self) -> bool;

    /// Declares a queue. An empty name asks the broker to generate one.
    ///
    /// # Parameters
    /// * `def` - Name and durable/exclusive/auto-delete attributes
    ///
    /// # Returns
    /// The handle carrying the actual queue name, or `DeclareQueueError`
    /// when the queue exists with other attributes
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError>;

    /// Declares an exchange. Fails with `DeclareExchangeError` when it
    /// exists with another kind or other attributes.
    async fn exchange_declare(&self, def: &ExchangeDefinition)
        -> Result<ExchangeHandle, AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes without waiting for a publisher confirm.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key, the queue name on the default exchange
    /// * `payload` - Message body
    /// * `props` - Persistence flag, message id, content type and headers
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        props: &PublishProperties,
    ) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries per consumer, or for the whole
    /// channel when `global` is set. Applies to consumers started afterwards.
    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    /// Starts a consumer on `queue`.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `consumer_tag` - Tag identifying the consumer on this channel
    /// * `no_ack` - When set, the broker treats deliveries as acknowledged on send
    ///
    /// # Returns
    /// The stream of deliveries, ending when the consumer is cancelled or the
    /// channel closes
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Acknowledges `delivery_tag`, and every earlier tag when `multiple` is set.
    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Closes the channel. Unacknowledged deliveries go back to their queues.
    /// Closing an already closed channel succeeds.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A session with the broker owning any number of channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Opens a new channel. Fails with `ChannelError` once the connection is closed.
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Closes the connection and every channel it owns.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Runs `f` on a fresh channel and releases the channel and the connection
/// afterwards, whether `f` succeeded or not.
///
/// # Parameters
/// * `connection` - Open connection, closed before this returns
/// * `f` - Work to run with the channel
///
/// # Returns
/// The value produced by `f`. The error returned by `f` wins over errors
/// raised while closing.
pub async fn with_channel<F, Fut, T>(
    connection: Arc<dyn AmqpConnection>,
    f: F,
) -> Result<T, AmqpError>
where
    F: FnOnce(Arc<dyn AmqpChannel>) -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    let channel = match connection.create_channel().await {
        Ok(channel) => channel,
        Err(err) => {
            if let Err(close_err) = connection.close().await {
                error!(error = close_err.to_string(), "failure to close connection");
            }
            return Err(err);
        }
    };

    let result = f(channel.clone()).await;

    debug!("releasing channel and connection");
    let channel_closed = channel.close().await;
    let connection_closed = connection.close().await;

    let value = result?;
    channel_closed?;
    connection_closed?;
    Ok(value)
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A [`ConsumerHandler`] is invoked once per delivery. In manual
//! acknowledgment mode the handler owns the decision to acknowledge through
//! [`ConsumerMessage::ack`]; a message that is never acknowledged keeps its
//! prefetch slot and is redelivered once the channel goes away.

use crate::{
    channel::{AmqpChannel, Delivery},
    dispatcher::SubscriptionState,
    errors::AmqpError,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{borrow::Cow, sync::Arc};
use tokio::sync::watch;
use tracing::debug;

/// User code processing deliveries.
///
/// Returning an error, or panicking, never stops the subscription. In manual
/// mode the message then stays unacknowledged; in auto-ack mode it is already
/// gone from the queue.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one delivery.
    ///
    /// # Parameters
    /// * `ctx` - Trace context extracted from the message headers
    /// * `msg` - The delivery, with its acknowledgment handle
    ///
    /// # Returns
    /// Ok(()) when the message was processed
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

/// Acknowledges deliveries on the channel they arrived on.
pub(crate) struct Acker {
    channel: Arc<dyn AmqpChannel>,
    auto_ack: bool,
    state: Arc<watch::Sender<SubscriptionState>>,
}

impl Acker {
    pub(crate) fn new(
        channel: Arc<dyn AmqpChannel>,
        auto_ack: bool,
        state: Arc<watch::Sender<SubscriptionState>>,
    ) -> Self {
        Acker {
            channel,
            auto_ack,
            state,
        }
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        if self.auto_ack {
            return Err(AmqpError::AckMessageError(delivery_tag));
        }

        self.state.send_replace(SubscriptionState::Acknowledging);
        let result = self.channel.basic_ack(delivery_tag, multiple).await;
        self.state.send_replace(SubscriptionState::Delivering);

        debug!(delivery_tag, multiple, ok = result.is_ok(), "ack sent");
        result
    }
}

/// A delivery as seen by a [`ConsumerHandler`].
pub struct ConsumerMessage {
    queue: String,
    consumer_tag: String,
    delivery: Delivery,
    acker: Acker,
}

impl ConsumerMessage {
    pub(crate) fn new(queue: &str, consumer_tag: &str, delivery: Delivery, acker: Acker) -> Self {
        ConsumerMessage {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            delivery,
            acker,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn data(&self) -> &[u8] {
        &self.delivery.data
    }

    /// The payload decoded as UTF-8, with invalid sequences replaced.
    pub fn body(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.delivery.data)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn is_auto_ack(&self) -> bool {
        self.acker.auto_ack
    }

    /// Acknowledges this delivery, removing it from the queue.
    ///
    /// Fails with `AckMessageError` when the subscription runs in auto-ack
    /// mode, since the broker already considers the message acknowledged.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(self.delivery.delivery_tag, false).await
    }

    /// Acknowledges this delivery and every earlier unacknowledged one on the
    /// same channel.
    pub async fn ack_multiple(&self) -> Result<(), AmqpError> {
        self.acker.ack(self.delivery.delivery_tag, true).await
    }
}

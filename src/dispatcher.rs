// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatcher
//!
//! Registers handlers on queues and feeds them the deliveries the broker
//! pushes. Registration returns immediately with a [`Subscription`]; the
//! deliveries are handled on a spawned task, one at a time per subscription,
//! in the order the broker sends them.
//!
//! Fair dispatch is configured with [`RabbitMQDispatcher::set_prefetch`]
//! before consuming: with a prefetch of `n` the broker stops delivering to a
//! consumer holding `n` unacknowledged messages, so slow workers receive
//! fewer messages than fast ones.
//!
//! Each subscription moves through
//! `Registered → Delivering → {Acknowledging → Delivering | Cancelled → Terminal}`.

use crate::{
    channel::{AmqpChannel, DeliveryStream},
    consumer::consume,
    errors::AmqpError,
    handler::{Acker, ConsumerHandler},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// Lifecycle of a consumer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered with the broker, nothing delivered yet
    Registered,
    /// Handling deliveries
    Delivering,
    /// The handler is acknowledging a delivery
    Acknowledging,
    /// Cancelled, or the channel went away; no more deliveries
    Cancelled,
    /// The dispatch task finished
    Terminal,
}

/// What to consume and how to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) auto_ack: bool,
}

impl ConsumerDefinition {
    /// A manually acknowledged consumer on `queue` with a generated tag.
    pub fn new(queue: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            queue: queue.to_owned(),
            consumer_tag: format!("ctag-{}", Uuid::new_v4()),
            auto_ack: false,
        }
    }

    /// Lets the broker consider messages acknowledged as soon as they are
    /// sent. A crash before the handler finishes loses the message.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn tag(mut self, consumer_tag: &str) -> Self {
        self.consumer_tag = consumer_tag.to_owned();
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }
}

/// Starts consumers on a channel.
pub struct RabbitMQDispatcher {
    channel: Arc<dyn AmqpChannel>,
}

impl RabbitMQDispatcher {
    /// Creates a new dispatcher.
    ///
    /// # Parameters
    /// * `channel` - Channel the consumers are started on
    ///
    /// # Returns
    /// A new RabbitMQDispatcher instance
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Self {
        RabbitMQDispatcher { channel }
    }

    /// Limits unacknowledged deliveries per consumer, or per channel when
    /// `global` is set. Only consumers started afterwards are affected.
    ///
    /// # Parameters
    /// * `count` - Maximum unacknowledged deliveries, 0 for no limit
    /// * `global` - Apply the limit to the whole channel
    pub async fn set_prefetch(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        debug!(count, global, "configuring prefetch");
        self.channel.basic_qos(count, global).await.map_err(|err| {
            error!(error = err.to_string(), "failure to configure qos");
            err
        })
    }

    /// Registers `handler` on the queue named in `def` and returns without
    /// waiting for deliveries.
    ///
    /// # Parameters
    /// * `def` - Queue, consumer tag and acknowledgment mode
    /// * `handler` - Handler invoked once per delivery
    ///
    /// # Returns
    /// The running [`Subscription`], or `BindingConsumerError` when the
    /// broker refused the consumer
    pub async fn consume(
        &self,
        def: ConsumerDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError> {
        let stream = match self
            .channel
            .basic_consume(&def.queue, &def.consumer_tag, def.auto_ack)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(err)
            }
            Ok(s) => Ok(s),
        }?;

        debug!(
            queue = %def.queue,
            consumer_tag = %def.consumer_tag,
            auto_ack = def.auto_ack,
            "consumer registered"
        );

        let (state, receiver) = watch::channel(SubscriptionState::Registered);
        let state = Arc::new(state);
        let token = CancellationToken::new();

        let subscription = Subscription {
            consumer_tag: def.consumer_tag.clone(),
            channel: self.channel.clone(),
            token: token.clone(),
            state: receiver,
        };

        tokio::spawn(dispatch(
            stream,
            def,
            handler,
            self.channel.clone(),
            state,
            token,
        ));

        Ok(subscription)
    }
}

/// Pulls deliveries until the stream ends or the token is cancelled.
async fn dispatch(
    mut stream: DeliveryStream,
    def: ConsumerDefinition,
    handler: Arc<dyn ConsumerHandler>,
    channel: Arc<dyn AmqpChannel>,
    state: Arc<watch::Sender<SubscriptionState>>,
    token: CancellationToken,
) {
    let tracer = global::tracer("amqp consumer");

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            next = stream.next() => next,
        };

        let Some(result) = next else {
            break;
        };

        match result {
            Ok(delivery) => {
                state.send_replace(SubscriptionState::Delivering);
                let acker = Acker::new(channel.clone(), def.auto_ack, state.clone());
                if let Err(err) = consume(&tracer, delivery, &def, &handler, acker).await {
                    error!(error = err.to_string(), "error consume msg");
                }
            }
            Err(err) => error!(error = err.to_string(), "errors consume msg"),
        }
    }

    state.send_replace(SubscriptionState::Cancelled);
    drop(stream);
    debug!(consumer_tag = %def.consumer_tag, "subscription finished");
    state.send_replace(SubscriptionState::Terminal);
}

/// Handle on a running consumer.
///
/// Dropping the handle leaves the consumer running until its channel closes.
pub struct Subscription {
    consumer_tag: String,
    channel: Arc<dyn AmqpChannel>,
    token: CancellationToken,
    state: watch::Receiver<SubscriptionState>,
}

impl Subscription {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Stops the consumer and waits for the in-flight delivery, if any, to
    /// finish. Unacknowledged messages stay unacknowledged until their
    /// channel closes.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        self.token.cancel();

        let result = if self.channel.is_open() {
            self.channel.basic_cancel(&self.consumer_tag).await
        } else {
            Ok(())
        };

        self.wait().await;
        result
    }

    /// Waits until the subscription is terminal, which happens after
    /// [`Subscription::cancel`] or once the channel closes.
    pub async fn wait(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|s| *s == SubscriptionState::Terminal)
            .await;
    }
}

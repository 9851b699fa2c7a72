// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! Ensures exchanges and queues exist with the requested attributes and binds
//! queues to exchanges. Declarations are idempotent on the broker: repeating
//! one with identical attributes is a no-op, while changing the attributes of
//! an existing name fails with a topology error.
//!
//! The main components are:
//! - `Topology` trait: builder interface collecting a whole topology
//! - `AmqpTopology`: implementation issuing the declarations on a channel

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeHandle},
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Declares every exchange, then every queue, then every binding.
    ///
    /// Returns the handles of the declared queues in registration order.
    async fn install(&self) -> Result<Vec<QueueHandle>, AmqpError>;
}

/// Collects exchanges, queues and bindings and declares them on a channel.
pub struct AmqpTopology<'tp> {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
}

impl<'tp> AmqpTopology<'tp> {
    /// Creates an empty topology.
    ///
    /// # Parameters
    /// * `channel` - Channel the declarations are issued on
    ///
    /// # Returns
    /// A topology with no exchanges, queues or bindings
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<Vec<QueueHandle>, AmqpError> {
        for exch in &self.exchanges {
            self.declare_exchange(exch).await?;
        }

        let mut handles = Vec::with_capacity(self.queues.len());
        for def in &self.queues {
            handles.push(self.declare_queue(def).await?);
        }

        for binding in &self.queues_binding {
            self.bind_queue(binding).await?;
        }

        debug!("topology installed");
        Ok(handles)
    }
}

impl AmqpTopology<'_> {
    /// Declares a single queue.
    ///
    /// An anonymous definition gets a broker-generated name, returned in the
    /// handle; use that name for bindings and consumers.
    ///
    /// # Parameters
    /// * `def` - Queue name and attributes
    ///
    /// # Returns
    /// The queue handle, or `DeclareQueueError` on an attribute conflict
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        debug!("creating queue: {}", def.name());

        match self.channel.queue_declare(def).await {
            Err(err) => {
                error!(error = err.to_string(), "error to declare the queue");
                Err(err)
            }
            Ok(handle) => {
                debug!("queue: {} was created", handle.name);
                Ok(handle)
            }
        }
    }

    /// Declares a single exchange.
    pub async fn declare_exchange(
        &self,
        def: &ExchangeDefinition,
    ) -> Result<ExchangeHandle, AmqpError> {
        debug!("creating exchange: {}", def.name());

        match self.channel.exchange_declare(def).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                Err(err)
            }
            Ok(handle) => {
                debug!("exchange: {} was created", def.name());
                Ok(handle)
            }
        }
    }

    /// Binds a queue to an exchange. Repeating an identical binding is a no-op.
    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name(),
            binding.exchange_name(),
            binding.key()
        );

        self.channel.queue_bind(binding).await.map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            err
        })
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders describing a queue to declare and a binding between a queue and an
//! exchange, plus the handle the broker returns after a declaration.

/// Definition of a queue with its declaration attributes.
///
/// The broker keys queues by name. Declaring an existing name again with the
/// same attributes is a no-op; with different attributes it is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) delete: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// The queue starts non-durable, shared and persistent (not auto-deleted).
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            exclusive: false,
            delete: false,
        }
    }

    /// A queue whose name is chosen by the broker.
    ///
    /// Anonymous queues are exclusive to the declaring connection and deleted
    /// once their last consumer goes away, which is what a throwaway
    /// subscriber queue on a fanout exchange wants.
    pub fn anonymous() -> QueueDefinition {
        QueueDefinition::new("").exclusive().delete()
    }

    /// Makes the queue durable, so it survives a broker restart.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Deletes the queue once its last consumer is cancelled.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    /// True when the broker must generate the queue name.
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

/// Result of a successful queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Binding of a queue to an exchange.
///
/// The routing key is ignored by fanout exchanges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// [`QueueBinding::exchange`] and [`QueueBinding::routing_key`].
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

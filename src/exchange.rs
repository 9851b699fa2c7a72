// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges route published messages to the queues bound to them. This
//! module defines the supported exchange types and a builder for exchange
//! declarations.

use std::fmt;

/// Name of the default exchange. Publishing to it routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Routing behaviour of an exchange.
///
/// - Direct: routes to queues whose binding key equals the routing key
/// - Fanout: copies every message to all bound queues, ignoring the routing key
/// - Topic: routes on dot-separated patterns where `*` matches one word and
///   `#` matches zero or more
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
            ExchangeKind::Topic => write!(f, "topic"),
        }
    }
}

/// Definition of an exchange with its declaration attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default the exchange is a transient direct exchange.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            delete: false,
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the exchange once its last binding is removed.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }
}

/// Result of a successful exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeHandle {
    pub name: String,
    pub kind: ExchangeKind,
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Delivery Client
//!
//! Every broker command issued through this crate reports failures with
//! [`AmqpError`]. Variants name the command that failed; [`AmqpError::category`]
//! folds them into the coarse taxonomy callers usually branch on
//! (connection, channel, topology, delivery).

use thiserror::Error;

/// Represents errors that can occur while talking to an AMQP broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// The broker is unreachable, refused the session or the handshake timed out
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Channel creation failed or a command was issued on a closed channel
    #[error("channel error: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer on queue `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message with delivery tag `{0}`")]
    AckMessageError(u64),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error cancelling a consumer or reading its delivery stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A message handler reported a failure
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

/// Coarse grouping of [`AmqpError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    Channel,
    Topology,
    Delivery,
    Publishing,
    Consumer,
    Config,
    Internal,
}

impl AmqpError {
    /// Returns the taxonomy bucket this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AmqpError::ConnectionError(_) => ErrorCategory::Connection,
            AmqpError::ChannelError(_) | AmqpError::QoSDeclarationError(_) => {
                ErrorCategory::Channel
            }
            AmqpError::DeclareExchangeError(_)
            | AmqpError::DeclareQueueError(_)
            | AmqpError::BindingExchangeToQueueError(_, _) => ErrorCategory::Topology,
            AmqpError::AckMessageError(_) => ErrorCategory::Delivery,
            AmqpError::PublishingError(_) => ErrorCategory::Publishing,
            AmqpError::BindingConsumerError(_)
            | AmqpError::ConsumerError(_)
            | AmqpError::HandlerError(_) => ErrorCategory::Consumer,
            AmqpError::ConfigError(_) => ErrorCategory::Config,
            AmqpError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_topology_error(&self) -> bool {
        self.category() == ErrorCategory::Topology
    }
}

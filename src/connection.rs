// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin-backed Connection Manager
//!
//! Opens the broker session described by [`AmqpConfigs`] and implements the
//! [`AmqpConnection`] and [`AmqpChannel`] seams on top of lapin.

use crate::{
    channel::{AmqpChannel, AmqpConnection, Delivery, DeliveryStream, PublishProperties},
    config::AmqpConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeHandle},
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Reply code sent with a normal close.
const REPLY_SUCCESS: u16 = 200;
/// AMQP delivery mode asking the broker to persist the message.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Opens a connection to the broker described by `cfg`.
///
/// # Parameters
/// * `cfg` - Host, port, credentials, vhost and connect timeout
///
/// # Returns
/// The open connection, or `ConnectionError` on refusal, authentication
/// failure or timeout
///
/// The attempt is bounded by the configured connect timeout; running out of
/// time is reported as a `ConnectionError` like any other refusal.
pub async fn connect(cfg: &AmqpConfigs) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let uri = cfg.uri();

    let conn = match tokio::time::timeout(
        cfg.connect_timeout(),
        Connection::connect(&uri, options),
    )
    .await
    {
        Ok(Ok(c)) => Ok(c),
        Ok(Err(err)) => {
            error!(error = err.to_string(), host = %cfg.host, "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
        Err(_) => {
            error!(host = %cfg.host, "timed out connecting");
            Err(AmqpError::ConnectionError(format!(
                "no answer from {}:{} within {}ms",
                cfg.host, cfg.port, cfg.connect_timeout_ms
            )))
        }
    }?;
    debug!("amqp connected");

    Ok(Arc::new(LapinConnection { inner: conn }))
}

pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!(id = c.id(), "channel created");
                Ok(Arc::new(LapinChannel { inner: c }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}

pub struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        match self
            .inner
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: def.is_exclusive(),
                    auto_delete: def.is_auto_delete(),
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => Ok(QueueHandle {
                name: queue.name().as_str().to_owned(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
        }
    }

    async fn exchange_declare(
        &self,
        def: &ExchangeDefinition,
    ) -> Result<ExchangeHandle, AmqpError> {
        match self
            .inner
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: def.is_auto_delete(),
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(()) => Ok(ExchangeHandle {
                name: def.name().to_owned(),
                kind: def.exchange_kind(),
            }),
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the exchange");
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                )
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        props: &PublishProperties,
    ) -> Result<(), AmqpError> {
        match self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                basic_properties(props),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let deliveries: DeliveryStream = Box::pin(consumer.map(|result| match result {
            Ok(delivery) => Ok(Delivery::from(delivery)),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        }));

        Ok(deliveries)
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError(delivery_tag)
            })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::ConsumerError(err.to_string())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::ChannelError(err.to_string())
            })
    }
}

/// Builds the lapin properties for a publication.
pub(crate) fn basic_properties(props: &PublishProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    let mut properties = BasicProperties::default().with_headers(FieldTable::from(headers));

    if props.persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    if let Some(id) = &props.message_id {
        properties = properties.with_message_id(ShortString::from(id.clone()));
    }

    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }

    properties
}

/// Keeps the string-valued headers of a delivery.
fn string_headers(props: &BasicProperties) -> BTreeMap<String, String> {
    let Some(table) = props.headers() else {
        return BTreeMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(v) => Some((
                key.to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )),
            AMQPValue::ShortString(v) => Some((key.to_string(), v.to_string())),
            _ => None,
        })
        .collect()
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            persistent: *delivery.properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
            message_id: delivery.properties.message_id().as_ref().map(|id| id.to_string()),
            headers: string_headers(&delivery.properties),
            data: delivery.data,
        }
    }
}

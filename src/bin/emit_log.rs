// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use opentelemetry::Context;
use rabbitmq_delivery::{
    channel::with_channel,
    config::AmqpConfigs,
    connection::connect,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    logging,
    publisher::{PublishMessage, Publisher, RabbitMQPublisher},
    topology::AmqpTopology,
    workload::{message_from_args, DEFAULT_LOG},
};

const EXCHANGE: &str = "logs";

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    logging::init();

    let message = message_from_args(std::env::args().skip(1), DEFAULT_LOG);
    let cfg = AmqpConfigs::load()?;
    let connection = connect(&cfg).await?;

    with_channel(connection, |channel| async move {
        AmqpTopology::new(channel.clone())
            .declare_exchange(&ExchangeDefinition::new(EXCHANGE).fanout())
            .await?;

        let msg = PublishMessage::new(EXCHANGE, "", message.as_bytes());
        RabbitMQPublisher::new(channel)
            .publish(&Context::current(), &msg)
            .await?;

        println!(" [x] Sent {message}");
        Ok(())
    })
    .await
}

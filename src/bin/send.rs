// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use opentelemetry::Context;
use rabbitmq_delivery::{
    channel::with_channel,
    config::AmqpConfigs,
    connection::connect,
    errors::AmqpError,
    logging,
    publisher::{PublishMessage, Publisher, RabbitMQPublisher},
    queue::QueueDefinition,
    topology::AmqpTopology,
    workload::wait_for_exit,
};

const QUEUE: &str = "hello";
const MESSAGE: &str = "Hello World!";

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    logging::init();

    let cfg = AmqpConfigs::load()?;
    let connection = connect(&cfg).await?;

    with_channel(connection, |channel| async move {
        AmqpTopology::new(channel.clone())
            .declare_queue(&QueueDefinition::new(QUEUE))
            .await?;

        RabbitMQPublisher::new(channel)
            .publish(&Context::current(), &PublishMessage::to_queue(QUEUE, MESSAGE))
            .await?;
        println!(" [X] Sent {MESSAGE}");

        wait_for_exit().await;
        Ok(())
    })
    .await
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_delivery::{
    channel::with_channel,
    config::AmqpConfigs,
    connection::connect,
    dispatcher::{ConsumerDefinition, RabbitMQDispatcher},
    errors::AmqpError,
    logging,
    queue::QueueDefinition,
    topology::AmqpTopology,
    workload::{wait_for_exit, EchoHandler},
};
use std::sync::Arc;

const QUEUE: &str = "hello";

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    logging::init();

    let cfg = AmqpConfigs::load()?;
    let connection = connect(&cfg).await?;

    with_channel(connection, |channel| async move {
        AmqpTopology::new(channel.clone())
            .declare_queue(&QueueDefinition::new(QUEUE))
            .await?;

        println!(" [*] Waiting for messages.");

        let subscription = RabbitMQDispatcher::new(channel)
            .consume(
                ConsumerDefinition::new(QUEUE).auto_ack(),
                Arc::new(EchoHandler::new(" [x] Received ")),
            )
            .await?;

        wait_for_exit().await;
        subscription.cancel().await
    })
    .await
}

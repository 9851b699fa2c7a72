// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_delivery::{
    channel::with_channel,
    config::AmqpConfigs,
    connection::connect,
    dispatcher::{ConsumerDefinition, RabbitMQDispatcher},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    logging,
    queue::{QueueBinding, QueueDefinition},
    topology::AmqpTopology,
    workload::{wait_for_exit, EchoHandler},
};
use std::sync::Arc;

const EXCHANGE: &str = "logs";

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    logging::init();

    let cfg = AmqpConfigs::load()?;
    let connection = connect(&cfg).await?;

    with_channel(connection, |channel| async move {
        let topology = AmqpTopology::new(channel.clone());
        topology
            .declare_exchange(&ExchangeDefinition::new(EXCHANGE).fanout())
            .await?;

        // broker-named, removed once this program disconnects
        let queue = topology
            .declare_queue(&QueueDefinition::anonymous())
            .await?
            .name;
        topology
            .bind_queue(&QueueBinding::new(&queue).exchange(EXCHANGE))
            .await?;

        println!(" [*] Waiting for logs.");

        let subscription = RabbitMQDispatcher::new(channel)
            .consume(
                ConsumerDefinition::new(&queue).auto_ack(),
                Arc::new(EchoHandler::new(" [x] ")),
            )
            .await?;

        wait_for_exit().await;
        subscription.cancel().await
    })
    .await
}

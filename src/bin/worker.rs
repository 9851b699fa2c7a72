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
    workload::{wait_for_exit, TaskWorker},
};
use std::{sync::Arc, time::Duration};

const QUEUE: &str = "task_queue";

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    logging::init();

    let cfg = AmqpConfigs::load()?;
    let connection = connect(&cfg).await?;

    with_channel(connection, |channel| async move {
        AmqpTopology::new(channel.clone())
            .declare_queue(&QueueDefinition::new(QUEUE).durable())
            .await?;

        let dispatcher = RabbitMQDispatcher::new(channel);
        dispatcher.set_prefetch(1, false).await?;

        println!(" [*] Waiting for messages.");

        let subscription = dispatcher
            .consume(
                ConsumerDefinition::new(QUEUE),
                Arc::new(TaskWorker::new(Duration::from_secs(1))),
            )
            .await?;

        wait_for_exit().await;
        subscription.cancel().await
    })
    .await
}

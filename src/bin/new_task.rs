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
    workload::{message_from_args, DEFAULT_TASK},
};

const QUEUE: &str = "task_queue";

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    logging::init();

    let message = message_from_args(std::env::args().skip(1), DEFAULT_TASK);
    let cfg = AmqpConfigs::load()?;
    let connection = connect(&cfg).await?;

    with_channel(connection, |channel| async move {
        AmqpTopology::new(channel.clone())
            .declare_queue(&QueueDefinition::new(QUEUE).durable())
            .await?;

        let msg = PublishMessage::to_queue(QUEUE, message.as_bytes()).persistent();
        RabbitMQPublisher::new(channel)
            .publish(&Context::current(), &msg)
            .await?;

        println!(" [X] Sent {message}");
        Ok(())
    })
    .await
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Helpers shared by the command line programs: message bodies from the
//! command line, the simulated work queue task and the exit prompt.

use crate::{
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
};
use async_trait::async_trait;
use futures_util::future;
use opentelemetry::Context;
use std::{future::Future, io, time::Duration};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Body published by `new_task` when no arguments are given.
pub const DEFAULT_TASK: &str = "Hello World";

/// Body published by `emit_log` when no arguments are given.
pub const DEFAULT_LOG: &str = "info: Hello World!";

/// Builds a message body from command line arguments.
///
/// # Parameters
/// * `args` - Arguments after the program name
/// * `default` - Body used when there are no arguments at all
///
/// # Returns
/// The arguments joined by single spaces. Empty arguments are kept, so a
/// lone `""` publishes an empty body.
pub fn message_from_args<I>(args: I, default: &str) -> String
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    if args.is_empty() {
        return default.to_owned();
    }

    args.join(" ")
}

pub fn count_dots(body: &str) -> u32 {
    body.matches('.').count() as u32
}

/// One `unit` of work per dot in the body.
pub fn task_duration(body: &str, unit: Duration) -> Duration {
    unit.saturating_mul(count_dots(body))
}

/// Simulates a task taking one time unit per dot, then acknowledges it.
pub struct TaskWorker {
    unit: Duration,
}

impl TaskWorker {
    pub fn new(unit: Duration) -> Self {
        TaskWorker { unit }
    }
}

#[async_trait]
impl ConsumerHandler for TaskWorker {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        let body = msg.body();
        println!(" [x] Received {body}");

        let work = task_duration(&body, self.unit);
        debug!(delivery_tag = msg.delivery_tag(), ?work, "working");
        tokio::time::sleep(work).await;

        println!(" [x] Done");
        msg.ack().await
    }
}

/// Prints every body behind a fixed prefix.
pub struct EchoHandler {
    prefix: String,
}

impl EchoHandler {
    pub fn new(prefix: &str) -> Self {
        EchoHandler {
            prefix: prefix.to_owned(),
        }
    }
}

#[async_trait]
impl ConsumerHandler for EchoHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        println!("{}{}", self.prefix, msg.body());
        Ok(())
    }
}

/// What ended [`wait_for_exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    /// A line (or end of input) was read from stdin
    Enter,
    /// Ctrl-C
    Interrupt,
}

/// Prints the exit prompt and waits for Enter or Ctrl-C.
///
/// Stdin is read on a detached thread, so returning on Ctrl-C does not leave
/// the runtime waiting on a blocked read at shutdown.
///
/// # Returns
/// The [`ExitSignal`] that arrived first
pub async fn wait_for_exit() -> ExitSignal {
    println!(" Press [enter] to exit.");

    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
        let _ = tx.send(());
    });

    first_exit_signal(rx, tokio::signal::ctrl_c()).await
}

async fn first_exit_signal<F>(enter: oneshot::Receiver<()>, interrupt: F) -> ExitSignal
where
    F: Future<Output = io::Result<()>>,
{
    let interrupted = async {
        if let Err(err) = interrupt.await {
            warn!(error = err.to_string(), "cannot listen for ctrl-c, waiting for enter");
            future::pending::<()>().await;
        }
    };

    let signal = tokio::select! {
        _ = enter => ExitSignal::Enter,
        _ = interrupted => ExitSignal::Interrupt,
    };

    debug!(?signal, "exit requested");
    signal
}

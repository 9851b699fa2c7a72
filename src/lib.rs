// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

#[cfg(test)]
mod memory;

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod workload;

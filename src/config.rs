// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Configuration
//!
//! Connection parameters are resolved once per process and passed explicitly
//! to [`crate::connection::connect`]. Sources are layered in this order, later
//! ones winning:
//!
//! 1. built-in defaults (a local broker with the `guest` account)
//! 2. an optional `rabbitmq.{toml,json,yaml}` file in the working directory
//! 3. `RABBITMQ_*` environment variables, including those from a `.env` file

use crate::errors::AmqpError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::{path::Path, time::Duration};
use tracing::{debug, error};

/// Prefix of the environment variables read by [`AmqpConfigs::load`].
pub const ENV_PREFIX: &str = "RABBITMQ";
/// Base name of the optional configuration file.
pub const CONFIG_FILE_NAME: &str = "rabbitmq";

/// Parameters needed to open a session with the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name reported to the broker for this connection
    pub connection_name: String,
    pub connect_timeout_ms: u64,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "rabbitmq-delivery".to_owned(),
            connect_timeout_ms: 5000,
        }
    }
}

impl AmqpConfigs {
    /// Defaults with only the broker host replaced.
    pub fn with_host(host: &str) -> Self {
        Self {
            host: host.to_owned(),
            ..Self::default()
        }
    }

    /// Loads the configuration from `.env`, the optional `rabbitmq.*` file and
    /// the process environment.
    pub fn load() -> Result<Self, AmqpError> {
        dotenvy::dotenv().ok();
        Self::build(File::with_name(CONFIG_FILE_NAME).required(false))
    }

    /// Like [`AmqpConfigs::load`] but reads the file at `path`, which must exist.
    pub fn load_from(path: &Path) -> Result<Self, AmqpError> {
        Self::build(File::from(path).required(true))
    }

    fn build<S>(file: S) -> Result<Self, AmqpError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let cfg = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize::<AmqpConfigs>())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to load configuration");
                AmqpError::ConfigError(err.to_string())
            })?;

        if cfg.host.is_empty() {
            return Err(AmqpError::ConfigError("host cannot be empty".to_owned()));
        }

        debug!(host = %cfg.host, port = cfg.port, vhost = %cfg.vhost, "configuration loaded");
        Ok(cfg)
    }

    /// Renders the AMQP URI for these parameters.
    ///
    /// Slashes in the vhost are percent-encoded, so the default vhost `/`
    /// becomes `%2f`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

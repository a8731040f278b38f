// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Configuration
//!
//! Connection parameters and consumer settings. Values are immutable once a
//! consumer is built; the supervisor hands the same configuration to every
//! consumer it creates.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::{env, time::Duration};
use tracing::debug;

/// Environment variable holding the broker host.
pub const AMQP_HOST: &str = "AMQP_HOST";
/// Environment variable holding the broker port.
pub const AMQP_PORT: &str = "AMQP_PORT";
/// Environment variable holding the virtual host.
pub const AMQP_VHOST: &str = "AMQP_VHOST";
/// Environment variable holding the user name.
pub const AMQP_USER: &str = "AMQP_USER";
/// Environment variable holding the password.
pub const AMQP_PASSWORD: &str = "AMQP_PASSWORD";

pub const DEFAULT_VHOST: &str = "/";
/// One unacknowledged delivery at a time.
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;
/// How long a handshake step may wait for the broker by default.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 30;
/// Connection name shown in the broker management UI.
pub const DEFAULT_CONNECTION_NAME: &str = "rabbitmq-consumer";

/// Plain credentials used to authenticate against the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Where and how to connect to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl ConnectionParams {
    /// Creates connection parameters for the default virtual host, without
    /// credentials.
    ///
    /// # Parameters
    /// * `host` - Broker host name or address
    /// * `port` - Broker AMQP port
    ///
    /// # Returns
    /// Parameters for `amqp://host:port/`
    pub fn new(host: &str, port: u16) -> ConnectionParams {
        ConnectionParams {
            host: host.to_owned(),
            port,
            vhost: DEFAULT_VHOST.to_owned(),
            credentials: None,
        }
    }

    /// Sets the virtual host.
    pub fn vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials {
            username: username.to_owned(),
            password: password.to_owned(),
        });
        self
    }
}

/// Everything a consumer needs to subscribe to one queue on one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsumerConfig {
    pub(crate) queue: String,
    pub(crate) exchange: String,
    pub(crate) connection: ConnectionParams,
    #[serde(default = "default_prefetch_count")]
    pub(crate) prefetch_count: u16,
    /// Milliseconds; `None` waits forever.
    #[serde(default = "default_step_timeout_ms")]
    pub(crate) step_timeout_ms: Option<u64>,
    #[serde(default)]
    pub(crate) durable: bool,
    #[serde(default = "default_connection_name")]
    pub(crate) connection_name: String,
}

fn default_vhost() -> String {
    DEFAULT_VHOST.to_owned()
}

fn default_prefetch_count() -> u16 {
    DEFAULT_PREFETCH_COUNT
}

fn default_step_timeout_ms() -> Option<u64> {
    Some(DEFAULT_STEP_TIMEOUT_SECS * 1000)
}

fn default_connection_name() -> String {
    DEFAULT_CONNECTION_NAME.to_owned()
}

impl ConsumerConfig {
    /// Creates a configuration with default flow control and timeouts.
    ///
    /// # Parameters
    /// * `queue` - Queue to declare and consume
    /// * `exchange` - Exchange the queue is bound to
    /// * `connection` - Where the broker lives
    ///
    /// # Returns
    /// A configuration with a prefetch of one, a 30 second step timeout and
    /// non-durable topology
    pub fn new(queue: &str, exchange: &str, connection: ConnectionParams) -> ConsumerConfig {
        ConsumerConfig {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            connection,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            step_timeout_ms: default_step_timeout_ms(),
            durable: false,
            connection_name: default_connection_name(),
        }
    }

    /// Builds a configuration from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first, if present.
    pub fn from_env(queue: &str, exchange: &str) -> Result<ConsumerConfig, AmqpError> {
        dotenv::dotenv().ok();
        Self::from_lookup(queue, exchange, |key| env::var(key).ok())
    }

    /// Builds a configuration reading `AMQP_*` variables through `lookup`.
    pub fn from_lookup<F>(queue: &str, exchange: &str, lookup: F) -> Result<ConsumerConfig, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = value(AMQP_HOST).ok_or_else(|| {
            AmqpError::ConfigError(format!("the amqp host must not be empty, set {}", AMQP_HOST))
        })?;

        let port = value(AMQP_PORT).ok_or_else(|| {
            AmqpError::ConfigError(format!("the amqp port must not be empty, set {}", AMQP_PORT))
        })?;
        let port = port.trim().parse::<u16>().map_err(|err| {
            AmqpError::ConfigError(format!("invalid {} `{}`: {}", AMQP_PORT, port, err))
        })?;

        let mut params = ConnectionParams::new(&host, port);
        if let Some(vhost) = value(AMQP_VHOST) {
            params = params.vhost(&vhost);
        }
        if let Some(user) = value(AMQP_USER) {
            params = params.credentials(&user, &lookup(AMQP_PASSWORD).unwrap_or_default());
        }

        debug!(host = %params.host, port = params.port, vhost = %params.vhost, "amqp configuration loaded");

        Ok(ConsumerConfig::new(queue, exchange, params))
    }

    /// Sets how many unacknowledged deliveries the broker may push at once.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Bounds how long the consumer waits for any single broker reply.
    /// `None` waits forever.
    ///
    /// Kept with millisecond precision; a non-zero timeout never rounds down
    /// to zero.
    pub fn step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout_ms = timeout.map(|t| {
            let ms = u64::try_from(t.as_millis()).unwrap_or(u64::MAX);
            if ms == 0 && !t.is_zero() {
                1
            } else {
                ms
            }
        });
        self
    }

    /// Declares both the exchange and the queue as durable.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the name the connection announces to the broker.
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    /// Name of the queue to consume.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Name of the exchange the queue is bound to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn connection(&self) -> &ConnectionParams {
        &self.connection
    }

    /// Name the connection announces to the broker.
    pub fn client_name(&self) -> &str {
        &self.connection_name
    }

    /// The step timeout, or `None` when steps wait forever.
    pub fn step_timeout_duration(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }
}

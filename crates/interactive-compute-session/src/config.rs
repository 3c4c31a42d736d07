//! Client configuration.
//!
//! Defaults can be overridden from the environment:
//! - `INTERACTIVE_COMPUTE_HOST` - broker address (`ws://host:port`)
//! - `INTERACTIVE_COMPUTE_PORT` - hosting server port; the broker listens on the next one
//! - `INTERACTIVE_COMPUTE_QUEUE_SIZE` - advisory admission queue size
//! - `INTERACTIVE_COMPUTE_ENFORCE_QUEUE_SIZE` - reject admissions past the queue size
//! - `INTERACTIVE_COMPUTE_AWAIT_ACK` - wait for the broker's handshake reply

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, session::SessionOptions};

pub const ENV_HOST: &str = "INTERACTIVE_COMPUTE_HOST";
pub const ENV_PORT: &str = "INTERACTIVE_COMPUTE_PORT";
pub const ENV_QUEUE_SIZE: &str = "INTERACTIVE_COMPUTE_QUEUE_SIZE";
pub const ENV_ENFORCE_QUEUE_SIZE: &str = "INTERACTIVE_COMPUTE_ENFORCE_QUEUE_SIZE";
pub const ENV_AWAIT_ACK: &str = "INTERACTIVE_COMPUTE_AWAIT_ACK";

/// Connection and admission settings for a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Explicit broker address. Derived from `server_port` when unset.
    pub host: Option<String>,

    /// Port of the hosting server.
    pub server_port: u16,

    /// Advisory size of the admission queue.
    pub queue_capacity: usize,

    /// Reject admissions once `queue_capacity` tasks are pending.
    pub enforce_queue_capacity: bool,

    /// Wait for the broker to acknowledge the handshake before going idle.
    pub await_handshake_ack: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: None,
            server_port: 8888,
            queue_capacity: 20,
            enforce_queue_capacity: false,
            await_handshake_ack: true,
        }
    }
}

impl ClientConfig {
    /// Defaults with environment overrides applied.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`. Empty values are ignored.
    ///
    /// # Errors
    /// Returns error if a value cannot be parsed.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = lookup(ENV_HOST) {
            tracing::info!("Overriding host from environment: {}", host);
            self.host = Some(host);
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server_port = parse(ENV_PORT, &port)?;
        }
        if let Some(size) = lookup(ENV_QUEUE_SIZE) {
            self.queue_capacity = parse(ENV_QUEUE_SIZE, &size)?;
        }
        if let Some(enforce) = lookup(ENV_ENFORCE_QUEUE_SIZE) {
            self.enforce_queue_capacity = parse_flag(ENV_ENFORCE_QUEUE_SIZE, &enforce)?;
        }
        if let Some(ack) = lookup(ENV_AWAIT_ACK) {
            self.await_handshake_ack = parse_flag(ENV_AWAIT_ACK, &ack)?;
        }
        Ok(self)
    }

    /// The broker address sessions connect to.
    #[must_use]
    pub fn broker_address(&self) -> String {
        self.host.clone().unwrap_or_else(|| {
            format!("ws://127.0.0.1:{}", self.server_port.saturating_add(1))
        })
    }

    #[must_use]
    pub const fn session_options(&self) -> SessionOptions {
        SessionOptions {
            await_handshake_ack: self.await_handshake_ack,
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

//! Worker selection for a new session.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies the compute backend to start a worker on, plus its configuration.
///
/// Sent once, as the handshake frame `[computeID, config]`, when the channel
/// opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Compute backend identifier (e.g. `local`).
    pub compute_id: String,

    /// Backend-specific configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl WorkerSpec {
    /// Select a backend with an empty configuration.
    #[must_use]
    pub fn new(compute_id: impl Into<String>) -> Self {
        Self {
            compute_id: compute_id.into(),
            config: Map::new(),
        }
    }

    /// Select a backend with configuration.
    #[must_use]
    pub fn with_config(compute_id: impl Into<String>, config: Map<String, Value>) -> Self {
        Self {
            compute_id: compute_id.into(),
            config,
        }
    }

    /// Get a configuration value by key.
    #[must_use]
    pub fn get_config(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Set a configuration value.
    pub fn set_config(&mut self, key: impl Into<String>, value: Value) {
        self.config.insert(key.into(), value);
    }

    /// The handshake payload: `[computeID, config]`.
    #[must_use]
    pub fn handshake_payload(&self) -> Value {
        Value::Array(vec![
            Value::String(self.compute_id.clone()),
            Value::Object(self.config.clone()),
        ])
    }
}

//! Session error taxonomy.

use interactive_compute_core::SessionState;
use interactive_compute_transport::TransportError;
use serde_json::Value;
use thiserror::Error;

/// A completed command reported a non-zero exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailedError {
    pub command: String,
    pub exit_code: i64,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.stderr.is_empty() {
            write!(
                f,
                "Command \"{}\" failed with exit code {}.",
                self.command, self.exit_code
            )
        } else {
            write!(
                f,
                "Command \"{}\" failed with exit code {}:\n{}",
                self.command, self.exit_code, self.stderr
            )
        }
    }
}

impl std::error::Error for CommandFailedError {}

/// Session error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// A task-starting operation was invoked while a task is running.
    #[error("Cannot {action} when not idle (session is {state})")]
    NotIdle {
        action: &'static str,
        state: SessionState,
    },
    #[error(transparent)]
    CommandFailed(#[from] CommandFailedError),
    /// The channel closed while a task awaited completion.
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Broker rejected the session: {0}")]
    HandshakeRejected(Value),
    /// The worker answered the task with an `ERROR` message.
    #[error("Worker error: {0}")]
    Remote(Value),
    #[error("Cannot kill task: only RUN tasks can be killed")]
    NotKillable,
    #[error("Task queue is full ({0} pending)")]
    QueueFull(usize),
    /// A queued task was removed before it started.
    #[error("Task was cancelled")]
    Cancelled,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Failed to encode message: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

//! Observable lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection and execution state of an interactive session.
///
/// `Connecting → Idle ⇄ Busy → Closed`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Channel is opening or the handshake is in flight.
    Connecting,
    /// Open with no task running.
    Idle,
    /// Open with exactly one task running.
    Busy,
    /// Channel closed. No further tasks can run.
    Closed,
}

impl SessionState {
    /// Whether the channel is open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Closed => "closed",
        })
    }
}

/// Status of a task submitted to an admission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is queued but not yet started.
    Pending,
    /// Task is currently running on the session.
    Running,
    /// Task completed.
    Completed,
    /// Task failed.
    Failed,
    /// Task was removed from the queue before it started.
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

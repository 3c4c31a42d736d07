//! Wire messages exchanged with a compute worker.
//!
//! Every frame on the channel is one JSON object:
//!
//! ```json
//! { "sessionID": "<string>", "type": <integer>, "data": <any> }
//! ```
//!
//! The `type` field is the ordinal of [`Kind`]. Both ends must agree on the
//! ordering, so variants are never reordered; new kinds go at the end.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Kind {
    /// A chunk of a command's standard output.
    Stdout = 0,
    /// A chunk of a command's standard error.
    Stderr = 1,
    /// Start a command.
    Run = 2,
    /// Materialize an artifact from storage on the worker.
    AddArtifact = 3,
    /// Terminate the running command.
    Kill = 4,
    /// Write a file on the worker.
    AddFile = 5,
    /// Delete a file on the worker.
    RemoveFile = 6,
    /// Push user data to the worker.
    AddUserData = 7,
    /// The current task finished. Carries its result.
    Complete = 8,
    /// The current task failed on the worker side.
    Error = 9,
    /// Set an environment variable for subsequent commands.
    SetEnv = 10,
    /// Upload a worker file to storage.
    SaveArtifact = 11,
    /// Progress or status report.
    Status = 12,
}

impl Kind {
    /// All kinds, in ordinal order.
    pub const ALL: [Self; 13] = [
        Self::Stdout,
        Self::Stderr,
        Self::Run,
        Self::AddArtifact,
        Self::Kill,
        Self::AddFile,
        Self::RemoveFile,
        Self::AddUserData,
        Self::Complete,
        Self::Error,
        Self::SetEnv,
        Self::SaveArtifact,
        Self::Status,
    ];

    /// Stable string identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::Run => "RUN",
            Self::AddArtifact => "ADD_ARTIFACT",
            Self::Kill => "KILL",
            Self::AddFile => "ADD_FILE",
            Self::RemoveFile => "REMOVE_FILE",
            Self::AddUserData => "ADD_USER_DATA",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
            Self::SetEnv => "SET_ENV",
            Self::SaveArtifact => "SAVE_ARTIFACT",
            Self::Status => "STATUS",
        }
    }

    /// Stable integer identifier.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Whether this kind ends the task it is addressed to.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kind identifier that is not part of the enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown message kind: {0}")]
pub struct UnknownKind(pub String);

impl TryFrom<u8> for Kind {
    type Error = UnknownKind;

    fn try_from(value: u8) -> Result<Self, UnknownKind> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| UnknownKind(value.to_string()))
    }
}

impl From<Kind> for u8 {
    fn from(kind: Kind) -> Self {
        kind.ordinal()
    }
}

impl FromStr for Kind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// A received frame did not match the wire format.
#[derive(Debug, Error)]
#[error("Malformed frame: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// One message on the channel. Constructed per send, parsed per receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Session the message belongs to. Empty when the peer omitted it.
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(session_id: impl Into<String>, kind: Kind, data: Value) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            data,
        }
    }

    /// Create a message with the default payload `0`.
    #[must_use]
    pub fn signal(session_id: impl Into<String>, kind: Kind) -> Self {
        Self::new(session_id, kind, Value::from(0))
    }

    /// Create a message whose binary payload is carried as text.
    #[must_use]
    pub fn from_bytes(session_id: impl Into<String>, kind: Kind, bytes: &[u8]) -> Self {
        Self::new(
            session_id,
            kind,
            Value::String(String::from_utf8_lossy(bytes).into_owned()),
        )
    }

    /// Serialize into a single text frame.
    ///
    /// # Errors
    /// Returns error if the payload cannot be represented as JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a single text frame.
    ///
    /// # Errors
    /// Returns `DecodeError` if the frame is not a valid message.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Payload rendered as text, the way streamed output is accumulated.
    #[must_use]
    pub fn data_text(&self) -> String {
        value_to_text(&self.data)
    }
}

/// Render a payload as text. Strings are taken verbatim, anything else as JSON.
#[must_use]
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Whether a payload counts as "set" (an error value or a non-zero exit code).
///
/// `null`, `false`, `0`, and `""` are unset; everything else is set.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

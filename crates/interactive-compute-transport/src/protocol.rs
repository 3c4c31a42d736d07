//! Session handshake framing.
//!
//! The first frame a client writes on a new connection is not a `Message`
//! but the bare JSON array `[computeID, config]`. The broker answers with a
//! `COMPLETE` message whose payload is an error value (falsy on success).

use interactive_compute_core::{Kind, Message, WorkerSpec, message::is_truthy};
use serde_json::{Map, Value};

use crate::TransportError;

/// Encode the handshake frame for a worker.
///
/// # Errors
/// Returns error if the configuration cannot be serialized.
pub fn handshake_frame(worker: &WorkerSpec) -> Result<String, TransportError> {
    serde_json::to_string(&worker.handshake_payload())
        .map_err(|e| TransportError::Protocol(format!("Invalid handshake: {e}")))
}

/// Parse a handshake frame. Extra trailing elements (e.g. a token) are ignored.
///
/// # Errors
/// Returns error if the frame is not `[string, object?, ...]`.
pub fn parse_handshake(frame: &str) -> Result<WorkerSpec, TransportError> {
    let value: Value = serde_json::from_str(frame)
        .map_err(|e| TransportError::Protocol(format!("Invalid handshake: {e}")))?;
    let Value::Array(items) = value else {
        return Err(TransportError::Protocol("Handshake must be an array".to_string()));
    };
    let mut items = items.into_iter();
    let compute_id = match items.next() {
        Some(Value::String(id)) => id,
        _ => {
            return Err(TransportError::Protocol(
                "Handshake must start with a compute id".to_string(),
            ));
        }
    };
    let config = match items.next() {
        Some(Value::Object(config)) => config,
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            return Err(TransportError::Protocol(format!(
                "Handshake config must be an object, got {other}"
            )));
        }
    };
    Ok(WorkerSpec::with_config(compute_id, config))
}

/// The broker's acknowledgement of a successful handshake.
#[must_use]
pub fn handshake_ack() -> Message {
    Message::signal("", Kind::Complete)
}

/// The broker's rejection of a handshake.
#[must_use]
pub fn handshake_rejection(reason: impl Into<Value>) -> Message {
    Message::new("", Kind::Complete, reason.into())
}

/// Interpret a handshake reply. `Ok(())` on success, `Err(reason)` if rejected.
///
/// # Errors
/// Returns the rejection payload if the broker reported an error.
pub fn handshake_outcome(reply: &Message) -> Result<(), Value> {
    if is_truthy(&reply.data) {
        Err(reply.data.clone())
    } else {
        Ok(())
    }
}

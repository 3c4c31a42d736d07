//! Core building blocks for interactive compute sessions.
//!
//! This crate provides the pieces shared by every side of a session:
//! - `Message` / `Kind` - The wire codec and its closed set of message kinds
//! - `LineCollector` - Reassembles streamed output chunks into lines
//! - `WorkerSpec` - Worker selection sent in the session handshake
//! - `SessionState` / `TaskStatus` - Observable lifecycle states

pub mod line_collector;
pub mod message;
pub mod state;
pub mod worker;

pub use line_collector::LineCollector;
pub use message::{DecodeError, Kind, Message, UnknownKind};
pub use state::{SessionState, TaskStatus};
pub use worker::WorkerSpec;

//! Frame transports for interactive compute sessions.
//!
//! Provides:
//! - `Connection` - A boxed text-frame sink and stream pair
//! - `Connector` - Opens one connection per session
//! - Handshake framing
//! - WebSocket client transport (feature: websocket)
//! - In-memory transport pair for driving a session without a network

pub mod connection;
pub mod memory;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use connection::{Connection, Connector, FrameSink, FrameStream, TransportError};
pub use memory::{MemoryConnector, MemoryPeer};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

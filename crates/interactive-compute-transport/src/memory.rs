//! In-memory transport for driving a session without a network.
//!
//! [`pair`] returns the client side as a regular [`Connection`] and the
//! worker side as a [`MemoryPeer`] that reads what the client wrote and
//! answers with frames of its own.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::sink;
use interactive_compute_core::{DecodeError, Message, WorkerSpec};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    Connection, Connector, TransportError,
    protocol::{handshake_ack, handshake_rejection, parse_handshake},
};

/// Create a connected client/peer pair.
#[must_use]
pub fn pair() -> (Connection, MemoryPeer) {
    let (client_tx, client_rx) = mpsc::unbounded_channel::<String>();
    let (peer_tx, peer_rx) = mpsc::unbounded_channel::<Result<String, TransportError>>();

    let sink = sink::unfold(client_tx, |tx, frame: String| async move {
        tx.send(frame).map_err(|_| TransportError::Closed)?;
        Ok::<_, TransportError>(tx)
    });
    let stream = UnboundedReceiverStream::new(peer_rx);

    let peer = MemoryPeer {
        inbound: client_rx,
        outbound: Some(peer_tx),
    };

    (Connection::new(sink, stream), peer)
}

/// Worker side of an in-memory connection.
pub struct MemoryPeer {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
}

impl MemoryPeer {
    /// Receive the next frame the client wrote. `None` once the client closed.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Receive a frame if one is already buffered.
    pub fn try_recv_frame(&mut self) -> Option<String> {
        self.inbound.try_recv().ok()
    }

    /// Receive and decode the next message.
    pub async fn recv_message(&mut self) -> Option<Result<Message, DecodeError>> {
        let frame = self.recv_frame().await?;
        Some(Message::decode(&frame))
    }

    /// Read the handshake frame and acknowledge it.
    ///
    /// # Errors
    /// Returns error if the client closed or the frame is not a handshake.
    pub async fn accept_handshake(&mut self) -> Result<WorkerSpec, TransportError> {
        let frame = self.recv_frame().await.ok_or(TransportError::Closed)?;
        let worker = parse_handshake(&frame)?;
        self.send_message(&handshake_ack())?;
        Ok(worker)
    }

    /// Read the handshake frame and reject it.
    ///
    /// # Errors
    /// Returns error if the client closed or the frame is not a handshake.
    pub async fn reject_handshake(
        &mut self,
        reason: impl Into<serde_json::Value>,
    ) -> Result<WorkerSpec, TransportError> {
        let frame = self.recv_frame().await.ok_or(TransportError::Closed)?;
        let worker = parse_handshake(&frame)?;
        self.send_message(&handshake_rejection(reason))?;
        Ok(worker)
    }

    /// Write a raw frame to the client.
    ///
    /// # Errors
    /// Returns error if this side was closed.
    pub fn send_frame(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        self.outbound
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(Ok(frame.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Encode and write a message to the client.
    ///
    /// # Errors
    /// Returns error if this side was closed.
    pub fn send_message(&self, msg: &Message) -> Result<(), TransportError> {
        let frame = msg
            .encode()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.send_frame(frame)
    }

    /// Surface a transport failure on the client's stream.
    ///
    /// # Errors
    /// Returns error if this side was closed.
    pub fn fail(&self, error: TransportError) -> Result<(), TransportError> {
        self.outbound
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(Err(error))
            .map_err(|_| TransportError::Closed)
    }

    /// Close the worker side. The client's stream ends.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

/// Connector that hands out one pre-built in-memory connection.
pub struct MemoryConnector {
    connection: Mutex<Option<Connection>>,
}

impl MemoryConnector {
    /// Create a connector and the peer for its single connection.
    #[must_use]
    pub fn new() -> (Self, MemoryPeer) {
        let (connection, peer) = pair();
        let connector = Self {
            connection: Mutex::new(Some(connection)),
        };
        (connector, peer)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        self.connection
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(TransportError::Closed)
    }

    fn address(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use interactive_compute_core::Kind;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connection, mut peer) = pair();
        let (mut sink, mut stream) = connection.split();

        sink.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.recv_frame().await.as_deref(), Some("hello"));

        peer.send_message(&Message::new("s", Kind::Stdout, json!("out")))
            .unwrap();
        let frame = stream.next().await.unwrap().unwrap();
        assert_eq!(Message::decode(&frame).unwrap().data, json!("out"));
    }

    #[tokio::test]
    async fn test_peer_close_ends_stream() {
        let (connection, mut peer) = pair();
        let (_sink, mut stream) = connection.split();
        peer.close();
        assert!(stream.next().await.is_none());
        assert_eq!(peer.send_frame("late"), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_client_drop_ends_peer() {
        let (connection, mut peer) = pair();
        drop(connection);
        assert!(peer.recv_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_connector_is_single_use() {
        let (connector, _peer) = MemoryConnector::new();
        assert!(connector.connect().await.is_ok());
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_accept_handshake() {
        let (connection, mut peer) = pair();
        let (mut sink, mut stream) = connection.split();
        sink.send(r#"["local",{}]"#.to_string()).await.unwrap();

        let worker = peer.accept_handshake().await.unwrap();
        assert_eq!(worker.compute_id, "local");

        let ack = Message::decode(&stream.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(ack.kind, Kind::Complete);
    }
}

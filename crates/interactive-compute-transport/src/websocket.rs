//! WebSocket client transport.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::{Connection, Connector, TransportError};

/// Connects to a broker over a persistent WebSocket (`ws://host:port`).
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    address: String,
}

impl WebSocketConnector {
    /// Create a connector for the given address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.address.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(address = %self.address, "WebSocket connected");

        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
            .with(|frame: String| future::ready(Ok::<_, TransportError>(WsMessage::text(frame))));

        // Binary frames carry text too; anything that is not data is skipped.
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Binary(data)) => Some(Ok(String::from_utf8_lossy(&data).into_owned())),
                Ok(WsMessage::Close(frame)) => {
                    tracing::debug!(?frame, "WebSocket closed by peer");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
            })
        });

        Ok(Connection::new(sink, stream))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

//! Message channel: the single writer and demultiplexer of one connection.
//!
//! Outbound frames go through an unbounded queue drained by a writer task, so
//! `send` never blocks. A reader task decodes every inbound frame and fans it
//! out to all current subscriptions. Malformed frames are logged and dropped.
//! When the connection ends every subscription is dropped, which is how
//! waiting tasks learn that the connection was lost.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::{SinkExt, StreamExt};
use interactive_compute_core::Message;
use interactive_compute_transport::{Connection, FrameSink, FrameStream};
use tokio::sync::{mpsc, watch};

use crate::error::SessionError;

enum Outbound {
    Frame(String),
    Close,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, mpsc::UnboundedSender<Message>)>,
    closed: bool,
}

struct ChannelInner {
    outbound: mpsc::UnboundedSender<Outbound>,
    listeners: Mutex<Listeners>,
    closed: watch::Sender<bool>,
}

impl ChannelInner {
    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, msg: &Message) {
        self.listeners()
            .entries
            .retain(|(_, tx)| tx.send(msg.clone()).is_ok());
    }

    fn unlisten(&self, id: u64) {
        self.listeners().entries.retain(|(entry, _)| *entry != id);
    }

    fn mark_closed(&self) {
        let dropped = {
            let mut listeners = self.listeners();
            if listeners.closed {
                return;
            }
            listeners.closed = true;
            std::mem::take(&mut listeners.entries)
        };
        // Publish before dropping the senders so a subscriber that sees its
        // stream end also sees the channel as closed.
        self.closed.send_replace(true);
        drop(dropped);
    }
}

/// Shared handle to an open channel.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<ChannelInner>,
}

impl MessageChannel {
    /// Take ownership of a connection and start its reader and writer tasks.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn open(connection: Connection) -> Self {
        let (sink, stream) = connection.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(ChannelInner {
            outbound,
            listeners: Mutex::new(Listeners::default()),
            closed,
        });

        tokio::spawn(write_loop(sink, outbound_rx, Arc::downgrade(&inner)));
        tokio::spawn(read_loop(stream, Arc::downgrade(&inner)));

        Self { inner }
    }

    /// Encode and send a message.
    ///
    /// # Errors
    /// Returns `ConnectionLost` if the channel is closed.
    pub fn send(&self, msg: &Message) -> Result<(), SessionError> {
        self.send_frame(msg.encode()?)
    }

    /// Send a raw text frame.
    ///
    /// # Errors
    /// Returns `ConnectionLost` if the channel is closed.
    pub fn send_frame(&self, frame: String) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::ConnectionLost);
        }
        self.inner
            .outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| SessionError::ConnectionLost)
    }

    /// Subscribe to every inbound message from now on.
    ///
    /// On a closed channel the subscription is already finished.
    #[must_use]
    pub fn listen(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.inner.listeners();
        let id = listeners.next_id;
        listeners.next_id += 1;
        if !listeners.closed {
            listeners.entries.push((id, tx));
        }
        Subscription {
            id,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners().entries.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Watch that flips to `true` once the channel closes.
    #[must_use]
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// Flush pending frames, then close the connection.
    pub fn close(&self) {
        let _ = self.inner.outbound.send(Outbound::Close);
        self.inner.mark_closed();
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("closed", &self.is_closed())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// One demultiplexing subscription. Removed from the channel on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    /// Next inbound message. `None` once the channel closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.unlisten(self.id);
        }
    }
}

async fn write_loop(
    mut sink: FrameSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    channel: Weak<ChannelInner>,
) {
    while let Some(next) = outbound.recv().await {
        match next {
            Outbound::Frame(frame) => {
                if let Err(e) = sink.send(frame).await {
                    tracing::error!("Failed to write frame: {e}");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!("Error closing connection: {e}");
    }
    if let Some(channel) = channel.upgrade() {
        channel.mark_closed();
    }
}

async fn read_loop(mut stream: FrameStream, channel: Weak<ChannelInner>) {
    while let Some(frame) = stream.next().await {
        let Some(channel) = channel.upgrade() else {
            return;
        };
        match frame {
            Ok(text) => match Message::decode(&text) {
                Ok(msg) => channel.dispatch(&msg),
                Err(e) => tracing::warn!(error = %e, "Dropping malformed frame"),
            },
            Err(e) => {
                tracing::error!("Channel read failed: {e}");
                channel.mark_closed();
                return;
            }
        }
    }

    tracing::debug!("Connection closed by peer");
    if let Some(channel) = channel.upgrade() {
        channel.mark_closed();
    }
}

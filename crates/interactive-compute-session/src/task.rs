//! One command's lifecycle on a channel.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use interactive_compute_core::{Kind, Message};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    channel::{MessageChannel, Subscription},
    error::SessionError,
};

/// Task identifier, unique within the process.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

type Handler = Box<dyn FnMut(&Value) + Send>;

#[derive(Default)]
struct Listeners {
    handlers: HashMap<Kind, Vec<Handler>>,
    streams: Vec<mpsc::UnboundedSender<Message>>,
}

struct TaskInner {
    id: TaskId,
    message: Message,
    listeners: Mutex<Listeners>,
}

/// A command to run on a session, plus the listeners for its messages.
///
/// Cloning is cheap; clones share listeners and identity.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Create a task that will send `message` when run.
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                message,
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    /// Create a `RUN` task for a command line.
    #[must_use]
    pub fn command(session_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(Message::new(
            session_id,
            Kind::Run,
            Value::String(command.into()),
        ))
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// The message sent when the task starts.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.inner.message.kind
    }

    /// Register a handler for inbound messages of `kind`.
    ///
    /// Handlers for the same kind fire in registration order, once per
    /// message.
    pub fn on<F>(&self, kind: Kind, handler: F) -> &Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.listeners()
            .handlers
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
        self
    }

    /// Receive every message routed to this task from now on.
    ///
    /// The receiver ends once the task finishes.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners().streams.push(tx);
        rx
    }

    /// Send the task's message, then route inbound messages until it completes.
    ///
    /// Resolves with the `COMPLETE` payload. An `ERROR` message fails the task
    /// with [`SessionError::Remote`].
    ///
    /// # Errors
    /// Returns `ConnectionLost` if the channel closes first.
    pub async fn run(&self, channel: &MessageChannel) -> Result<Value, SessionError> {
        let replies = self.dispatch(channel)?;
        self.follow(replies).await
    }

    /// Listen for replies, then queue the task's message on `channel`.
    ///
    /// Frames written to the channel afterwards (a `KILL`, say) go out
    /// behind this one. On failure the task's receivers are ended.
    pub(crate) fn dispatch(&self, channel: &MessageChannel) -> Result<Subscription, SessionError> {
        let replies = channel.listen();
        if let Err(e) = channel.send(&self.inner.message) {
            self.close_streams();
            return Err(e);
        }
        tracing::debug!(task = self.id(), kind = %self.kind(), "Task started");
        Ok(replies)
    }

    /// Route replies from a [`dispatch`](Self::dispatch)ed task until it completes.
    pub(crate) async fn follow(&self, replies: Subscription) -> Result<Value, SessionError> {
        let result = self.route(replies).await;
        self.close_streams();
        result
    }

    /// End every [`subscribe`](Self::subscribe) receiver.
    pub(crate) fn close_streams(&self) {
        self.listeners().streams.clear();
    }

    async fn route(&self, mut replies: Subscription) -> Result<Value, SessionError> {
        while let Some(msg) = replies.recv().await {
            if !self.accepts(&msg) {
                tracing::trace!(
                    task = self.id(),
                    session = %msg.session_id,
                    "Ignoring message for another session"
                );
                continue;
            }

            self.emit(&msg);

            match msg.kind {
                Kind::Complete => {
                    tracing::debug!(task = self.id(), "Task complete");
                    return Ok(msg.data);
                }
                Kind::Error => {
                    tracing::debug!(task = self.id(), error = %msg.data, "Task failed");
                    return Err(SessionError::Remote(msg.data));
                }
                Kind::Stdout
                | Kind::Stderr
                | Kind::Status
                | Kind::Run
                | Kind::AddArtifact
                | Kind::Kill
                | Kind::AddFile
                | Kind::RemoveFile
                | Kind::AddUserData
                | Kind::SetEnv
                | Kind::SaveArtifact => {}
            }
        }

        tracing::debug!(task = self.id(), "Channel closed before completion");
        Err(SessionError::ConnectionLost)
    }

    /// Deliver a message to the registered handlers and subscribers.
    ///
    /// Handlers run outside the listener lock, so they may call
    /// [`on`](Self::on) or [`subscribe`](Self::subscribe). Listeners added
    /// that way see the next message, not this one.
    pub fn emit(&self, msg: &Message) {
        self.listeners()
            .streams
            .retain(|tx| tx.send(msg.clone()).is_ok());

        let taken = self.listeners().handlers.remove(&msg.kind);
        if let Some(mut handlers) = taken {
            for handler in &mut handlers {
                handler(&msg.data);
            }
            let mut listeners = self.listeners();
            let added = listeners.handlers.remove(&msg.kind).unwrap_or_default();
            handlers.extend(added);
            listeners.handlers.insert(msg.kind, handlers);
        }
    }

    // Peers that predate session ids omit the field.
    fn accepts(&self, msg: &Message) -> bool {
        msg.session_id.is_empty() || msg.session_id == self.inner.message.session_id
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Task {}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("message", &self.inner.message)
            .finish_non_exhaustive()
    }
}

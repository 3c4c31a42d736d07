//! Interactive session: one channel to one worker, one task at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use interactive_compute_core::{Kind, Message, SessionState, WorkerSpec};
use interactive_compute_transport::{
    Connection, Connector,
    protocol::{handshake_frame, handshake_outcome},
};
use serde_json::Value;
use tokio::{sync::mpsc, sync::watch, task::JoinHandle};
use uuid::Uuid;

use crate::{
    channel::{MessageChannel, Subscription},
    error::SessionError,
    task::Task,
    traits::{KillOutcome, TaskExecutor, TaskRun, TaskRunner},
};

/// Session behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Stay `Connecting` until the broker acknowledges the handshake.
    pub await_handshake_ack: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            await_handshake_ack: true,
        }
    }
}

struct SessionInner {
    id: String,
    worker: WorkerSpec,
    channel: MessageChannel,
    state: watch::Sender<SessionState>,
    active: Mutex<Option<Task>>,
    close_reason: Mutex<Option<SessionError>>,
}

impl SessionInner {
    fn active(&self) -> MutexGuard<'_, Option<Task>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(session = %self.id, %from, %to, "Session state changed");
        }
        changed
    }

    fn mark_closed(&self) {
        let previous = self.state.send_replace(SessionState::Closed);
        if previous != SessionState::Closed {
            tracing::debug!(session = %self.id, from = %previous, "Session closed");
        }
    }

    fn fail(&self, reason: SessionError) {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(reason);
        self.channel.close();
        self.mark_closed();
    }

    fn closed_error(&self) -> SessionError {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(SessionError::ConnectionLost)
    }

    /// Idle → Busy with `task` as the current task.
    fn begin(&self, task: &Task, action: &'static str) -> Result<(), SessionError> {
        let mut active = self.active();
        let mut refused = None;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Idle && !self.channel.is_closed() {
                *state = SessionState::Busy;
                true
            } else {
                refused = Some(*state);
                false
            }
        });
        if let Some(state) = refused {
            return Err(SessionError::NotIdle { action, state });
        }
        *active = Some(task.clone());
        tracing::debug!(session = %self.id, task = task.id(), kind = %task.kind(), "Session busy");
        Ok(())
    }
}

/// Returns the session to `Idle` (or `Closed`) when the running task ends.
struct BusyGuard {
    inner: Arc<SessionInner>,
    task_id: u64,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        {
            let mut active = self.inner.active();
            if active.as_ref().is_some_and(|task| task.id() == self.task_id) {
                *active = None;
            }
        }
        if self.inner.channel.is_closed() {
            self.inner.mark_closed();
        } else {
            self.inner
                .transition(SessionState::Busy, SessionState::Idle);
        }
    }
}

/// A RUN task started by [`InteractiveSession::spawn`].
pub struct SpawnedTask {
    /// The running task, for late listeners and [`InteractiveSession::kill`].
    pub task: Task,
    /// Every message routed to the task, from the start.
    pub events: mpsc::UnboundedReceiver<Message>,
    completion: JoinHandle<Result<Value, SessionError>>,
}

impl SpawnedTask {
    /// Wait for the task to finish and return its `COMPLETE` payload.
    ///
    /// # Errors
    /// Returns the task's failure, or `Cancelled` if it was aborted.
    pub async fn wait(self) -> Result<Value, SessionError> {
        self.completion.await.unwrap_or(Err(SessionError::Cancelled))
    }
}

impl std::fmt::Debug for SpawnedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedTask")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

/// Owns one persistent channel to one worker and serializes task execution.
///
/// `Connecting → Idle ⇄ Busy → Closed`. Task-starting calls made while the
/// session is not idle fail with [`SessionError::NotIdle`]; use
/// [`QueuedSession`](crate::QueuedSession) to wait for a turn instead.
#[derive(Clone)]
pub struct InteractiveSession {
    inner: Arc<SessionInner>,
}

impl InteractiveSession {
    /// Connect through `connector` and wait for the handshake to finish.
    ///
    /// # Errors
    /// Returns error if the connection fails or the broker rejects the worker.
    pub async fn new<C>(
        connector: &C,
        worker: WorkerSpec,
        options: SessionOptions,
    ) -> Result<Self, SessionError>
    where
        C: Connector + ?Sized,
    {
        tracing::info!(address = connector.address(), compute = %worker.compute_id, "Connecting session");
        let connection = connector.connect().await?;
        let session = Self::open(connection, worker, options);
        session.when_connected().await?;
        Ok(session)
    }

    /// Connect to the broker named by `config` over WebSocket.
    ///
    /// # Errors
    /// Returns error if the connection fails or the broker rejects the worker.
    #[cfg(feature = "websocket")]
    pub async fn connect(
        config: &crate::ClientConfig,
        worker: WorkerSpec,
    ) -> Result<Self, SessionError> {
        let connector =
            interactive_compute_transport::WebSocketConnector::new(config.broker_address());
        Self::new(&connector, worker, config.session_options()).await
    }

    /// Start a session on an open connection. Writes the handshake immediately.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn open(connection: Connection, worker: WorkerSpec, options: SessionOptions) -> Self {
        let channel = MessageChannel::open(connection);
        let (state, _) = watch::channel(SessionState::Connecting);
        let inner = Arc::new(SessionInner {
            id: Uuid::new_v4().to_string(),
            worker,
            channel,
            state,
            active: Mutex::new(None),
            close_reason: Mutex::new(None),
        });

        tokio::spawn(watch_closed(
            inner.channel.closed_signal(),
            Arc::downgrade(&inner),
        ));

        let replies = inner.channel.listen();
        let sent = handshake_frame(&inner.worker)
            .map_err(SessionError::from)
            .and_then(|frame| inner.channel.send_frame(frame));

        match sent {
            Err(e) => {
                tracing::error!(session = %inner.id, "Failed to send handshake: {e}");
                inner.fail(e);
            }
            Ok(()) if options.await_handshake_ack => {
                tokio::spawn(await_ack(replies, Arc::downgrade(&inner)));
            }
            Ok(()) => {
                drop(replies);
                inner.transition(SessionState::Connecting, SessionState::Idle);
            }
        }

        Self { inner }
    }

    /// The generated `sessionID` stamped on every outbound message.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn worker(&self) -> &WorkerSpec {
        &self.inner.worker
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Watch every state transition.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state() == SessionState::Idle && !self.inner.channel.is_closed()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// The task currently running, if any.
    #[must_use]
    pub fn current_task(&self) -> Option<Task> {
        self.inner.active().clone()
    }

    /// Resolves once the handshake has completed.
    ///
    /// # Errors
    /// Returns `HandshakeRejected` or `ConnectionLost` if the session closed instead.
    pub async fn when_connected(&self) -> Result<(), SessionError> {
        let mut states = self.inner.state.subscribe();
        let state = *states
            .wait_for(|state| *state != SessionState::Connecting)
            .await
            .map_err(|_| SessionError::ConnectionLost)?;
        if state == SessionState::Closed {
            Err(self.inner.closed_error())
        } else {
            Ok(())
        }
    }

    /// Resolves once the session is idle. Immediately if it already is.
    ///
    /// The future does not borrow the session.
    pub fn when_ready(&self) -> BoxFuture<'static, Result<(), SessionError>> {
        let inner = Arc::clone(&self.inner);
        let mut states = inner.state.subscribe();
        Box::pin(async move {
            let state = *states
                .wait_for(|state| matches!(state, SessionState::Idle | SessionState::Closed))
                .await
                .map_err(|_| SessionError::ConnectionLost)?;
            if state == SessionState::Idle {
                Ok(())
            } else {
                Err(inner.closed_error())
            }
        })
    }

    /// Create a task addressed to this session.
    #[must_use]
    pub fn task(&self, kind: Kind, data: Value) -> Task {
        Task::new(Message::new(self.id(), kind, data))
    }

    /// Create a `RUN` task for a command line.
    #[must_use]
    pub fn command_task(&self, command: impl Into<String>) -> Task {
        Task::command(self.id(), command)
    }

    /// Mark the session busy, send the task's message, and return the future
    /// that follows `task` to completion.
    ///
    /// The message is queued on the channel before this returns, so a later
    /// [`kill`](Self::kill) always reaches the worker after it. Dropping the
    /// future returns the session to idle.
    ///
    /// # Errors
    /// Returns `NotIdle` unless the session is idle.
    pub fn start_task(&self, task: Task) -> Result<TaskRun, SessionError> {
        self.start(task, "run task")
    }

    fn start(&self, task: Task, action: &'static str) -> Result<TaskRun, SessionError> {
        self.inner.begin(&task, action)?;
        let guard = BusyGuard {
            inner: Arc::clone(&self.inner),
            task_id: task.id(),
        };
        let replies = task.dispatch(&self.inner.channel)?;
        Ok(Box::pin(async move {
            let _guard = guard;
            task.follow(replies).await
        }))
    }

    /// Run `task` to completion.
    ///
    /// # Errors
    /// Returns `NotIdle` if busy, or the task's failure.
    pub async fn run_task(&self, task: Task) -> Result<Value, SessionError> {
        self.start_task(task)?.await
    }

    /// Start a command without waiting for it to finish.
    ///
    /// # Errors
    /// Returns `NotIdle` unless the session is idle.
    pub fn spawn(&self, command: impl Into<String>) -> Result<SpawnedTask, SessionError> {
        let task = self.command_task(command);
        let events = task.subscribe();
        let run = self.start(task.clone(), "spawn a task")?;
        Ok(SpawnedTask {
            task,
            events,
            completion: tokio::spawn(run),
        })
    }

    /// Ask the worker to stop `task`.
    ///
    /// Local state is untouched; the worker's `COMPLETE` or `ERROR` reply ends
    /// the task as usual.
    ///
    /// # Errors
    /// Returns `NotKillable` for non-`RUN` tasks.
    pub fn kill(&self, task: &Task) -> Result<KillOutcome, SessionError> {
        if task.kind() != Kind::Run {
            return Err(SessionError::NotKillable);
        }
        let running = self
            .inner
            .active()
            .as_ref()
            .is_some_and(|current| current == task);
        if !running {
            return Ok(KillOutcome::NotRunning);
        }

        tracing::debug!(session = %self.id(), task = task.id(), "Killing task");
        self.inner
            .channel
            .send(&Message::new(self.id(), Kind::Kill, task.message().data.clone()))?;
        Ok(KillOutcome::Signalled)
    }

    /// Close the channel. A running task fails with `ConnectionLost`.
    pub fn close(&self) {
        tracing::debug!(session = %self.id(), "Closing session");
        self.inner.channel.close();
        self.inner.mark_closed();
    }
}

impl std::fmt::Debug for InteractiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveSession")
            .field("id", &self.inner.id)
            .field("compute_id", &self.inner.worker.compute_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TaskRunner for InteractiveSession {
    fn session_id(&self) -> &str {
        self.id()
    }

    fn is_idle(&self) -> bool {
        Self::is_idle(self)
    }

    fn is_closed(&self) -> bool {
        Self::is_closed(self)
    }

    fn start_task(&self, task: Task) -> Result<TaskRun, SessionError> {
        Self::start_task(self, task)
    }

    fn kill(&self, task: &Task) -> Result<KillOutcome, SessionError> {
        Self::kill(self, task)
    }

    fn when_ready(&self) -> BoxFuture<'static, Result<(), SessionError>> {
        Self::when_ready(self)
    }
}

#[async_trait]
impl TaskExecutor for InteractiveSession {
    fn new_task(&self, kind: Kind, data: Value) -> Task {
        self.task(kind, data)
    }

    async fn execute(&self, task: Task) -> Result<Value, SessionError> {
        let action = operation(task.kind());
        self.start(task, action)?.await
    }
}

/// Names the operation in `NotIdle` errors for a task of `kind`.
const fn operation(kind: Kind) -> &'static str {
    match kind {
        Kind::Run => "exec a task",
        Kind::AddArtifact => "add artifact",
        Kind::SaveArtifact => "save artifact",
        Kind::AddFile => "add file",
        Kind::RemoveFile => "remove file",
        Kind::SetEnv => "set env var",
        Kind::Stdout
        | Kind::Stderr
        | Kind::Status
        | Kind::Kill
        | Kind::AddUserData
        | Kind::Complete
        | Kind::Error => "run task",
    }
}

async fn watch_closed(mut closed: watch::Receiver<bool>, session: Weak<SessionInner>) {
    // Err means the channel itself is gone, which only happens with the session.
    let _ = closed.wait_for(|closed| *closed).await;
    if let Some(inner) = session.upgrade() {
        inner.mark_closed();
    }
}

async fn await_ack(mut replies: Subscription, session: Weak<SessionInner>) {
    while let Some(msg) = replies.recv().await {
        if msg.kind != Kind::Complete {
            continue;
        }
        let Some(inner) = session.upgrade() else {
            return;
        };
        match handshake_outcome(&msg) {
            Ok(()) => {
                tracing::debug!(session = %inner.id, compute = %inner.worker.compute_id, "Handshake acknowledged");
                inner.transition(SessionState::Connecting, SessionState::Idle);
            }
            Err(reason) => {
                tracing::warn!(session = %inner.id, %reason, "Broker rejected session");
                inner.fail(SessionError::HandshakeRejected(reason));
            }
        }
        return;
    }
}

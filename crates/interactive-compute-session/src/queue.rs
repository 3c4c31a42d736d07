//! FIFO admission in front of a task runner.
//!
//! Callers submit tasks at any time; the queue starts them one by one, in
//! arrival order, whenever the runner is idle. A task removed while still
//! pending is never transmitted and its ticket settles as
//! [`Settled::Cancelled`].

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use async_trait::async_trait;
use interactive_compute_core::{Kind, Message, TaskStatus};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    config::ClientConfig,
    error::SessionError,
    session::InteractiveSession,
    task::{Task, TaskId},
    traits::{KillOutcome, TaskExecutor, TaskRunner},
};

/// Default advisory queue size.
pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// How a queued task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    /// The task ran and the worker sent `COMPLETE` with this payload.
    Completed(Value),
    /// The task ran (or could not be started) and failed.
    Failed(SessionError),
    /// The task was removed from the queue before it started.
    Cancelled,
}

impl Settled {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        match self {
            Self::Completed(_) => TaskStatus::Completed,
            Self::Failed(_) => TaskStatus::Failed,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }

    /// Collapse into a result. Cancellation becomes [`SessionError::Cancelled`].
    ///
    /// # Errors
    /// Returns the failure, or `Cancelled`.
    pub fn into_result(self) -> Result<Value, SessionError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(e) => Err(e),
            Self::Cancelled => Err(SessionError::Cancelled),
        }
    }
}

impl From<Result<Value, SessionError>> for Settled {
    fn from(result: Result<Value, SessionError>) -> Self {
        match result {
            Ok(value) => Self::Completed(value),
            Err(e) => Self::Failed(e),
        }
    }
}

struct QueuedTask {
    task: Task,
    settle: oneshot::Sender<Settled>,
    status: watch::Sender<TaskStatus>,
}

impl QueuedTask {
    fn settle(self, outcome: Settled) {
        tracing::debug!(task = self.task.id(), status = ?outcome.status(), "Queued task settled");
        self.task.close_streams();
        self.status.send_replace(outcome.status());
        let _ = self.settle.send(outcome);
    }
}

/// Future for a queued task's outcome.
///
/// Resolves only once the task has run or been cancelled.
#[derive(Debug)]
pub struct TaskTicket {
    task_id: TaskId,
    outcome: oneshot::Receiver<Settled>,
    status: watch::Receiver<TaskStatus>,
}

impl TaskTicket {
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    #[must_use]
    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Watch status transitions (`Pending → Running → ...`).
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<TaskStatus> {
        self.status.clone()
    }
}

impl Future for TaskTicket {
    type Output = Settled;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the queue itself went away.
        Pin::new(&mut self.outcome)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Settled::Cancelled))
    }
}

/// A RUN task submitted through [`QueuedSession::spawn`].
#[derive(Debug)]
pub struct QueuedSpawn {
    pub task: Task,
    /// Messages routed to the task once it starts.
    pub events: mpsc::UnboundedReceiver<Message>,
    pub ticket: TaskTicket,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedTask>,
    running: bool,
    waiting: bool,
}

struct QueueInner<R> {
    runner: R,
    capacity: usize,
    enforce_capacity: bool,
    state: Mutex<QueueState>,
}

impl<R> QueueInner<R> {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A task runner with FIFO admission control.
///
/// Holds the runner rather than extending it: the runner still rejects direct
/// task starts while busy, and the queue only ever starts a task when the
/// runner reports idle.
pub struct QueuedSession<R: TaskRunner = InteractiveSession> {
    inner: Arc<QueueInner<R>>,
}

impl<R: TaskRunner> Clone for QueuedSession<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: TaskRunner> QueuedSession<R> {
    /// Wrap `runner` with the default advisory capacity.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self::with_capacity(runner, DEFAULT_QUEUE_CAPACITY, false)
    }

    /// Wrap `runner`. With `enforce` set, admissions past `capacity` pending
    /// tasks fail with [`SessionError::QueueFull`].
    #[must_use]
    pub fn with_capacity(runner: R, capacity: usize, enforce: bool) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                runner,
                capacity,
                enforce_capacity: enforce,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    #[must_use]
    pub fn from_config(runner: R, config: &ClientConfig) -> Self {
        Self::with_capacity(runner, config.queue_capacity, config.enforce_queue_capacity)
    }

    /// The wrapped runner.
    #[must_use]
    pub fn session(&self) -> &R {
        &self.inner.runner
    }

    /// Number of tasks waiting to start.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Submit a task. The returned ticket settles once the task has run.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `QueueFull` if the capacity is enforced and reached.
    pub fn run(&self, task: Task) -> Result<TaskTicket, SessionError> {
        let (settle, outcome) = oneshot::channel();
        let (status, status_rx) = watch::channel(TaskStatus::Pending);
        let ticket = TaskTicket {
            task_id: task.id(),
            outcome,
            status: status_rx,
        };

        {
            let mut state = self.inner.state();
            if state.pending.len() >= self.inner.capacity {
                if self.inner.enforce_capacity {
                    tracing::warn!(capacity = self.inner.capacity, "Task queue full");
                    return Err(SessionError::QueueFull(self.inner.capacity));
                }
                tracing::warn!(
                    capacity = self.inner.capacity,
                    depth = state.pending.len() + 1,
                    "Task queue over capacity"
                );
            }
            tracing::debug!(task = task.id(), depth = state.pending.len() + 1, "Task queued");
            state.pending.push_back(QueuedTask {
                task,
                settle,
                status,
            });
        }

        advance(&self.inner);
        Ok(ticket)
    }

    /// Submit a command, keeping a handle to the task and its events.
    ///
    /// # Errors
    /// Returns `QueueFull` if the capacity is enforced and reached.
    pub fn spawn(&self, command: impl Into<String>) -> Result<QueuedSpawn, SessionError> {
        let task = Task::command(self.inner.runner.session_id(), command);
        let events = task.subscribe();
        let ticket = self.run(task.clone())?;
        Ok(QueuedSpawn {
            task,
            events,
            ticket,
        })
    }

    /// Cancel a pending task, or forward a kill for the running one.
    ///
    /// # Errors
    /// Returns `NotKillable` if `task` is running and is not a `RUN` task.
    pub fn kill(&self, task: &Task) -> Result<KillOutcome, SessionError> {
        let removed = {
            let mut state = self.inner.state();
            state
                .pending
                .iter()
                .position(|entry| entry.task == *task)
                .and_then(|index| state.pending.remove(index))
        };

        match removed {
            Some(entry) => {
                entry.settle(Settled::Cancelled);
                Ok(KillOutcome::Dequeued)
            }
            None => self.inner.runner.kill(task),
        }
    }
}

impl<R: TaskRunner> std::fmt::Debug for QueuedSession<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedSession")
            .field("session_id", &self.inner.runner.session_id())
            .field("pending", &self.len())
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<R: TaskRunner> TaskExecutor for QueuedSession<R> {
    fn new_task(&self, kind: Kind, data: Value) -> Task {
        Task::new(Message::new(self.inner.runner.session_id(), kind, data))
    }

    async fn execute(&self, task: Task) -> Result<Value, SessionError> {
        self.run(task)?.await.into_result()
    }
}

/// Start queued tasks for as long as the runner accepts them.
fn advance<R: TaskRunner>(inner: &Arc<QueueInner<R>>) {
    let mut state = inner.state();
    loop {
        if state.running || state.pending.is_empty() {
            return;
        }

        if inner.runner.is_closed() {
            tracing::debug!(rejected = state.pending.len(), "Session closed, rejecting queued tasks");
            for entry in state.pending.drain(..) {
                entry.settle(Settled::Failed(SessionError::ConnectionLost));
            }
            return;
        }

        if !inner.runner.is_idle() {
            wait_for_ready(inner, &mut state);
            return;
        }

        let Some(entry) = state.pending.pop_front() else {
            return;
        };

        match inner.runner.start_task(entry.task.clone()) {
            Ok(run) => {
                state.running = true;
                entry.status.send_replace(TaskStatus::Running);
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    let outcome = Settled::from(run.await);
                    entry.settle(outcome);
                    inner.state().running = false;
                    advance(&inner);
                });
                return;
            }
            // Someone started a task directly on the runner since the check.
            Err(SessionError::NotIdle { .. }) => {
                state.pending.push_front(entry);
                wait_for_ready(inner, &mut state);
                return;
            }
            Err(e) => entry.settle(Settled::Failed(e)),
        }
    }
}

fn wait_for_ready<R: TaskRunner>(inner: &Arc<QueueInner<R>>, state: &mut QueueState) {
    if state.waiting {
        return;
    }
    state.waiting = true;
    let ready = inner.runner.when_ready();
    let queue = Arc::downgrade(inner);
    tokio::spawn(async move {
        // Closed runners are handled by `advance`.
        let _ = ready.await;
        if let Some(inner) = queue.upgrade() {
            inner.state().waiting = false;
            advance(&inner);
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use interactive_compute_core::WorkerSpec;
    use interactive_compute_transport::{MemoryPeer, memory};
    use serde_json::json;
    use tokio::time::{sleep, timeout};
    use tokio_test::{assert_pending, task::spawn as mock_spawn};

    use super::*;
    use crate::{commands::Commands, session::SessionOptions};

    const WAIT: Duration = Duration::from_secs(2);

    async fn queued() -> (QueuedSession, MemoryPeer) {
        let (connection, mut peer) = memory::pair();
        let session = InteractiveSession::open(
            connection,
            WorkerSpec::new("local"),
            SessionOptions::default(),
        );
        peer.accept_handshake().await.unwrap();
        timeout(WAIT, session.when_connected())
            .await
            .unwrap()
            .unwrap();
        (QueuedSession::new(session), peer)
    }

    async fn next_run(peer: &mut MemoryPeer) -> Message {
        let msg = timeout(WAIT, peer.recv_message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind, Kind::Run);
        msg
    }

    async fn assert_quiet(peer: &mut MemoryPeer) {
        sleep(Duration::from_millis(50)).await;
        assert_eq!(peer.try_recv_frame(), None);
    }

    fn complete(peer: &MemoryPeer, queue: &QueuedSession, code: i64) {
        peer.send_message(&Message::new(
            queue.session().id(),
            Kind::Complete,
            json!(code),
        ))
        .unwrap();
    }

    #[tokio::test]
    async fn test_runs_in_submission_order() {
        let (queue, mut peer) = queued().await;
        let a = queue.spawn("A").unwrap();
        let b = queue.spawn("B").unwrap();
        let c = queue.spawn("C").unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(a.ticket.status(), TaskStatus::Running);
        assert_eq!(b.ticket.status(), TaskStatus::Pending);

        for (name, code) in [("A", 0), ("B", 1), ("C", 2)] {
            let run = next_run(&mut peer).await;
            assert_eq!(run.data, json!(name));
            assert_quiet(&mut peer).await;
            complete(&peer, &queue, code);
        }

        assert_eq!(timeout(WAIT, a.ticket).await.unwrap(), Settled::Completed(json!(0)));
        assert_eq!(timeout(WAIT, b.ticket).await.unwrap(), Settled::Completed(json!(1)));
        assert_eq!(timeout(WAIT, c.ticket).await.unwrap(), Settled::Completed(json!(2)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let (queue, mut peer) = queued().await;
        let a = queue.spawn("A").unwrap();
        let mut b = queue.spawn("B").unwrap();
        let c = queue.spawn("C").unwrap();
        next_run(&mut peer).await;

        assert_eq!(queue.kill(&b.task), Ok(KillOutcome::Dequeued));
        assert!(b.events.recv().await.is_none());
        assert_eq!(b.ticket.status(), TaskStatus::Cancelled);
        assert!(timeout(WAIT, b.ticket).await.unwrap().is_cancelled());
        assert_eq!(queue.len(), 1);

        complete(&peer, &queue, 0);
        assert_eq!(timeout(WAIT, a.ticket).await.unwrap(), Settled::Completed(json!(0)));

        // B is skipped entirely; C is next on the wire.
        assert_eq!(next_run(&mut peer).await.data, json!("C"));
        complete(&peer, &queue, 0);
        assert_eq!(timeout(WAIT, c.ticket).await.unwrap(), Settled::Completed(json!(0)));
    }

    #[tokio::test]
    async fn test_kill_running_task_is_forwarded() {
        let (queue, mut peer) = queued().await;
        let a = queue.spawn("sleep 100").unwrap();
        next_run(&mut peer).await;

        assert_eq!(queue.kill(&a.task), Ok(KillOutcome::Signalled));
        let kill = peer.recv_message().await.unwrap().unwrap();
        assert_eq!(kill.kind, Kind::Kill);
        assert_eq!(kill.data, json!("sleep 100"));
    }

    #[tokio::test]
    async fn test_kill_after_dispatch_follows_run() {
        let (queue, mut peer) = queued().await;
        let a = queue.spawn("sleep 100").unwrap();
        let b = queue.spawn("B").unwrap();
        assert_eq!(queue.kill(&a.task), Ok(KillOutcome::Signalled));

        assert_eq!(next_run(&mut peer).await.data, json!("sleep 100"));
        let kill = timeout(WAIT, peer.recv_message()).await.unwrap().unwrap().unwrap();
        assert_eq!(kill.kind, Kind::Kill);
        complete(&peer, &queue, 137);
        assert_eq!(timeout(WAIT, a.ticket).await.unwrap(), Settled::Completed(json!(137)));

        // B is dispatched as A settles; killing it straight away still trails its RUN.
        let mut status = b.ticket.status_changes();
        timeout(WAIT, status.wait_for(|s| *s == TaskStatus::Running))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.kill(&b.task), Ok(KillOutcome::Signalled));
        assert_eq!(next_run(&mut peer).await.data, json!("B"));
        let kill = timeout(WAIT, peer.recv_message()).await.unwrap().unwrap().unwrap();
        assert_eq!((kill.kind, kill.data), (Kind::Kill, json!("B")));
    }

    #[tokio::test]
    async fn test_cancel_keeps_order_of_the_rest() {
        let (queue, mut peer) = queued().await;
        let spawned: Vec<_> = ["A", "B", "C", "D"]
            .into_iter()
            .map(|name| queue.spawn(name).unwrap())
            .collect();
        assert_eq!(queue.kill(&spawned[1].task), Ok(KillOutcome::Dequeued));

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(next_run(&mut peer).await.data);
            complete(&peer, &queue, 0);
        }
        assert_eq!(order, vec![json!("A"), json!("C"), json!("D")]);
        assert_quiet(&mut peer).await;

        let settled: Vec<_> = futures::future::join_all(spawned.into_iter().map(|s| s.ticket)).await;
        assert_eq!(
            settled,
            vec![
                Settled::Completed(json!(0)),
                Settled::Cancelled,
                Settled::Completed(json!(0)),
                Settled::Completed(json!(0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_ticket_pending_until_complete() {
        let (queue, mut peer) = queued().await;
        let mut a = queue.spawn("A").unwrap();
        assert_pending!(mock_spawn(&mut a.ticket).poll());

        next_run(&mut peer).await;
        assert_pending!(mock_spawn(&mut a.ticket).poll());
        assert_eq!(a.ticket.status(), TaskStatus::Running);
        complete(&peer, &queue, 0);
        assert_eq!(timeout(WAIT, a.ticket).await.unwrap(), Settled::Completed(json!(0)));
    }

    #[tokio::test]
    async fn test_connection_lost_rejects_queue() {
        let (queue, mut peer) = queued().await;
        let a = queue.spawn("A").unwrap();
        let b = queue.spawn("B").unwrap();
        next_run(&mut peer).await;
        peer.close();

        assert_eq!(
            timeout(WAIT, a.ticket).await.unwrap(),
            Settled::Failed(SessionError::ConnectionLost)
        );
        assert_eq!(
            timeout(WAIT, b.ticket).await.unwrap(),
            Settled::Failed(SessionError::ConnectionLost)
        );
        assert!(queue.is_empty());

        let late = queue.spawn("C").unwrap();
        assert_eq!(
            timeout(WAIT, late.ticket).await.unwrap(),
            Settled::Failed(SessionError::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn test_enforced_capacity() {
        let (connection, _peer) = memory::pair();
        let session = InteractiveSession::open(
            connection,
            WorkerSpec::new("local"),
            SessionOptions::default(),
        );
        let queue = QueuedSession::with_capacity(session, 1, true);

        let first = queue.spawn("A").unwrap();
        assert_eq!(first.ticket.status(), TaskStatus::Pending);
        assert_eq!(
            queue.spawn("B").unwrap_err(),
            SessionError::QueueFull(1)
        );
        assert_eq!(queue.capacity(), 1);
    }

    #[tokio::test]
    async fn test_advisory_capacity_admits_past_size() {
        let (connection, _peer) = memory::pair();
        let session = InteractiveSession::open(
            connection,
            WorkerSpec::new("local"),
            SessionOptions::default(),
        );
        let config = ClientConfig {
            queue_capacity: 1,
            ..ClientConfig::default()
        };
        let queue = QueuedSession::from_config(session, &config);
        for name in ["A", "B", "C"] {
            queue.spawn(name).unwrap();
        }
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_waits_for_direct_task() {
        let (queue, mut peer) = queued().await;
        let direct = queue.session().spawn("direct").unwrap();
        assert_eq!(next_run(&mut peer).await.data, json!("direct"));

        let exec = tokio::spawn({
            let queue = queue.clone();
            async move { queue.exec("queued").await }
        });
        assert_quiet(&mut peer).await;
        assert_eq!(queue.len(), 1);

        complete(&peer, &queue, 0);
        direct.wait().await.unwrap();

        assert_eq!(next_run(&mut peer).await.data, json!("queued"));
        peer.send_message(&Message::new(
            queue.session().id(),
            Kind::Stdout,
            json!("done\n"),
        ))
        .unwrap();
        complete(&peer, &queue, 0);

        let output = timeout(WAIT, exec).await.unwrap().unwrap().unwrap();
        assert_eq!(output.stdout, "done\n");
    }

    #[tokio::test]
    async fn test_waits_for_handshake() {
        let (connection, mut peer) = memory::pair();
        let session = InteractiveSession::open(
            connection,
            WorkerSpec::new("local"),
            SessionOptions::default(),
        );
        let queue = QueuedSession::new(session);
        let a = queue.spawn("A").unwrap();

        peer.accept_handshake().await.unwrap();
        assert_eq!(next_run(&mut peer).await.data, json!("A"));
        complete(&peer, &queue, 0);
        assert_eq!(timeout(WAIT, a.ticket).await.unwrap(), Settled::Completed(json!(0)));
    }

    #[tokio::test]
    async fn test_queued_commands_run_back_to_back() {
        let (queue, mut peer) = queued().await;
        let set = tokio::spawn({
            let queue = queue.clone();
            async move { queue.set_env_var("EPOCHS", "3").await }
        });
        let add = tokio::spawn({
            let queue = queue.clone();
            async move { queue.add_file("a.txt", "x").await }
        });

        let first = timeout(WAIT, peer.recv_message()).await.unwrap().unwrap().unwrap();
        complete(&peer, &queue, 0);
        let second = timeout(WAIT, peer.recv_message()).await.unwrap().unwrap().unwrap();
        complete(&peer, &queue, 0);

        let mut kinds = [first.kind, second.kind];
        kinds.sort_by_key(|kind| kind.ordinal());
        assert_eq!(kinds, [Kind::AddFile, Kind::SetEnv]);
        assert_eq!(timeout(WAIT, set).await.unwrap().unwrap(), Ok(()));
        assert_eq!(timeout(WAIT, add).await.unwrap().unwrap(), Ok(()));
    }

    #[test]
    fn test_settled_into_result() {
        assert_eq!(Settled::Completed(json!(1)).into_result(), Ok(json!(1)));
        assert_eq!(Settled::Cancelled.into_result(), Err(SessionError::Cancelled));
        assert_eq!(
            Settled::from(Err(SessionError::ConnectionLost)),
            Settled::Failed(SessionError::ConnectionLost)
        );
    }
}

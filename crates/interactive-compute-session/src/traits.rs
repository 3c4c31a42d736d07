//! Capability traits shared by sessions and the admission queue.

use async_trait::async_trait;
use futures::future::BoxFuture;
use interactive_compute_core::Kind;
use serde_json::Value;

use crate::{error::SessionError, task::Task};

/// A started task. Resolves with the `COMPLETE` payload.
///
/// The runner stays busy until this future completes or is dropped.
pub type TaskRun = BoxFuture<'static, Result<Value, SessionError>>;

/// Result of a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The task was still queued and has been removed without starting.
    Dequeued,
    /// A `KILL` message was sent for the running task.
    Signalled,
    /// The task is neither queued nor running.
    NotRunning,
}

/// Something that runs one task at a time over a channel.
pub trait TaskRunner: Send + Sync + 'static {
    /// Identifier stamped on every outbound message.
    fn session_id(&self) -> &str;

    /// Open with no task running.
    fn is_idle(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Mark the runner busy and send `task`'s message.
    ///
    /// The message is queued before this returns; the returned future only
    /// follows the task to completion.
    ///
    /// # Errors
    /// Returns `NotIdle` if a task is already running or the channel is not open.
    fn start_task(&self, task: Task) -> Result<TaskRun, SessionError>;

    /// Ask the peer to stop `task` if it is the running one.
    ///
    /// # Errors
    /// Returns `NotKillable` for non-`RUN` tasks.
    fn kill(&self, task: &Task) -> Result<KillOutcome, SessionError>;

    /// Resolves once the runner is idle.
    ///
    /// Fails if the runner closes first.
    fn when_ready(&self) -> BoxFuture<'static, Result<(), SessionError>>;
}

/// Creates tasks and executes them to completion.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Build a task addressed to this executor's session.
    fn new_task(&self, kind: Kind, data: Value) -> Task;

    /// Execute a task and return its completion payload.
    async fn execute(&self, task: Task) -> Result<Value, SessionError>;
}

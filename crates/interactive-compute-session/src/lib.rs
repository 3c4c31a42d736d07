//! Interactive compute sessions.
//!
//! Provides:
//! - `InteractiveSession` - One channel to one worker, one task at a time
//! - `QueuedSession` - FIFO admission in front of any `TaskRunner`
//! - `Task` - A command's lifecycle and its typed message listeners
//! - `Commands` - exec, artifact, file and environment operations
//! - `ClientConfig` - Broker address and queue settings

pub mod channel;
pub mod command;
pub mod commands;
pub mod config;
pub mod error;
pub mod queue;
pub mod session;
pub mod task;
pub mod traits;

pub use channel::{MessageChannel, Subscription};
pub use command::{CommandLine, CommandLineError};
pub use commands::{Commands, ExecOutput};
pub use config::ClientConfig;
pub use error::{CommandFailedError, ConfigError, SessionError};
pub use queue::{QueuedSession, QueuedSpawn, Settled, TaskTicket};
pub use session::{InteractiveSession, SessionOptions, SpawnedTask};
pub use task::{Task, TaskId};
pub use traits::{KillOutcome, TaskExecutor, TaskRun, TaskRunner};

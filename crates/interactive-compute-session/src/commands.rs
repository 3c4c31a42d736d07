//! Worker commands built on task execution.
//!
//! Every [`TaskExecutor`] gets these for free: on an `InteractiveSession`
//! they fail with `NotIdle` while busy, on a `QueuedSession` they wait their
//! turn.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use interactive_compute_core::{Kind, message::{is_truthy, value_to_text}};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    command::CommandLine,
    error::{CommandFailedError, SessionError},
    traits::TaskExecutor,
};

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Interpret a `COMPLETE` payload as an exit code.
///
/// A process that ended without a status (killed by a signal) reports `null`,
/// which maps to `-1`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn exit_code(data: &Value) -> i64 {
    match data {
        Value::Null => -1,
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(1),
        other => i64::from(is_truthy(other)),
    }
}

fn check_exit(command: &str, data: &Value) -> Result<(), SessionError> {
    match exit_code(data) {
        0 => Ok(()),
        code => Err(CommandFailedError {
            command: command.to_string(),
            exit_code: code,
            stderr: String::new(),
        }
        .into()),
    }
}

/// Convenience operations available on every executor.
#[async_trait]
pub trait Commands: TaskExecutor {
    /// Run a command line and collect its output.
    ///
    /// # Errors
    /// Returns `CommandFailed` if the exit code is non-zero.
    async fn exec(&self, command: &str) -> Result<ExecOutput, SessionError> {
        let task = self.new_task(Kind::Run, Value::String(command.to_string()));
        let output = Arc::new(Mutex::new(ExecOutput::default()));

        let stdout = Arc::clone(&output);
        task.on(Kind::Stdout, move |data| {
            stdout
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .stdout
                .push_str(&value_to_text(data));
        });
        let stderr = Arc::clone(&output);
        task.on(Kind::Stderr, move |data| {
            stderr
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .stderr
                .push_str(&value_to_text(data));
        });

        let data = self.execute(task).await?;
        let mut output = std::mem::take(&mut *output.lock().unwrap_or_else(PoisonError::into_inner));
        output.exit_code = exit_code(&data);

        if output.exit_code != 0 {
            return Err(CommandFailedError {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            }
            .into());
        }
        Ok(output)
    }

    /// Run a quoted program and arguments.
    ///
    /// # Errors
    /// Returns `CommandFailed` if the exit code is non-zero.
    async fn exec_line(&self, line: &CommandLine) -> Result<ExecOutput, SessionError> {
        self.exec(line.as_str()).await
    }

    /// Materialize a stored artifact in the worker's `artifacts/<name>` directory.
    ///
    /// # Errors
    /// Returns `CommandFailed` if the worker could not fetch it.
    async fn add_artifact(
        &self,
        name: &str,
        data_descriptor: Value,
        artifact_type: &str,
        config: Value,
    ) -> Result<(), SessionError> {
        let config = if config.is_null() { json!({}) } else { config };
        let task = self.new_task(
            Kind::AddArtifact,
            json!([name, data_descriptor, artifact_type, config]),
        );
        let data = self.execute(task).await?;
        check_exit("addArtifact", &data)
    }

    /// Upload a worker file to storage and return its data descriptor.
    ///
    /// # Errors
    /// Returns `CommandFailed` if the upload failed.
    async fn save_artifact(
        &self,
        path: &str,
        name: &str,
        storage_id: &str,
        config: Value,
    ) -> Result<Value, SessionError> {
        let task = self.new_task(Kind::SaveArtifact, json!([path, name, storage_id, config]));
        let data = self.execute(task).await?;

        let (code, descriptor) = match data {
            Value::Array(items) => {
                let mut items = items.into_iter();
                let code = items.next().unwrap_or(Value::Null);
                (code, items.next().unwrap_or(Value::Null))
            }
            other => (other, Value::Null),
        };
        check_exit("saveArtifact", &code)?;
        Ok(descriptor)
    }

    /// Write a file on the worker, creating parent directories.
    ///
    /// # Errors
    /// Returns `CommandFailed` if the write failed.
    async fn add_file(&self, path: &str, content: &str) -> Result<(), SessionError> {
        let data = self
            .execute(self.new_task(Kind::AddFile, json!([path, content])))
            .await?;
        check_exit("addFile", &data)
    }

    /// # Errors
    /// Returns `CommandFailed` if the removal failed.
    async fn remove_file(&self, path: &str) -> Result<(), SessionError> {
        let data = self
            .execute(self.new_task(Kind::RemoveFile, json!([path])))
            .await?;
        check_exit("removeFile", &data)
    }

    /// Set an environment variable for subsequent commands.
    ///
    /// # Errors
    /// Returns `CommandFailed` if the worker refused it.
    async fn set_env_var(&self, name: &str, value: &str) -> Result<(), SessionError> {
        let data = self
            .execute(self.new_task(Kind::SetEnv, json!([name, value])))
            .await?;
        check_exit("setEnvVar", &data)
    }
}

impl<T: TaskExecutor + ?Sized> Commands for T {}

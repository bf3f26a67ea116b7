//! Task-level error types.

use thiserror::Error;

use crate::fs::FsError;

/// Errors returned by a task's `execute` method.
///
/// The executor uses the variant to decide retry behaviour:
/// - `Retryable`: the task is re-run with exponential back-off, up to the
///   workflow's retry budget.
/// - everything else: the task is failed immediately.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Transient failure; the executor may re-run the task.
    #[error("retryable task error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal task error: {0}")]
    Fatal(String),

    /// A required input is absent or has the wrong shape.
    #[error("invalid input '{input}': {reason}")]
    InvalidInput { input: &'static str, reason: String },

    /// `shell_cmd` refused to spawn a command outside the allow-list.
    #[error("command not allowed: '{0}'")]
    CommandNotAllowed(String),

    /// The task observed cancellation and stopped.
    #[error("task cancelled")]
    Cancelled,

    /// Sandboxed file operation failed.
    #[error(transparent)]
    FileSystem(#[from] FsError),
}

impl TaskError {
    /// Shorthand for a missing required input.
    pub fn missing(input: &'static str) -> Self {
        Self::InvalidInput {
            input,
            reason: "missing".into(),
        }
    }

    /// Whether the executor is allowed to retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Registry lookup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task type '{0}' is not registered")]
    NotRegistered(String),
}

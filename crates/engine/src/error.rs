//! Engine-level error types.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::models::{ExecutionStatus, WorkflowExecution};

// ------ Graph errors ------

/// Errors raised while building or ordering a [`Dag`](crate::dag::Dag).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DagError {
    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNode(String),

    /// An edge references a node ID that doesn't exist in the graph.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNode {
        node_id: String,
        side: &'static str,
    },

    /// The graph is not acyclic. Lists the nodes that could not be ordered.
    #[error("cyclic dependency among: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

// ------ Validation errors ------

/// A workflow definition was rejected before any task started.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(transparent)]
    Dag(#[from] DagError),

    #[error("invalid task type '{task_type}' for task '{task_id}'")]
    InvalidTaskType { task_id: String, task_type: String },

    #[error("command not allowed: task '{task_id}' runs '{command}'")]
    CommandNotAllowed { task_id: String, command: String },

    #[error("task '{task_id}' is missing required input '{input}'")]
    MissingInput {
        task_id: String,
        input: &'static str,
    },

    #[error("unsupported schema_version {found} (expected {expected})")]
    UnsupportedSchemaVersion { found: u32, expected: u32 },

    #[error("malformed workflow definition: {0}")]
    Malformed(String),
}

/// Loading or saving a workflow definition document failed.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported definition format: '{0}' (expected .json, .yaml or .yml)")]
    UnsupportedFormat(String),

    #[error("cannot serialize workflow definition: {0}")]
    Serialize(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

// ------ Execution errors ------

/// One task's `execute` failed or timed out.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("task '{task_id}' failed: {message}")]
pub struct TaskExecutionError {
    pub task_id: String,
    pub message: String,
    pub timed_out: bool,
}

/// Every task failure of one run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub struct AggregateExecutionError {
    pub failures: Vec<TaskExecutionError>,
}

impl AggregateExecutionError {
    pub fn task_ids(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.task_id.as_str()).collect()
    }
}

impl fmt::Display for AggregateExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} task(s) failed: {}",
            self.failures.len(),
            self.task_ids().join(", ")
        )
    }
}

/// Why a run that did start ended unsuccessfully.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error(transparent)]
    TaskFailures(#[from] AggregateExecutionError),

    #[error("execution cancelled after {completed} task(s) completed")]
    Cancelled { completed: usize },
}

// ------ Execution record errors ------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal status transition {from} -> {to}")]
    Illegal {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("completed_at must be {expected} while status is {status}")]
    CompletedAt {
        status: ExecutionStatus,
        expected: &'static str,
    },
}

// ------ Checkpoint errors ------

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint found for workflow '{0}'")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("corrupt checkpoint record: {0}")]
    Corrupt(String),
}

// ------ Top-level errors ------

/// Errors returned by [`Engine`](crate::engine::Engine).
///
/// `Validation` and `Configuration` mean nothing ran. `Execution` means the
/// run started; the partial execution record travels with the error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("engine configuration error: {0}")]
    Configuration(String),

    #[error("workflow execution failed: {source}")]
    Execution {
        execution: Box<WorkflowExecution>,
        #[source]
        source: ExecutorError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl EngineError {
    /// The partial execution record, when the run got far enough to have one.
    pub fn execution(&self) -> Option<&WorkflowExecution> {
        match self {
            Self::Execution { execution, .. } => Some(execution),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Execution {
                source: ExecutorError::Cancelled { .. },
                ..
            }
        )
    }
}

//! `engine` crate: domain models, DAG scheduling, checkpointing and the
//! workflow engine.

pub mod checkpoint;
pub mod dag;
pub mod engine;
pub mod error;
pub mod executor;
pub mod loader;
pub mod models;

pub use checkpoint::{CheckpointManager, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use dag::Dag;
pub use engine::{Engine, EngineConfig};
pub use error::{
    AggregateExecutionError, CheckpointError, DagError, EngineError, ExecutorError, LoadError,
    TaskExecutionError, ValidationError,
};
pub use executor::{ExecutionOutcome, ExecutorConfig, ParallelExecutor};
pub use models::{
    Checkpoint, ExecutionStatus, TaskExecution, TaskResult, TaskStatus, WorkflowDefinition,
    WorkflowExecution, WorkflowTask,
};

#[cfg(test)]
mod executor_tests;

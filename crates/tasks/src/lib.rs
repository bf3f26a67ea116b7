//! `tasks` crate: the `Task` trait, the type-tag registry and the built-in
//! task implementations.
//!
//! Every task, built-in or custom, must implement [`Task`].
//! The engine crate dispatches execution through this trait object after
//! resolving the task's type tag in a [`TaskRegistry`].

pub mod builtin;
pub mod context;
pub mod diff;
pub mod duration_ms;
pub mod error;
pub mod fs;
pub mod mock;
pub mod registry;
pub mod task;

pub use context::{ExecutionContext, WorkflowConfig};
pub use error::{RegistryError, TaskError};
pub use fs::{FileOperations, FsError, SandboxedFs};
pub use registry::TaskRegistry;
pub use task::{Task, TaskInputs};

//! The `Task` trait: the contract every work unit must fulfil.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{ExecutionContext, TaskError};

/// Inputs handed to a task, as declared in the workflow definition.
pub type TaskInputs = Map<String, Value>;

/// The core task trait.
///
/// All built-in tasks and custom implementations registered in the
/// [`TaskRegistry`](crate::TaskRegistry) must implement this.
#[async_trait]
pub trait Task: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Run the task with its declared inputs and return its JSON output.
    ///
    /// Implementations should check `ctx` for cancellation at I/O boundaries.
    async fn execute(&self, ctx: &ExecutionContext, inputs: &TaskInputs)
        -> Result<Value, TaskError>;
}

// ---------------------------------------------------------------------------
// Input helpers shared by the built-ins
// ---------------------------------------------------------------------------

/// Fetch a required, non-empty string input.
pub fn required_str<'a>(inputs: &'a TaskInputs, key: &'static str) -> Result<&'a str, TaskError> {
    match inputs.get(key) {
        None | Some(Value::Null) => Err(TaskError::missing(key)),
        Some(Value::String(s)) if s.is_empty() => Err(TaskError::missing(key)),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(TaskError::InvalidInput {
            input: key,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

/// Fetch an optional string input.
pub fn optional_str<'a>(
    inputs: &'a TaskInputs,
    key: &'static str,
) -> Result<Option<&'a str>, TaskError> {
    match inputs.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(TaskError::InvalidInput {
            input: key,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

/// Fetch an optional array-of-strings input.
pub fn optional_str_list(
    inputs: &TaskInputs,
    key: &'static str,
) -> Result<Option<Vec<String>>, TaskError> {
    let items = match inputs.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(TaskError::InvalidInput {
                input: key,
                reason: format!("expected an array of strings, got {other}"),
            })
        }
    };

    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            other => Err(TaskError::InvalidInput {
                input: key,
                reason: format!("expected a string element, got {other}"),
            }),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

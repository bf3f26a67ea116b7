//! `MockTask`: a test double for `Task`.
//!
//! Useful in unit and integration tests where a real task implementation is
//! either unavailable or irrelevant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::task::TaskInputs;
use crate::{ExecutionContext, Task, TaskError};

/// Behaviour injected into `MockTask` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `n` calls, then return the value.
    FlakyThenReturn { failures: usize, value: Value },
}

/// A mock task that records every call it receives and returns a
/// programmer-specified result, optionally after sleeping.
pub struct MockTask {
    /// Label used in test assertions.
    pub name: String,
    /// What the task will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// Simulated work time; honours cancellation.
    pub delay: Option<Duration>,
    /// All inputs seen by this task (in call order).
    pub calls: Arc<Mutex<Vec<TaskInputs>>>,
    attempts: AtomicUsize,
}

impl MockTask {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::FlakyThenReturn { failures, value })
    }

    /// Sleep for `delay` before producing the result.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times this task has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }

    fn tagged(&self, v: &Value) -> Value {
        // Merge the task's own output fields with its name so tests can trace
        // which task produced a value.
        let mut out = json!({ "task": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl Task for MockTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &ExecutionContext, inputs: &TaskInputs) -> Result<Value, TaskError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(inputs.clone());
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = ctx.cancelled() => return Err(TaskError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.tagged(v)),
            MockBehaviour::FailRetryable(msg) => Err(TaskError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(TaskError::Fatal(msg.clone())),
            MockBehaviour::FlakyThenReturn { failures, value } => {
                if attempt < *failures {
                    Err(TaskError::Retryable(format!("flaky attempt {}", attempt + 1)))
                } else {
                    Ok(self.tagged(value))
                }
            }
        }
    }
}

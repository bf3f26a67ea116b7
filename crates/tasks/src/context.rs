//! Run-scoped state shared by every task of one execution.
//!
//! Defined here (in the tasks crate) so both the engine and individual task
//! implementations can import it without a circular dependency.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default upper bound on simultaneously running tasks.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

// ---------------------------------------------------------------------------
// WorkflowConfig
// ---------------------------------------------------------------------------

/// Run-level knobs declared in the workflow definition document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Maximum number of tasks executing at the same instant.
    pub max_parallel: usize,
    /// How many times a retryable task failure is re-run.
    pub retries: u32,
    /// Fallback timeout for tasks that do not declare their own.
    #[serde(
        default,
        with = "crate::duration_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Executables a `shell_cmd` task may spawn.
    pub allowed_commands: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            retries: 0,
            timeout: None,
            allowed_commands: Vec::new(),
        }
    }
}

impl WorkflowConfig {
    /// Whether `cmd` is on the allow-list.
    pub fn allows(&self, cmd: &str) -> bool {
        self.allowed_commands.iter().any(|c| c == cmd)
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Shared context passed to every task during one run.
///
/// Cloning is cheap: the state map and config are reference-counted, so every
/// clone observes the same data. Per-task clones carry a child cancellation
/// token (see [`ExecutionContext::child`]) so a single task can be cancelled
/// without touching its siblings.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    workflow_id: String,
    execution_id: Uuid,
    state: Arc<DashMap<String, Value>>,
    config: Arc<WorkflowConfig>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        workflow_id: impl Into<String>,
        execution_id: Uuid,
        config: WorkflowConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id,
            state: Arc::new(DashMap::new()),
            config: Arc::new(config),
            cancel,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Read-only view of the run configuration.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// Concurrent writers racing on the same key get last-writer-wins with no
    /// ordering guarantee.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.get(key).map(|entry| entry.value().clone())
    }

    /// Copy of the whole state map, keys sorted.
    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        let mut entries: Vec<(String, Value)> = self
            .state
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().collect()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this context (or any parent) is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Same state and config, with a child cancellation token.
    pub fn child(&self) -> Self {
        self.with_cancellation(self.cancel.child_token())
    }

    /// Same state and config, with the given cancellation token.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id,
            state: Arc::clone(&self.state),
            config: Arc::clone(&self.config),
            cancel,
        }
    }
}

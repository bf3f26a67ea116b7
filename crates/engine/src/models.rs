//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory and what a run produced. Definitions round-trip through JSON and
//! YAML (see [`crate::loader`]); execution records serialise to JSON for
//! callers that want to persist or display them.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use tasks::registry::SHELL_CMD;
use tasks::{TaskRegistry, WorkflowConfig};

use crate::dag::Dag;
use crate::error::{DagError, TransitionError, ValidationError};

/// The only definition document schema this engine understands.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

// ---------------------------------------------------------------------------
// WorkflowTask
// ---------------------------------------------------------------------------

/// A single unit of work in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    /// Unique identifier within this workflow (referenced by dependencies).
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Maps to a registered `Task` implementation.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Arbitrary inputs passed to the task at execution time.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Names of the artifacts this task produces. Informational.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// Task IDs that must succeed before this task may start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(
        default,
        with = "tasks::duration_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl WorkflowTask {
    /// Convenience constructor for building definitions in code.
    pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            task_type: task_type.into(),
            inputs: Map::new(),
            outputs: Vec::new(),
            dependencies: Vec::new(),
            timeout: None,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Build the dependency graph of `tasks`: one node per task (declaration
/// order), one edge `dependency -> task` per declared dependency.
pub fn task_graph(tasks: &[WorkflowTask]) -> Result<Dag<&WorkflowTask>, DagError> {
    let mut dag = Dag::new();
    for task in tasks {
        dag.add_node(task.id.clone(), task)?;
    }
    for task in tasks {
        for dependency in &task.dependencies {
            dag.add_edge(dependency, &task.id)?;
        }
    }
    Ok(dag)
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub config: WorkflowConfig,
    pub tasks: Vec<WorkflowTask>,
}

impl WorkflowDefinition {
    /// Convenience constructor for building definitions in code.
    pub fn new(id: impl Into<String>, config: WorkflowConfig, tasks: Vec<WorkflowTask>) -> Self {
        let id = id.into();
        Self {
            schema_version: SCHEMA_VERSION,
            name: id.clone(),
            id,
            version: "1".into(),
            config,
            tasks,
        }
    }

    pub fn task(&self, id: &str) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Checks that need no registry: schema version, IDs, and an acyclic
    /// dependency graph. Returns the topological order on success.
    pub fn validate_structure(&self) -> Result<Vec<String>, ValidationError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ValidationError::UnsupportedSchemaVersion {
                found: self.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        if self.id.trim().is_empty() {
            return Err(ValidationError::Malformed("workflow id is empty".into()));
        }
        if let Some(task) = self.tasks.iter().find(|t| t.id.trim().is_empty()) {
            return Err(ValidationError::Malformed(format!(
                "task of type '{}' has an empty id",
                task.task_type
            )));
        }

        Ok(task_graph(&self.tasks)?.topological_sort()?)
    }

    /// Full validation: structure, registered task types, and every
    /// `shell_cmd` command on the allow-list.
    pub fn validate(&self, registry: &TaskRegistry) -> Result<Vec<String>, ValidationError> {
        let order = self.validate_structure()?;

        for task in &self.tasks {
            if !registry.contains(&task.task_type) {
                return Err(ValidationError::InvalidTaskType {
                    task_id: task.id.clone(),
                    task_type: task.task_type.clone(),
                });
            }

            if task.task_type == SHELL_CMD {
                let command = task
                    .inputs
                    .get("cmd")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ValidationError::MissingInput {
                        task_id: task.id.clone(),
                        input: "cmd",
                    })?;
                if !self.config.allows(command) {
                    return Err(ValidationError::CommandNotAllowed {
                        task_id: task.id.clone(),
                        command: command.to_owned(),
                    });
                }
            }
        }

        Ok(order)
    }
}

// ---------------------------------------------------------------------------
// Per-task results
// ---------------------------------------------------------------------------

/// Outcome of one task in one run. Produced exactly once per started task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Number of times `execute` was invoked (1 + retries used).
    pub attempts: u32,
    pub timed_out: bool,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    /// Never started: a dependency failed or the run was cancelled first.
    Skipped,
}

/// Per-task entry of a [`WorkflowExecution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl TaskExecution {
    pub fn from_result(task_id: impl Into<String>, result: &TaskResult) -> Self {
        Self {
            task_id: task_id.into(),
            status: if result.is_success() {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            output: result.output.clone(),
            error: result.error.clone(),
            started_at: Some(result.started_at),
            completed_at: Some(result.completed_at),
            attempts: result.attempts,
        }
    }

    pub fn skipped(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Skipped,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            attempts: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// Possible statuses for a workflow execution.
///
/// `pending -> running -> {completed, failed}`; both end states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"   => Ok(Self::Pending),
            "running"   => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed"    => Ok(Self::Failed),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Record of one run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub task_executions: Vec<TaskExecution>,
    pub checkpoints: Vec<Checkpoint>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            task_executions: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    /// Move to `next`, stamping `started_at` / `completed_at` as needed.
    ///
    /// # Errors
    /// [`TransitionError::Illegal`] for anything but `pending -> running`,
    /// `running -> completed` and `running -> failed`.
    pub fn transition_to(&mut self, next: ExecutionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            ExecutionStatus::Running => {
                self.started_at = Some(now);
                self.completed_at = None;
            }
            ExecutionStatus::Completed | ExecutionStatus::Failed => self.completed_at = Some(now),
            ExecutionStatus::Pending => {}
        }
        self.status = next;
        self.validate()
    }

    /// `completed_at` is set exactly when the status is terminal.
    pub fn validate(&self) -> Result<(), TransitionError> {
        match (self.status.is_terminal(), self.completed_at.is_some()) {
            (true, false) => Err(TransitionError::CompletedAt {
                status: self.status,
                expected: "set",
            }),
            (false, true) => Err(TransitionError::CompletedAt {
                status: self.status,
                expected: "unset",
            }),
            _ => Ok(()),
        }
    }

    pub fn task_execution(&self, task_id: &str) -> Option<&TaskExecution> {
        self.task_executions.iter().find(|t| t.task_id == task_id)
    }

    /// Task executions keyed by task ID.
    pub fn task_executions_by_id(&self) -> HashMap<&str, &TaskExecution> {
        self.task_executions
            .iter()
            .map(|t| (t.task_id.as_str(), t))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Persisted snapshot of execution progress. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub workflow_id: String,
    pub execution_id: Uuid,
    /// Last task completed when the snapshot was taken.
    pub task_id: String,
    pub state: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub recoverable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tasks::mock::MockTask;

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("mock", Arc::new(MockTask::returning("m", json!({}))));
        registry.register(SHELL_CMD, Arc::new(tasks::builtin::ShellCmdTask::new()));
        registry
    }

    #[test]
    fn status_transitions_follow_the_state_machine() {
        let mut exec = WorkflowExecution::new("wf");
        assert_eq!(
            exec.clone().transition_to(ExecutionStatus::Completed),
            Err(TransitionError::Illegal {
                from: ExecutionStatus::Pending,
                to: ExecutionStatus::Completed
            })
        );

        exec.transition_to(ExecutionStatus::Running).unwrap();
        assert!(exec.started_at.is_some());
        assert!(exec.completed_at.is_none());

        let mut failed = exec.clone();
        failed.transition_to(ExecutionStatus::Failed).unwrap();
        assert!(failed.completed_at.is_some());

        exec.transition_to(ExecutionStatus::Completed).unwrap();
        assert!(exec.completed_at.is_some());
        assert!(exec.transition_to(ExecutionStatus::Running).is_err());
        assert!(failed.transition_to(ExecutionStatus::Completed).is_err());
    }

    #[test]
    fn validate_enforces_completed_at_invariant() {
        let mut exec = WorkflowExecution::new("wf");
        exec.status = ExecutionStatus::Running;
        exec.completed_at = Some(Utc::now());
        assert!(matches!(exec.validate(), Err(TransitionError::CompletedAt { expected: "unset", .. })));

        exec.status = ExecutionStatus::Failed;
        exec.completed_at = None;
        assert!(matches!(exec.validate(), Err(TransitionError::CompletedAt { expected: "set", .. })));
    }

    #[test]
    fn status_parses_and_displays() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<ExecutionStatus>(), Ok(status));
        }
        assert!("succeeded".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn validation_rejects_unknown_types_and_commands() {
        let registry = registry();

        let def = WorkflowDefinition::new(
            "wf",
            WorkflowConfig::default(),
            vec![WorkflowTask::new("a", "teleport")],
        );
        assert!(matches!(
            def.validate(&registry),
            Err(ValidationError::InvalidTaskType { task_type, .. }) if task_type == "teleport"
        ));

        let config = WorkflowConfig {
            allowed_commands: vec!["cargo".into()],
            ..WorkflowConfig::default()
        };
        let def = WorkflowDefinition::new(
            "wf",
            config.clone(),
            vec![WorkflowTask::new("rm", SHELL_CMD).with_input("cmd", json!("rm"))],
        );
        assert!(matches!(
            def.validate(&registry),
            Err(ValidationError::CommandNotAllowed { command, .. }) if command == "rm"
        ));

        let def = WorkflowDefinition::new(
            "wf",
            config,
            vec![
                WorkflowTask::new("build", SHELL_CMD).with_input("cmd", json!("cargo")),
                WorkflowTask::new("after", "mock").depends_on("build"),
            ],
        );
        assert_eq!(def.validate(&registry).unwrap(), vec!["build", "after"]);
    }

    #[test]
    fn validation_rejects_cycles_and_unknown_dependencies() {
        let registry = registry();
        let def = WorkflowDefinition::new(
            "wf",
            WorkflowConfig::default(),
            vec![
                WorkflowTask::new("a", "mock").depends_on("b"),
                WorkflowTask::new("b", "mock").depends_on("a"),
            ],
        );
        assert!(matches!(
            def.validate(&registry),
            Err(ValidationError::Dag(DagError::CyclicDependency(_)))
        ));

        let def = WorkflowDefinition::new(
            "wf",
            WorkflowConfig::default(),
            vec![WorkflowTask::new("a", "mock").depends_on("ghost")],
        );
        assert!(matches!(
            def.validate(&registry),
            Err(ValidationError::Dag(DagError::UnknownNode { node_id, .. })) if node_id == "ghost"
        ));

        let def = WorkflowDefinition::new(
            "wf",
            WorkflowConfig::default(),
            vec![WorkflowTask::new("a", "mock"), WorkflowTask::new("a", "mock")],
        );
        assert!(matches!(
            def.validate(&registry),
            Err(ValidationError::Dag(DagError::DuplicateNode(_)))
        ));
    }
}

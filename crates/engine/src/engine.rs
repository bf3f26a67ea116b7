//! The workflow engine: validation, one run of the executor, and the
//! execution record around it.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use tasks::registry::SHELL_CMD;
use tasks::{ExecutionContext, FileOperations, TaskRegistry};

use crate::checkpoint::CheckpointManager;
use crate::error::{EngineError, ValidationError};
use crate::executor::{ExecutorConfig, ParallelExecutor, TaskCompletion};
use crate::models::{
    Checkpoint, ExecutionStatus, TaskExecution, WorkflowDefinition, WorkflowExecution,
    WorkflowTask,
};

/// Checkpoint cadence used when none is configured.
pub const DEFAULT_CHECKPOINT_EVERY_N: usize = 10;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Collaborators and knobs for [`Engine::new`].
#[derive(Clone)]
pub struct EngineConfig {
    /// Required.
    pub file_ops: Option<Arc<dyn FileOperations>>,
    /// Required.
    pub registry: Option<Arc<TaskRegistry>>,
    /// Checkpointing is off when `None`.
    pub checkpoints: Option<CheckpointManager>,
    /// Save after every N finished tasks; 0 disables periodic saves.
    pub checkpoint_every_n: usize,
    /// `max_workers` is overridden per run by the workflow's `max_parallel`.
    pub executor: ExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            file_ops: None,
            registry: None,
            checkpoints: None,
            checkpoint_every_n: DEFAULT_CHECKPOINT_EVERY_N,
            executor: ExecutorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// `file_ops` plus a registry holding the built-in tasks bound to it.
    pub fn with_builtins(file_ops: Arc<dyn FileOperations>) -> Self {
        let registry = TaskRegistry::with_builtins(Arc::clone(&file_ops));
        Self {
            file_ops: Some(file_ops),
            registry: Some(Arc::new(registry)),
            ..Self::default()
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("file_ops", &self.file_ops.as_ref().map(|fs| fs.root().to_path_buf()))
            .field("registry", &self.registry)
            .field("checkpoints", &self.checkpoints.is_some())
            .field("checkpoint_every_n", &self.checkpoint_every_n)
            .field("executor", &self.executor)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    file_ops: Arc<dyn FileOperations>,
    registry: Arc<TaskRegistry>,
    checkpoints: Option<CheckpointManager>,
    checkpoint_every_n: usize,
    executor: ExecutorConfig,
}

impl Engine {
    /// # Errors
    /// [`EngineError::Configuration`] when `file_ops` or `registry` is unset.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let file_ops = config.file_ops.ok_or_else(|| {
            EngineError::Configuration("a file-operations collaborator is required".into())
        })?;
        let registry = config
            .registry
            .ok_or_else(|| EngineError::Configuration("a task registry is required".into()))?;

        Ok(Self {
            file_ops,
            registry,
            checkpoints: config.checkpoints,
            checkpoint_every_n: config.checkpoint_every_n,
            executor: config.executor,
        })
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn file_ops(&self) -> &Arc<dyn FileOperations> {
        &self.file_ops
    }

    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    /// Validate `def` against this engine's registry. Returns the
    /// topological order.
    pub fn validate(&self, def: &WorkflowDefinition) -> Result<Vec<String>, ValidationError> {
        def.validate(&self.registry)
    }

    /// Run `def` to completion.
    ///
    /// # Errors
    /// - `Validation`: nothing ran and no execution record exists.
    /// - `Execution`: the run started but a task failed or `cancel` fired before every task finished.
    ///   The error carries the finished execution record.
    #[instrument(skip_all, fields(workflow_id = %def.id))]
    pub async fn execute(
        &self,
        def: &WorkflowDefinition,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecution, EngineError> {
        let order = self.validate(def)?;

        let mut execution = WorkflowExecution::new(def.id.clone());
        execution.transition_to(ExecutionStatus::Running)?;
        info!(
            execution_id = %execution.id,
            tasks = order.len(),
            max_parallel = def.config.max_parallel,
            "execution started"
        );

        let ctx = ExecutionContext::new(def.id.clone(), execution.id, def.config.clone(), cancel);
        let tasks = prepare_tasks(def);
        let executor = ParallelExecutor::new(
            Arc::clone(&self.registry),
            ExecutorConfig {
                max_workers: def.config.max_parallel.max(1),
                ..self.executor.clone()
            },
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (outcome, saved) = tokio::join!(
            executor.execute_with_progress(&tasks, &ctx, Some(tx)),
            self.checkpoint_loop(&ctx, rx),
        );
        let outcome = outcome?;

        execution.checkpoints = saved;
        execution.task_executions = def
            .tasks
            .iter()
            .map(|task| match outcome.results.get(&task.id) {
                Some(result) => TaskExecution::from_result(task.id.clone(), result),
                None => TaskExecution::skipped(task.id.clone()),
            })
            .collect();

        match outcome.error {
            None => {
                execution.transition_to(ExecutionStatus::Completed)?;
                info!(execution_id = %execution.id, "execution completed");
                Ok(execution)
            }
            Some(source) => {
                execution.transition_to(ExecutionStatus::Failed)?;
                warn!(execution_id = %execution.id, error = %source, "execution failed");
                Err(EngineError::Execution {
                    execution: Box::new(execution),
                    source,
                })
            }
        }
    }

    /// Save a checkpoint outside the periodic cadence.
    ///
    /// # Errors
    /// [`EngineError::Configuration`] when no checkpoint manager is set.
    pub async fn checkpoint_now(
        &self,
        ctx: &ExecutionContext,
        last_task_id: &str,
        state: Map<String, Value>,
    ) -> Result<Checkpoint, EngineError> {
        let manager = self.checkpoints.as_ref().ok_or_else(|| {
            EngineError::Configuration("checkpointing is not configured".into())
        })?;
        Ok(manager.save(ctx, last_task_id, state).await?)
    }

    /// Consume progress reports and save a checkpoint every N of them.
    /// A checkpoint is recoverable only while the run can still progress.
    /// Save failures are logged; they never fail the run.
    async fn checkpoint_loop(
        &self,
        ctx: &ExecutionContext,
        mut progress: mpsc::UnboundedReceiver<TaskCompletion>,
    ) -> Vec<Checkpoint> {
        let mut saved = Vec::new();
        let Some(manager) = self.checkpoints.as_ref().filter(|_| self.checkpoint_every_n > 0) else {
            return saved;
        };

        let mut completed: Vec<String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        while let Some(report) = progress.recv().await {
            if report.succeeded {
                completed.push(report.task_id.clone());
            } else {
                failed.push(report.task_id.clone());
            }
            if (completed.len() + failed.len()) % self.checkpoint_every_n != 0 {
                continue;
            }

            let mut state = Map::new();
            state.insert("completed".into(), json!(completed));
            state.insert("failed".into(), json!(failed));

            match manager
                .save_with(ctx, &report.task_id, state, report.can_progress)
                .await
            {
                Ok(checkpoint) => saved.push(checkpoint),
                Err(e) => warn!(task_id = %report.task_id, error = %e, "checkpoint save failed"),
            }
        }
        saved
    }
}

/// `shell_cmd` tasks inherit the workflow allow-list unless they carry one.
fn prepare_tasks(def: &WorkflowDefinition) -> Vec<WorkflowTask> {
    def.tasks
        .iter()
        .cloned()
        .map(|mut task| {
            if task.task_type == SHELL_CMD && !task.inputs.contains_key("allowed_commands") {
                task.inputs.insert(
                    "allowed_commands".into(),
                    json!(def.config.allowed_commands),
                );
            }
            task
        })
        .collect()
}

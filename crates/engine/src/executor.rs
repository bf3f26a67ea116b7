//! Parallel workflow executor.
//!
//! `ParallelExecutor` runs a task list as a DAG:
//! 1. Builds the dependency graph and refuses cyclic input before starting
//!    anything.
//! 2. Spawns a task the moment every dependency has succeeded; a semaphore
//!    caps how many run at once.
//! 3. Runs each task under its own deadline. `TaskError::Retryable` failures
//!    are retried with exponential back-off; every other failure, a timeout
//!    or a panic fails the task.
//! 4. Never starts the dependents of a failed task. Independent branches
//!    keep going.
//! 5. Returns every result that was produced, plus an aggregate error when
//!    anything failed or the run was cancelled.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use tasks::{ExecutionContext, Task, TaskError, TaskInputs, TaskRegistry};

use crate::error::{AggregateExecutionError, ExecutorError, TaskExecutionError, ValidationError};
use crate::models::{task_graph, TaskResult, WorkflowTask};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of tasks executing at the same instant.
    pub max_workers: usize,
    /// Deadline for tasks that declare no timeout when the workflow config
    /// doesn't set one either.
    pub default_task_timeout: Duration,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
    /// Cancel the whole run on the first task failure.
    pub fail_fast: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: tasks::context::DEFAULT_MAX_PARALLEL,
            default_task_timeout: Duration::from_secs(300),
            retry_base_delay: Duration::from_millis(100),
            fail_fast: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Output of a run
// ---------------------------------------------------------------------------

/// Sent on the progress channel each time a task finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    pub task_id: String,
    pub succeeded: bool,
    /// Whether any task is still running or queued after this one.
    pub can_progress: bool,
}

/// Everything one run produced.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// One entry per task that started, keyed by task ID.
    pub results: BTreeMap<String, TaskResult>,
    /// Tasks that never started, in definition order.
    pub skipped: Vec<String>,
    /// `None` only when every task succeeded.
    pub error: Option<ExecutorError>,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn completed(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }
}

// ---------------------------------------------------------------------------
// ParallelExecutor
// ---------------------------------------------------------------------------

/// Stateless scheduler; one instance can serve any number of runs.
pub struct ParallelExecutor {
    registry: Arc<TaskRegistry>,
    config: ExecutorConfig,
}

/// What came back from one spawned task.
enum Attempt {
    /// Cancelled while waiting for a worker slot.
    NotStarted,
    Finished {
        result: TaskResult,
        /// The task gave up because its context was cancelled.
        cancelled: bool,
    },
}

/// Owned copy of everything a spawned task needs.
struct Job {
    task_id: String,
    task: Arc<dyn Task>,
    inputs: TaskInputs,
    timeout: Duration,
    retries: u32,
    retry_base_delay: Duration,
}

impl ParallelExecutor {
    pub fn new(registry: Arc<TaskRegistry>, config: ExecutorConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `tasks` to completion.
    ///
    /// # Errors
    /// `ValidationError` when the task list cannot be scheduled at all
    /// (cycle, duplicate or unknown dependency, unregistered type). In that
    /// case no task was started. Task failures are reported through
    /// [`ExecutionOutcome::error`] instead.
    pub async fn execute(
        &self,
        tasks: &[WorkflowTask],
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, ValidationError> {
        self.execute_with_progress(tasks, ctx, None).await
    }

    /// Like [`execute`](Self::execute), reporting each finished task on
    /// `progress`.
    #[instrument(
        skip_all,
        fields(
            workflow_id = %ctx.workflow_id(),
            execution_id = %ctx.execution_id(),
            tasks = tasks.len(),
            max_workers = self.config.max_workers,
        )
    )]
    pub async fn execute_with_progress(
        &self,
        tasks: &[WorkflowTask],
        ctx: &ExecutionContext,
        progress: Option<mpsc::UnboundedSender<TaskCompletion>>,
    ) -> Result<ExecutionOutcome, ValidationError> {
        // ------------------------------------------------------------------
        // Validate and order the graph. Nothing runs if this fails.
        // ------------------------------------------------------------------
        let dag = task_graph(tasks)?;
        let order = dag.topological_sort()?;

        let mut implementations: HashMap<&str, Arc<dyn Task>> = HashMap::with_capacity(tasks.len());
        for task in tasks {
            let implementation = self.registry.get(&task.task_type).map_err(|_| {
                ValidationError::InvalidTaskType {
                    task_id: task.id.clone(),
                    task_type: task.task_type.clone(),
                }
            })?;
            implementations.insert(task.id.as_str(), implementation);
        }

        info!(order = ?order, "DAG validated");

        // Child token: fail-fast cancels this run without touching the caller.
        let run_ctx = ctx.child();
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut join_set: JoinSet<(String, Attempt)> = JoinSet::new();
        let mut workers: HashMap<TaskId, String> = HashMap::new();

        let mut waiting_on: HashMap<&str, usize> = dag
            .node_ids()
            .map(|id| (id, dag.dependencies(id).len()))
            .collect();

        for id in &order {
            if waiting_on.get(id.as_str()) == Some(&0) {
                if let (Some(task), Some(implementation)) =
                    (dag.get_node(id), implementations.get(id.as_str()))
                {
                    let worker = self.spawn(&mut join_set, task, Arc::clone(implementation), &semaphore, &run_ctx);
                    workers.insert(worker, task.id.clone());
                }
            }
        }

        // ------------------------------------------------------------------
        // Collect results and release dependents as their inputs succeed.
        // ------------------------------------------------------------------
        let mut results: BTreeMap<String, TaskResult> = BTreeMap::new();
        let mut failures: Vec<TaskExecutionError> = Vec::new();
        let mut cancelled_tasks = 0usize;

        while let Some(joined) = join_set.join_next().await {
            let (task_id, result) = match joined {
                Ok((task_id, Attempt::Finished { result, cancelled })) => {
                    if cancelled {
                        cancelled_tasks += 1;
                    }
                    (task_id, result)
                }
                Ok((task_id, Attempt::NotStarted)) => {
                    debug!(task_id = %task_id, "cancelled before start");
                    continue;
                }
                Err(join_err) => {
                    let Some(task_id) = workers.get(&join_err.id()).cloned() else {
                        error!(error = %join_err, "unknown task worker aborted");
                        continue;
                    };
                    error!(task_id = %task_id, error = %join_err, "task worker aborted");
                    (task_id, aborted_result(&join_err))
                }
            };

            let succeeded = result.is_success();
            if succeeded {
                if let Some(output) = &result.output {
                    run_ctx.set(format!("{task_id}.output"), output.clone());
                }
                info!(task_id = %task_id, attempts = result.attempts, "task succeeded");

                for dependent in dag.dependents(&task_id) {
                    let Some(remaining) = waiting_on.get_mut(dependent) else {
                        continue;
                    };
                    *remaining -= 1;
                    if *remaining > 0 || run_ctx.is_cancelled() {
                        continue;
                    }
                    if let (Some(task), Some(implementation)) =
                        (dag.get_node(dependent), implementations.get(dependent))
                    {
                        let worker = self.spawn(&mut join_set, task, Arc::clone(implementation), &semaphore, &run_ctx);
                        workers.insert(worker, task.id.clone());
                    }
                }
            } else {
                let message = result.error.clone().unwrap_or_default();
                warn!(
                    task_id = %task_id,
                    timed_out = result.timed_out,
                    pruned = ?dag.descendants(&task_id),
                    "task failed: {message}"
                );
                failures.push(TaskExecutionError {
                    task_id: task_id.clone(),
                    message,
                    timed_out: result.timed_out,
                });
                if self.config.fail_fast {
                    info!("fail-fast: cancelling remaining tasks");
                    run_ctx.cancellation_token().cancel();
                }
            }

            if let Some(tx) = &progress {
                // The receiver going away only stops progress reporting.
                let _ = tx.send(TaskCompletion {
                    task_id: task_id.clone(),
                    succeeded,
                    can_progress: !join_set.is_empty() && !run_ctx.is_cancelled(),
                });
            }
            results.insert(task_id, result);
        }

        let skipped: Vec<String> = tasks
            .iter()
            .filter(|t| !results.contains_key(&t.id))
            .map(|t| t.id.clone())
            .collect();

        let completed = results.values().filter(|r| r.is_success()).count();
        // A caller cancellation that arrived after the last task finished
        // changed nothing and is not reported.
        let cancellation_mattered = !skipped.is_empty() || cancelled_tasks > 0;
        let error = if ctx.is_cancelled() && cancellation_mattered {
            Some(ExecutorError::Cancelled { completed })
        } else if !failures.is_empty() {
            Some(AggregateExecutionError { failures }.into())
        } else {
            None
        };

        info!(
            completed,
            failed = results.len() - completed,
            skipped = skipped.len(),
            "run finished"
        );

        Ok(ExecutionOutcome {
            results,
            skipped,
            error,
        })
    }

    fn spawn(
        &self,
        join_set: &mut JoinSet<(String, Attempt)>,
        task: &WorkflowTask,
        implementation: Arc<dyn Task>,
        semaphore: &Arc<Semaphore>,
        run_ctx: &ExecutionContext,
    ) -> TaskId {
        let job = Job {
            task_id: task.id.clone(),
            task: implementation,
            inputs: task.inputs.clone(),
            timeout: task
                .timeout
                .or(run_ctx.config().timeout)
                .unwrap_or(self.config.default_task_timeout),
            retries: run_ctx.config().retries,
            retry_base_delay: self.config.retry_base_delay,
        };
        let semaphore = Arc::clone(semaphore);
        let task_ctx = run_ctx.child();

        debug!(task_id = %job.task_id, "task eligible");

        let handle = join_set.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = task_ctx.cancelled() => return (job.task_id, Attempt::NotStarted),
                permit = semaphore.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                return (job.task_id, Attempt::NotStarted);
            };

            let attempt = run_with_retry(&job, &task_ctx).await;
            (job.task_id, attempt)
        });
        handle.id()
    }
}

// ---------------------------------------------------------------------------
// Internal: run a single task with deadline, retries and panic capture.
// ---------------------------------------------------------------------------

enum Failure {
    Task(TaskError),
    TimedOut(Duration),
    Panicked(String),
}

impl Failure {
    fn describe(&self) -> String {
        match self {
            Self::Task(e) => e.to_string(),
            Self::TimedOut(limit) => format!("timed out after {limit:?}"),
            Self::Panicked(msg) => format!("task panicked: {msg}"),
        }
    }
}

async fn run_with_retry(job: &Job, ctx: &ExecutionContext) -> Attempt {
    let started_at = Utc::now();
    let mut attempts = 0u32;

    let outcome: Result<Value, Failure> = loop {
        attempts += 1;

        let call = AssertUnwindSafe(job.task.execute(ctx, &job.inputs)).catch_unwind();
        let attempt = match tokio::time::timeout(job.timeout, call).await {
            Err(_elapsed) => Err(Failure::TimedOut(job.timeout)),
            Ok(Err(panic)) => Err(Failure::Panicked(panic_message(panic.as_ref()))),
            Ok(Ok(Err(e))) => Err(Failure::Task(e)),
            Ok(Ok(Ok(output))) => Ok(output),
        };

        match attempt {
            Err(Failure::Task(e)) if e.is_retryable() && attempts <= job.retries => {
                let delay = job.retry_base_delay * 2u32.saturating_pow(attempts - 1);
                warn!(
                    task_id = %job.task_id,
                    "retryable error (attempt {}/{}), retrying in {:?}: {}",
                    attempts,
                    job.retries + 1,
                    delay,
                    e
                );
                tokio::select! {
                    _ = ctx.cancelled() => break Err(Failure::Task(TaskError::Cancelled)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => break other,
        }
    };

    let completed_at = Utc::now();
    match outcome {
        Ok(output) => Attempt::Finished {
            result: TaskResult {
                output: Some(output),
                error: None,
                started_at,
                completed_at,
                attempts,
                timed_out: false,
            },
            cancelled: false,
        },
        Err(failure) => Attempt::Finished {
            result: TaskResult {
                output: None,
                error: Some(failure.describe()),
                started_at,
                completed_at,
                attempts,
                timed_out: matches!(failure, Failure::TimedOut(_)),
            },
            cancelled: matches!(failure, Failure::Task(TaskError::Cancelled)),
        },
    }
}

/// Failed result for a worker that died outside the task's own panic guard.
fn aborted_result(join_err: &JoinError) -> TaskResult {
    let now = Utc::now();
    let reason = if join_err.is_panic() {
        "task worker panicked"
    } else {
        "task worker aborted"
    };
    TaskResult {
        output: None,
        error: Some(format!("{reason}: {join_err}")),
        started_at: now,
        completed_at: now,
        attempts: 1,
        timed_out: false,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}

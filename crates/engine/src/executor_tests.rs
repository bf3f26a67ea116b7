//! Scenario tests for the parallel executor.
//!
//! These use `MockTask` and a few purpose-built task doubles; the file-write
//! scenario runs the real `file_op` task inside a temporary sandbox.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tasks::mock::MockTask;
use tasks::registry::FILE_OP;
use tasks::{ExecutionContext, SandboxedFs, Task, TaskError, TaskInputs, TaskRegistry, WorkflowConfig};

use crate::error::{DagError, ExecutorError, ValidationError};
use crate::executor::{ExecutorConfig, ParallelExecutor};
use crate::models::WorkflowTask;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ctx_with(config: WorkflowConfig) -> ExecutionContext {
    ExecutionContext::new("wf-test", Uuid::new_v4(), config, CancellationToken::new())
}

fn ctx() -> ExecutionContext {
    ctx_with(WorkflowConfig::default())
}

fn executor(registry: TaskRegistry, max_workers: usize) -> ParallelExecutor {
    ParallelExecutor::new(
        Arc::new(registry),
        ExecutorConfig {
            max_workers,
            retry_base_delay: Duration::from_millis(1),
            ..ExecutorConfig::default()
        },
    )
}

/// Records how many executions overlap.
#[derive(Default)]
struct ActiveCounter {
    active: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl Task for ActiveCounter {
    fn name(&self) -> &str {
        "active_counter"
    }

    async fn execute(&self, _ctx: &ExecutionContext, _inputs: &TaskInputs) -> Result<Value, TaskError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(json!({}))
    }
}

/// Returns the state entry named by its `key` input, failing if absent.
struct ReadState;

#[async_trait]
impl Task for ReadState {
    fn name(&self) -> &str {
        "read_state"
    }

    async fn execute(&self, ctx: &ExecutionContext, inputs: &TaskInputs) -> Result<Value, TaskError> {
        let key = tasks::task::required_str(inputs, "key")?;
        ctx.get(key)
            .ok_or_else(|| TaskError::Fatal(format!("'{key}' not visible yet")))
    }
}

struct Panicking;

#[async_trait]
impl Task for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn execute(&self, _ctx: &ExecutionContext, _inputs: &TaskInputs) -> Result<Value, TaskError> {
        panic!("index out of bounds");
    }
}

/// Hand-written `Task` impl that panics while building its future, before
/// the executor's panic guard wraps it.
struct PanicsOnCall;

impl Task for PanicsOnCall {
    fn name(&self) -> &str {
        "panics_on_call"
    }

    fn execute<'life0, 'life1, 'life2, 'async_trait>(
        &'life0 self,
        _ctx: &'life1 ExecutionContext,
        _inputs: &'life2 TaskInputs,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        'life2: 'async_trait,
        Self: 'async_trait,
    {
        panic!("refusing to build a future");
    }
}

// ============================================================
// Graph validation
// ============================================================

#[tokio::test]
async fn cycle_fails_before_any_task_runs() {
    let mock = Arc::new(MockTask::returning("m", json!({})));
    let mut registry = TaskRegistry::new();
    registry.register("mock", mock.clone());

    let tasks = vec![
        WorkflowTask::new("start", "mock"),
        WorkflowTask::new("x", "mock").depends_on("z"),
        WorkflowTask::new("y", "mock").depends_on("x"),
        WorkflowTask::new("z", "mock").depends_on("y"),
    ];

    let err = executor(registry, 4).execute(&tasks, &ctx()).await.unwrap_err();
    assert!(matches!(err, ValidationError::Dag(DagError::CyclicDependency(_))));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn self_dependency_fails_before_any_task_runs() {
    let mock = Arc::new(MockTask::returning("m", json!({})));
    let mut registry = TaskRegistry::new();
    registry.register("mock", mock.clone());

    let tasks = vec![
        WorkflowTask::new("free", "mock"),
        WorkflowTask::new("me", "mock").depends_on("me"),
    ];

    assert!(executor(registry, 4).execute(&tasks, &ctx()).await.is_err());
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn unregistered_type_fails_before_any_task_runs() {
    let mock = Arc::new(MockTask::returning("m", json!({})));
    let mut registry = TaskRegistry::new();
    registry.register("mock", mock.clone());

    let tasks = vec![
        WorkflowTask::new("a", "mock"),
        WorkflowTask::new("b", "unknown"),
    ];

    let err = executor(registry, 4).execute(&tasks, &ctx()).await.unwrap_err();
    assert!(matches!(err, ValidationError::InvalidTaskType { task_type, .. } if task_type == "unknown"));
    assert_eq!(mock.call_count(), 0);
}

// ============================================================
// Scheduling
// ============================================================

#[tokio::test]
async fn concurrency_never_exceeds_max_workers() {
    for workers in [1, 3, 8] {
        let counter = Arc::new(ActiveCounter::default());
        let mut registry = TaskRegistry::new();
        registry.register("counted", counter.clone());

        let tasks: Vec<WorkflowTask> = (0..24)
            .map(|i| WorkflowTask::new(format!("t{i}"), "counted"))
            .collect();

        let outcome = executor(registry, workers).execute(&tasks, &ctx()).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(counter.finished.load(Ordering::SeqCst), 24);

        let peak = counter.peak.load(Ordering::SeqCst);
        assert!(peak <= workers, "peak {peak} exceeded {workers} workers");
        assert!(peak >= 1);
    }
}

#[tokio::test]
async fn linear_chain_completes_in_dependency_order() {
    let mut registry = TaskRegistry::new();
    registry.register(
        "mock",
        Arc::new(MockTask::returning("m", json!({})).with_delay(Duration::from_millis(5))),
    );

    // Declared out of order on purpose.
    let tasks = vec![
        WorkflowTask::new("c", "mock").depends_on("b"),
        WorkflowTask::new("a", "mock"),
        WorkflowTask::new("b", "mock").depends_on("a"),
    ];

    let outcome = executor(registry, 4).execute(&tasks, &ctx()).await.unwrap();
    let a = &outcome.results["a"];
    let b = &outcome.results["b"];
    let c = &outcome.results["c"];
    assert!(a.completed_at <= b.started_at);
    assert!(a.completed_at <= b.completed_at);
    assert!(b.completed_at <= c.completed_at);
}

#[tokio::test]
async fn dependency_outputs_are_visible_to_dependents() {
    let mut registry = TaskRegistry::new();
    registry.register("produce", Arc::new(MockTask::returning("producer", json!({ "n": 7 }))));
    registry.register("read", Arc::new(ReadState));

    let tasks = vec![
        WorkflowTask::new("producer", "produce"),
        WorkflowTask::new("consumer", "read")
            .depends_on("producer")
            .with_input("key", json!("producer.output")),
    ];

    let ctx = ctx();
    let outcome = executor(registry, 4).execute(&tasks, &ctx).await.unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(
        outcome.results["consumer"].output,
        Some(json!({ "task": "producer", "n": 7 }))
    );
    assert_eq!(ctx.get("consumer.output"), Some(json!({ "task": "producer", "n": 7 })));
}

// ============================================================
// Failure handling
// ============================================================

#[tokio::test]
async fn failure_prunes_dependents_but_not_independent_branches() {
    let downstream = Arc::new(MockTask::returning("downstream", json!({})));
    let mut registry = TaskRegistry::new();
    registry.register("fail", Arc::new(MockTask::failing_fatal("fail", "disk full")));
    registry.register("downstream", downstream.clone());
    registry.register("ok", Arc::new(MockTask::returning("ok", json!({}))));

    let tasks = vec![
        WorkflowTask::new("bad", "fail"),
        WorkflowTask::new("child", "downstream").depends_on("bad"),
        WorkflowTask::new("grandchild", "downstream").depends_on("child"),
        WorkflowTask::new("left", "ok"),
        WorkflowTask::new("right", "ok").depends_on("left"),
    ];

    let outcome = executor(registry, 2).execute(&tasks, &ctx()).await.unwrap();

    assert_eq!(downstream.call_count(), 0);
    assert_eq!(outcome.skipped, vec!["child", "grandchild"]);
    assert!(outcome.results["left"].is_success());
    assert!(outcome.results["right"].is_success());
    assert!(outcome.results["bad"].error.as_deref().unwrap().contains("disk full"));

    match outcome.error {
        Some(ExecutorError::TaskFailures(agg)) => {
            assert_eq!(agg.task_ids(), vec!["bad"]);
            assert!(agg.to_string().contains("bad"));
        }
        other => panic!("expected task failures, got {other:?}"),
    }
}

#[tokio::test]
async fn timeout_is_a_localized_failure() {
    let mut registry = TaskRegistry::new();
    registry.register(
        "slow",
        Arc::new(MockTask::returning("slow", json!({})).with_delay(Duration::from_secs(5))),
    );
    registry.register("fast", Arc::new(MockTask::returning("fast", json!({}))));

    let tasks = vec![
        WorkflowTask::new("slow", "slow").with_timeout(Duration::from_millis(50)),
        WorkflowTask::new("after_slow", "fast").depends_on("slow"),
        WorkflowTask::new("fast", "fast"),
    ];

    let outcome = executor(registry, 4).execute(&tasks, &ctx()).await.unwrap();

    let slow = &outcome.results["slow"];
    assert!(slow.timed_out);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
    assert!(outcome.results["fast"].is_success());
    assert_eq!(outcome.skipped, vec!["after_slow"]);
    assert!(matches!(
        outcome.error,
        Some(ExecutorError::TaskFailures(ref agg)) if agg.failures[0].timed_out
    ));
}

#[tokio::test]
async fn workflow_timeout_applies_when_task_has_none() {
    let mut registry = TaskRegistry::new();
    registry.register(
        "slow",
        Arc::new(MockTask::returning("slow", json!({})).with_delay(Duration::from_secs(5))),
    );
    let config = WorkflowConfig {
        timeout: Some(Duration::from_millis(30)),
        ..WorkflowConfig::default()
    };

    let tasks = vec![WorkflowTask::new("slow", "slow")];
    let outcome = executor(registry, 1).execute(&tasks, &ctx_with(config)).await.unwrap();
    assert!(outcome.results["slow"].timed_out);
}

#[tokio::test]
async fn retryable_failures_are_retried_up_to_the_budget() {
    let flaky = Arc::new(MockTask::flaky("flaky", 2, json!({ "ok": true })));
    let always = Arc::new(MockTask::failing_retryable("always", "503"));
    let fatal = Arc::new(MockTask::failing_fatal("fatal", "bad input"));
    let mut registry = TaskRegistry::new();
    registry.register("flaky", flaky.clone());
    registry.register("always", always.clone());
    registry.register("fatal", fatal.clone());

    let config = WorkflowConfig {
        retries: 2,
        ..WorkflowConfig::default()
    };
    let tasks = vec![
        WorkflowTask::new("flaky", "flaky"),
        WorkflowTask::new("always", "always"),
        WorkflowTask::new("fatal", "fatal"),
    ];

    let outcome = executor(registry, 4).execute(&tasks, &ctx_with(config)).await.unwrap();

    assert!(outcome.results["flaky"].is_success());
    assert_eq!(outcome.results["flaky"].attempts, 3);
    assert_eq!(flaky.call_count(), 3);

    assert!(!outcome.results["always"].is_success());
    assert_eq!(outcome.results["always"].attempts, 3);

    assert_eq!(outcome.results["fatal"].attempts, 1);
    assert_eq!(fatal.call_count(), 1);
}

#[tokio::test]
async fn panicking_task_is_recorded_as_failure() {
    let mut registry = TaskRegistry::new();
    registry.register("panic", Arc::new(Panicking));
    registry.register("ok", Arc::new(MockTask::returning("ok", json!({}))));

    let tasks = vec![WorkflowTask::new("p", "panic"), WorkflowTask::new("fine", "ok")];
    let outcome = executor(registry, 2).execute(&tasks, &ctx()).await.unwrap();

    assert!(outcome.results["p"]
        .error
        .as_deref()
        .unwrap()
        .contains("index out of bounds"));
    assert!(outcome.results["fine"].is_success());
}

#[tokio::test]
async fn dead_worker_is_recorded_as_failure() {
    let mut registry = TaskRegistry::new();
    registry.register("dies", Arc::new(PanicsOnCall));
    registry.register("ok", Arc::new(MockTask::returning("ok", json!({}))));

    let tasks = vec![
        WorkflowTask::new("dies", "dies"),
        WorkflowTask::new("after", "ok").depends_on("dies"),
        WorkflowTask::new("fine", "ok"),
    ];
    let outcome = executor(registry, 2).execute(&tasks, &ctx()).await.unwrap();

    let dead = &outcome.results["dies"];
    assert!(!dead.is_success());
    assert!(dead.error.as_deref().unwrap().contains("task worker panicked"));
    assert!(outcome.results["fine"].is_success());
    assert_eq!(outcome.skipped, vec!["after"]);
    assert!(matches!(
        outcome.error,
        Some(ExecutorError::TaskFailures(ref agg)) if agg.task_ids() == vec!["dies"]
    ));
}

#[tokio::test]
async fn fail_fast_cancels_in_flight_tasks() {
    let mut registry = TaskRegistry::new();
    registry.register("fail", Arc::new(MockTask::failing_fatal("fail", "nope")));
    registry.register(
        "slow",
        Arc::new(MockTask::returning("slow", json!({})).with_delay(Duration::from_secs(5))),
    );

    let tasks = vec![
        WorkflowTask::new("slow", "slow"),
        WorkflowTask::new("bad", "fail"),
        WorkflowTask::new("later", "slow").depends_on("slow"),
    ];

    let executor = ParallelExecutor::new(
        Arc::new(registry),
        ExecutorConfig {
            max_workers: 2,
            fail_fast: true,
            ..ExecutorConfig::default()
        },
    );
    let ctx = ctx();
    let outcome = tokio::time::timeout(Duration::from_secs(2), executor.execute(&tasks, &ctx))
        .await
        .expect("fail-fast should not wait for the slow task")
        .unwrap();

    assert!(!outcome.results["slow"].is_success());
    assert_eq!(outcome.skipped, vec!["later"]);
    assert!(matches!(outcome.error, Some(ExecutorError::TaskFailures(_))));
    assert!(!ctx.is_cancelled(), "fail-fast must not cancel the caller");
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn cancellation_stops_scheduling_and_reports_cancelled() {
    let mut registry = TaskRegistry::new();
    registry.register(
        "work",
        Arc::new(MockTask::returning("work", json!({})).with_delay(Duration::from_millis(50))),
    );
    let tasks: Vec<WorkflowTask> = (0..50)
        .map(|i| WorkflowTask::new(format!("t{i}"), "work"))
        .collect();

    let ctx = ctx();
    let token = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        token.cancel();
    });

    let outcome = executor(registry, 4).execute(&tasks, &ctx).await.unwrap();

    assert!(outcome.completed() < 50);
    assert!(!outcome.skipped.is_empty());
    assert!(matches!(
        outcome.error,
        Some(ExecutorError::Cancelled { completed }) if completed == outcome.completed()
    ));
}

// ============================================================
// Determinism of side effects
// ============================================================

#[tokio::test]
async fn file_writes_produce_the_same_set_for_any_worker_count() {
    let expected: BTreeSet<String> = (0..50).map(|i| format!("file-{i:02}.txt")).collect();

    for workers in [1, 2, 4, 8, 16] {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(SandboxedFs::new(dir.path()).unwrap());
        let registry = TaskRegistry::with_builtins(fs);

        let tasks: Vec<WorkflowTask> = (0..50)
            .map(|i| {
                WorkflowTask::new(format!("write-{i}"), FILE_OP)
                    .with_input("operation", json!("write"))
                    .with_input("path", json!(format!("out/file-{i:02}.txt")))
                    .with_input("content", json!(format!("payload {i}")))
            })
            .collect();

        let outcome = executor(registry, workers).execute(&tasks, &ctx()).await.unwrap();
        assert!(outcome.is_success(), "workers={workers}: {:?}", outcome.error);

        let written: BTreeSet<String> = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(written, expected, "workers={workers}");
    }
}

//! Checkpoint persistence.
//!
//! [`CheckpointManager`] is what the engine talks to; storage sits behind the
//! [`CheckpointStore`] trait. Two stores ship with the crate: an in-process
//! [`MemoryCheckpointStore`] and a SQLite-backed [`SqliteCheckpointStore`].

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use db::models::CheckpointRow;
use db::repository::checkpoints;
use db::{DbError, DbPool};
use tasks::ExecutionContext;

use crate::error::CheckpointError;
use crate::models::Checkpoint;

/// Where checkpoints live. Records are append-only.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn insert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Most recently inserted checkpoint for `workflow_id`.
    async fn latest(&self, workflow_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Every checkpoint for `workflow_id`, oldest first.
    async fn list(&self, workflow_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Returns how many records were removed.
    async fn delete_all(&self, workflow_id: &str) -> Result<u64, CheckpointError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    by_workflow: DashMap<String, Vec<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn insert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.by_workflow
            .entry(checkpoint.workflow_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn latest(&self, workflow_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .by_workflow
            .get(workflow_id)
            .and_then(|entries| entries.last().cloned()))
    }

    async fn list(&self, workflow_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self
            .by_workflow
            .get(workflow_id)
            .map(|entries| entries.value().clone())
            .unwrap_or_default())
    }

    async fn delete_all(&self, workflow_id: &str) -> Result<u64, CheckpointError> {
        Ok(self
            .by_workflow
            .remove(workflow_id)
            .map(|(_, entries)| entries.len() as u64)
            .unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// Stores checkpoints in the `checkpoints` table via the `db` crate.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: DbPool,
}

impl SqliteCheckpointStore {
    /// The pool must already have migrations applied.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn to_row(checkpoint: &Checkpoint) -> Result<CheckpointRow, CheckpointError> {
    let state = serde_json::to_string(&checkpoint.state)
        .map_err(|e| CheckpointError::Corrupt(format!("cannot encode state: {e}")))?;
    Ok(CheckpointRow {
        id: checkpoint.id.to_string(),
        workflow_id: checkpoint.workflow_id.clone(),
        execution_id: checkpoint.execution_id.to_string(),
        task_id: checkpoint.task_id.clone(),
        state,
        created_at: checkpoint.created_at,
        recoverable: checkpoint.recoverable,
    })
}

fn from_row(row: CheckpointRow) -> Result<Checkpoint, CheckpointError> {
    let corrupt = |what: &str, e: &dyn std::fmt::Display| {
        CheckpointError::Corrupt(format!("checkpoint {}: bad {what}: {e}", row.id))
    };
    let id = Uuid::from_str(&row.id).map_err(|e| corrupt("id", &e))?;
    let execution_id = Uuid::from_str(&row.execution_id).map_err(|e| corrupt("execution_id", &e))?;
    let state: Map<String, Value> =
        serde_json::from_str(&row.state).map_err(|e| corrupt("state", &e))?;

    Ok(Checkpoint {
        id,
        workflow_id: row.workflow_id,
        execution_id,
        task_id: row.task_id,
        state,
        created_at: row.created_at,
        recoverable: row.recoverable,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn insert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        checkpoints::insert_checkpoint(&self.pool, &to_row(checkpoint)?).await?;
        Ok(())
    }

    async fn latest(&self, workflow_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        match checkpoints::latest_checkpoint(&self.pool, workflow_id).await {
            Ok(row) => from_row(row).map(Some),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, workflow_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        checkpoints::list_checkpoints(&self.pool, workflow_id)
            .await?
            .into_iter()
            .map(from_row)
            .collect()
    }

    async fn delete_all(&self, workflow_id: &str) -> Result<u64, CheckpointError> {
        Ok(checkpoints::delete_checkpoints(&self.pool, workflow_id).await?)
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Saves and loads checkpoints for the engine. Cheap to clone.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()))
    }

    pub fn sqlite(pool: DbPool) -> Self {
        Self::new(Arc::new(SqliteCheckpointStore::new(pool)))
    }

    /// Persist a recoverable checkpoint for the context's workflow.
    pub async fn save(
        &self,
        ctx: &ExecutionContext,
        last_task_id: &str,
        state: Map<String, Value>,
    ) -> Result<Checkpoint, CheckpointError> {
        self.save_with(ctx, last_task_id, state, true).await
    }

    #[instrument(
        skip(self, ctx, state),
        fields(workflow_id = %ctx.workflow_id(), execution_id = %ctx.execution_id())
    )]
    pub async fn save_with(
        &self,
        ctx: &ExecutionContext,
        last_task_id: &str,
        state: Map<String, Value>,
        recoverable: bool,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            workflow_id: ctx.workflow_id().to_owned(),
            execution_id: ctx.execution_id(),
            task_id: last_task_id.to_owned(),
            state,
            created_at: Utc::now(),
            recoverable,
        };
        self.store.insert(&checkpoint).await?;
        debug!(checkpoint_id = %checkpoint.id, "checkpoint saved");
        Ok(checkpoint)
    }

    /// The most recent checkpoint for `workflow_id`.
    ///
    /// # Errors
    /// [`CheckpointError::NotFound`] when none exists.
    pub async fn load(&self, workflow_id: &str) -> Result<Checkpoint, CheckpointError> {
        self.store
            .latest(workflow_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(workflow_id.to_owned()))
    }

    pub async fn list(&self, workflow_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.store.list(workflow_id).await
    }

    pub async fn delete_all(&self, workflow_id: &str) -> Result<u64, CheckpointError> {
        let removed = self.store.delete_all(workflow_id).await?;
        info!(workflow_id, removed, "checkpoints deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tasks::WorkflowConfig;
    use tokio_util::sync::CancellationToken;

    fn ctx(workflow_id: &str) -> ExecutionContext {
        ExecutionContext::new(
            workflow_id,
            Uuid::new_v4(),
            WorkflowConfig::default(),
            CancellationToken::new(),
        )
    }

    fn state(completed: &[&str]) -> Map<String, Value> {
        let mut state = Map::new();
        state.insert("completed".into(), json!(completed));
        state
    }

    async fn exercise(manager: CheckpointManager) {
        let ctx = ctx("wf-1");

        assert!(matches!(
            manager.load("wf-1").await,
            Err(CheckpointError::NotFound(id)) if id == "wf-1"
        ));

        manager.save(&ctx, "a", state(&["a"])).await.unwrap();
        let second = manager.save(&ctx, "b", state(&["a", "b"])).await.unwrap();
        manager.save(&self::ctx("wf-2"), "x", state(&["x"])).await.unwrap();

        let loaded = manager.load("wf-1").await.unwrap();
        assert_eq!(loaded.id, second.id);
        assert_eq!(loaded.task_id, "b");
        assert_eq!(loaded.state, state(&["a", "b"]));
        assert_eq!(loaded.execution_id, ctx.execution_id());
        assert!(loaded.recoverable);

        let listed = manager.list("wf-1").await.unwrap();
        assert_eq!(
            listed.iter().map(|c| c.task_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        assert_eq!(manager.delete_all("wf-1").await.unwrap(), 2);
        assert!(manager.list("wf-1").await.unwrap().is_empty());
        assert_eq!(manager.list("wf-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_save_load_list_delete() {
        exercise(CheckpointManager::in_memory()).await;
    }

    #[tokio::test]
    async fn sqlite_store_save_load_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("checkpoints.db").display());
        let pool = db::pool::create_pool(&url, 1).await.unwrap();
        db::pool::run_migrations(&pool).await.unwrap();

        exercise(CheckpointManager::sqlite(pool)).await;
    }

    #[tokio::test]
    async fn unrecoverable_flag_is_persisted() {
        let manager = CheckpointManager::in_memory();
        let ctx = ctx("wf");
        manager
            .save_with(&ctx, "final", Map::new(), false)
            .await
            .unwrap();
        assert!(!manager.load("wf").await.unwrap().recoverable);
    }
}

//! Checkpoint repository functions.

use sqlx::SqlitePool;

use crate::{models::CheckpointRow, DbError};

const COLUMNS: &str = "id, workflow_id, execution_id, task_id, state, created_at, recoverable";

/// Insert a checkpoint row. Rows are never updated afterwards.
pub async fn insert_checkpoint(pool: &SqlitePool, row: &CheckpointRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO checkpoints
            (id, workflow_id, execution_id, task_id, state, created_at, recoverable)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.id)
    .bind(&row.workflow_id)
    .bind(&row.execution_id)
    .bind(&row.task_id)
    .bind(&row.state)
    .bind(row.created_at)
    .bind(row.recoverable)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch the most recently inserted checkpoint for a workflow.
pub async fn latest_checkpoint(
    pool: &SqlitePool,
    workflow_id: &str,
) -> Result<CheckpointRow, DbError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM checkpoints WHERE workflow_id = ? ORDER BY seq DESC LIMIT 1"
    );
    sqlx::query_as::<_, CheckpointRow>(&sql)
        .bind(workflow_id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Return all checkpoints for a workflow, oldest first.
pub async fn list_checkpoints(
    pool: &SqlitePool,
    workflow_id: &str,
) -> Result<Vec<CheckpointRow>, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM checkpoints WHERE workflow_id = ? ORDER BY seq ASC");
    let rows = sqlx::query_as::<_, CheckpointRow>(&sql)
        .bind(workflow_id)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// Delete every checkpoint of a workflow and return how many rows went away.
pub async fn delete_checkpoints(pool: &SqlitePool, workflow_id: &str) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM checkpoints WHERE workflow_id = ?")
        .bind(workflow_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, run_migrations};
    use chrono::Utc;

    async fn pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let pool = create_pool(&url, 2).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (dir, pool)
    }

    fn row(id: &str, workflow_id: &str, task_id: &str) -> CheckpointRow {
        CheckpointRow {
            id: id.into(),
            workflow_id: workflow_id.into(),
            execution_id: "exec-1".into(),
            task_id: task_id.into(),
            state: r#"{"completed":["a"]}"#.into(),
            created_at: Utc::now(),
            recoverable: true,
        }
    }

    #[tokio::test]
    async fn insert_then_fetch_latest() {
        let (_dir, pool) = pool().await;
        insert_checkpoint(&pool, &row("c1", "wf", "a")).await.unwrap();
        insert_checkpoint(&pool, &row("c2", "wf", "b")).await.unwrap();
        insert_checkpoint(&pool, &row("c3", "other", "z")).await.unwrap();

        let latest = latest_checkpoint(&pool, "wf").await.unwrap();
        assert_eq!(latest.id, "c2");
        assert_eq!(latest.task_id, "b");
        assert_eq!(latest.state, r#"{"completed":["a"]}"#);
        assert!(latest.recoverable);

        let all = list_checkpoints(&pool, "wf").await.unwrap();
        assert_eq!(all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn delete_purges_only_one_workflow() {
        let (_dir, pool) = pool().await;
        insert_checkpoint(&pool, &row("c1", "wf", "a")).await.unwrap();
        insert_checkpoint(&pool, &row("c2", "other", "a")).await.unwrap();

        assert_eq!(delete_checkpoints(&pool, "wf").await.unwrap(), 1);
        assert!(list_checkpoints(&pool, "wf").await.unwrap().is_empty());
        assert!(matches!(latest_checkpoint(&pool, "wf").await, Err(DbError::NotFound)));
        assert_eq!(list_checkpoints(&pool, "other").await.unwrap().len(), 1);
    }
}

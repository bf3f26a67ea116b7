//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: they carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// checkpoints
// ---------------------------------------------------------------------------

/// A persisted checkpoint row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CheckpointRow {
    /// Checkpoint UUID, stored as text.
    pub id: String,
    pub workflow_id: String,
    /// Execution UUID, stored as text.
    pub execution_id: String,
    /// Last task completed when the checkpoint was taken.
    pub task_id: String,
    /// JSON-encoded state snapshot.
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub recoverable: bool,
}

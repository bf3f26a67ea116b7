//! `patch`: apply a unified diff to a sandboxed file.
//!
//! Inputs: `target_file`, `diff`, `reversible` (optional bool). When
//! `reversible` is set the output carries the inverse diff.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::diff;
use crate::fs::{FileOperations, FsError};
use crate::task::{required_str, TaskInputs};
use crate::{ExecutionContext, Task, TaskError};

pub struct PatchTask {
    fs: Arc<dyn FileOperations>,
}

impl PatchTask {
    pub fn new(fs: Arc<dyn FileOperations>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Task for PatchTask {
    fn name(&self) -> &str {
        "patch"
    }

    async fn execute(&self, ctx: &ExecutionContext, inputs: &TaskInputs) -> Result<Value, TaskError> {
        let target = required_str(inputs, "target_file")?;
        let patch = required_str(inputs, "diff")?;
        let reversible = match inputs.get("reversible") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(TaskError::InvalidInput {
                    input: "reversible",
                    reason: format!("expected a bool, got {other}"),
                })
            }
        };

        if ctx.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        // Compute the inverse first so a malformed diff fails before any write.
        let reverse_diff = if reversible {
            Some(diff::reverse(patch).map_err(|source| {
                TaskError::from(FsError::Patch {
                    path: self.fs.root().join(target),
                    source,
                })
            })?)
        } else {
            None
        };

        self.fs.apply_patch(target, patch).await?;

        let mut out = json!({ "target_file": target, "applied": true });
        if let Some(reverse_diff) = reverse_diff {
            out["reverse_diff"] = Value::String(reverse_diff);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::SandboxedFs;
    use crate::WorkflowConfig;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn applies_and_reports_reverse_diff() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(SandboxedFs::new(dir.path()).unwrap());
        fs.write_file("a.txt", b"one\ntwo\n").await.unwrap();
        let patch = fs.generate_diff("a.txt", "one\n2\n").await.unwrap();

        let task = PatchTask::new(fs.clone());
        let ctx = ExecutionContext::new(
            "wf",
            uuid::Uuid::new_v4(),
            WorkflowConfig::default(),
            CancellationToken::new(),
        );
        let inputs = json!({ "target_file": "a.txt", "diff": patch, "reversible": true });
        let out = task
            .execute(&ctx, inputs.as_object().unwrap())
            .await
            .unwrap();

        assert_eq!(fs.read_file("a.txt").await.unwrap(), b"one\n2\n");
        let reverse = out["reverse_diff"].as_str().unwrap();
        fs.apply_patch("a.txt", reverse).await.unwrap();
        assert_eq!(fs.read_file("a.txt").await.unwrap(), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn missing_inputs_fail() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(SandboxedFs::new(dir.path()).unwrap());
        let task = PatchTask::new(fs);
        let ctx = ExecutionContext::new(
            "wf",
            uuid::Uuid::new_v4(),
            WorkflowConfig::default(),
            CancellationToken::new(),
        );

        let err = task
            .execute(&ctx, json!({ "diff": "x" }).as_object().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput { input: "target_file", .. }));

        let err = task
            .execute(&ctx, json!({ "target_file": "a" }).as_object().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput { input: "diff", .. }));
    }
}

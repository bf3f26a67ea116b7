//! `file_op`: write, read or delete a file inside the sandbox.
//!
//! Inputs: `operation` (`write` | `read` | `delete`), `path`, `content`
//! (write only, defaults to empty).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::fs::FileOperations;
use crate::task::{optional_str, required_str, TaskInputs};
use crate::{ExecutionContext, Task, TaskError};

pub struct FileOpTask {
    fs: Arc<dyn FileOperations>,
}

impl FileOpTask {
    pub fn new(fs: Arc<dyn FileOperations>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Task for FileOpTask {
    fn name(&self) -> &str {
        "file_op"
    }

    async fn execute(&self, ctx: &ExecutionContext, inputs: &TaskInputs) -> Result<Value, TaskError> {
        let operation = required_str(inputs, "operation")?;
        let path = required_str(inputs, "path")?;

        if ctx.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        debug!(operation, path, execution_id = %ctx.execution_id(), "file_op");

        match operation {
            "write" => {
                let content = optional_str(inputs, "content")?.unwrap_or_default();
                self.fs.write_file(path, content.as_bytes()).await?;
                let checksum = self.fs.checksum(path).await?;
                Ok(json!({
                    "path": path,
                    "bytes_written": content.len(),
                    "checksum": checksum,
                }))
            }
            "read" => {
                let bytes = self.fs.read_file(path).await?;
                Ok(json!({
                    "path": path,
                    "content": String::from_utf8_lossy(&bytes),
                }))
            }
            "delete" => {
                self.fs.delete_file(path).await?;
                Ok(json!({ "path": path, "deleted": true }))
            }
            other => Err(TaskError::InvalidInput {
                input: "operation",
                reason: format!("unsupported operation '{other}' (expected write, read or delete)"),
            }),
        }
    }
}

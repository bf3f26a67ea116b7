//! `shell_cmd`: run an allow-listed executable.
//!
//! Inputs: `cmd`, `args` (optional list), `allowed_commands` (list),
//! `timeout` (optional, milliseconds). The command is checked against
//! `allowed_commands` before anything is spawned. No shell is involved:
//! `cmd` is executed directly with `args` as argv.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::task::{optional_str_list, required_str, TaskInputs};
use crate::{ExecutionContext, Task, TaskError};

#[derive(Debug, Default)]
pub struct ShellCmdTask;

impl ShellCmdTask {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Task for ShellCmdTask {
    fn name(&self) -> &str {
        "shell_cmd"
    }

    async fn execute(&self, ctx: &ExecutionContext, inputs: &TaskInputs) -> Result<Value, TaskError> {
        let cmd = required_str(inputs, "cmd")?;
        let allowed =
            optional_str_list(inputs, "allowed_commands")?.ok_or(TaskError::missing("allowed_commands"))?;
        let args = optional_str_list(inputs, "args")?.unwrap_or_default();
        let timeout = match inputs.get("timeout") {
            None | Some(Value::Null) => None,
            Some(v) => Some(Duration::from_millis(v.as_u64().ok_or_else(|| {
                TaskError::InvalidInput {
                    input: "timeout",
                    reason: format!("expected milliseconds, got {v}"),
                }
            })?)),
        };

        if !allowed.iter().any(|c| c == cmd) {
            warn!(cmd, "refusing to run command outside the allow-list");
            return Err(TaskError::CommandNotAllowed(cmd.to_owned()));
        }

        debug!(cmd, ?args, execution_id = %ctx.execution_id(), "spawning command");

        let mut command = Command::new(cmd);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = command.output();
        let output = tokio::select! {
            _ = ctx.cancelled() => return Err(TaskError::Cancelled),
            res = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, run)
                        .await
                        .map_err(|_| TaskError::Fatal(format!("'{cmd}' timed out after {limit:?}")))?,
                    None => run.await,
                }
                .map_err(|e| TaskError::Fatal(format!("failed to spawn '{cmd}': {e}")))
            } => res?,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(TaskError::Fatal(format!(
                "'{cmd}' exited with code {exit_code}: {}",
                text.trim_end()
            )));
        }

        Ok(json!({ "exit_code": exit_code, "output": text }))
    }
}

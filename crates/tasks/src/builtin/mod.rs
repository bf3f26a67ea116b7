//! Built-in task implementations: `file_op`, `patch` and `shell_cmd`.

mod file_op;
mod patch;
mod shell_cmd;

pub use file_op::FileOpTask;
pub use patch::PatchTask;
pub use shell_cmd::ShellCmdTask;

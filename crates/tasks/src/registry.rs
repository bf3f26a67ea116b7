//! Maps task type tags (`file_op`, `shell_cmd`, …) to implementations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::builtin::{FileOpTask, PatchTask, ShellCmdTask};
use crate::fs::FileOperations;
use crate::{RegistryError, Task};

/// Type tag of the built-in file operation task.
pub const FILE_OP: &str = "file_op";
/// Type tag of the built-in patch task.
pub const PATCH: &str = "patch";
/// Type tag of the built-in shell command task.
pub const SHELL_CMD: &str = "shell_cmd";

/// String-tagged lookup table of [`Task`] implementations.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `file_op`, `patch` and `shell_cmd`.
    pub fn with_builtins(file_ops: Arc<dyn FileOperations>) -> Self {
        let mut registry = Self::new();
        registry.register(FILE_OP, Arc::new(FileOpTask::new(Arc::clone(&file_ops))));
        registry.register(PATCH, Arc::new(PatchTask::new(file_ops)));
        registry.register(SHELL_CMD, Arc::new(ShellCmdTask::new()));
        registry
    }

    /// Bind `type_tag` to `task`. Re-registering a tag replaces the previous
    /// implementation.
    pub fn register(&mut self, type_tag: impl Into<String>, task: Arc<dyn Task>) {
        let type_tag = type_tag.into();
        debug!(type_tag = %type_tag, task = task.name(), "registering task type");
        self.tasks.insert(type_tag, task);
    }

    pub fn get(&self, type_tag: &str) -> Result<Arc<dyn Task>, RegistryError> {
        self.tasks
            .get(type_tag)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(type_tag.to_owned()))
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.tasks.contains_key(type_tag)
    }

    /// Registered tags, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTask;
    use serde_json::json;

    #[test]
    fn unknown_tag_is_not_registered() {
        let registry = TaskRegistry::new();
        assert_eq!(
            registry.get("nope").err(),
            Some(RegistryError::NotRegistered("nope".into()))
        );
    }

    #[test]
    fn re_registration_overwrites() {
        let mut registry = TaskRegistry::new();
        registry.register("custom", Arc::new(MockTask::returning("first", json!(1))));
        registry.register("custom", Arc::new(MockTask::returning("second", json!(2))));

        assert_eq!(registry.get("custom").unwrap().name(), "second");
        assert_eq!(registry.types(), vec!["custom"]);
    }

    #[test]
    fn builtins_are_registered() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(crate::fs::SandboxedFs::new(dir.path()).unwrap());
        let registry = TaskRegistry::with_builtins(fs);
        assert_eq!(registry.types(), vec![FILE_OP, PATCH, SHELL_CMD]);
    }
}

//! Reading and writing workflow definition documents (JSON or YAML).
//!
//! Every load validates structure: schema version, unique task IDs, known
//! dependencies and an acyclic graph. `load_file_with_registry` and
//! `load_file_checked` also check task types and `shell_cmd` allow-lists.

use std::path::Path;

use tasks::TaskRegistry;

use crate::error::{LoadError, ValidationError};
use crate::models::WorkflowDefinition;

/// On-disk document format, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            _ => Err(LoadError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

fn decode(text: &str, format: Format) -> Result<WorkflowDefinition, ValidationError> {
    match format {
        Format::Json => serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string())),
        Format::Yaml => serde_yaml::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string())),
    }
}

/// Parse and structurally validate a document.
pub fn parse(text: &str, format: Format) -> Result<WorkflowDefinition, ValidationError> {
    let def = decode(text, format)?;
    def.validate_structure()?;
    Ok(def)
}

pub fn from_json_str(text: &str) -> Result<WorkflowDefinition, ValidationError> {
    parse(text, Format::Json)
}

pub fn from_yaml_str(text: &str) -> Result<WorkflowDefinition, ValidationError> {
    parse(text, Format::Yaml)
}

fn read(path: &Path) -> Result<(String, Format), LoadError> {
    let format = Format::from_path(path)?;
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((text, format))
}

/// Load a definition from `path`; the extension picks the format.
pub fn load_file(path: impl AsRef<Path>) -> Result<WorkflowDefinition, LoadError> {
    let (text, format) = read(path.as_ref())?;
    Ok(parse(&text, format)?)
}

/// [`load_file`] plus task-type and allow-list checks against `registry`.
pub fn load_file_with_registry(
    path: impl AsRef<Path>,
    registry: &TaskRegistry,
) -> Result<WorkflowDefinition, LoadError> {
    load_file_checked(path, registry).map(|(def, _)| def)
}

/// Load and fully validate in a single pass, returning the execution order
/// the validation computed.
pub fn load_file_checked(
    path: impl AsRef<Path>,
    registry: &TaskRegistry,
) -> Result<(WorkflowDefinition, Vec<String>), LoadError> {
    let (text, format) = read(path.as_ref())?;
    let def = decode(&text, format)?;
    let order = def.validate(registry)?;
    Ok((def, order))
}

pub fn to_json_string(def: &WorkflowDefinition) -> Result<String, LoadError> {
    serde_json::to_string_pretty(def).map_err(|e| LoadError::Serialize(e.to_string()))
}

pub fn to_yaml_string(def: &WorkflowDefinition) -> Result<String, LoadError> {
    serde_yaml::to_string(def).map_err(|e| LoadError::Serialize(e.to_string()))
}

/// Write `def` to `path` in the format its extension names.
pub fn save_file(def: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<(), LoadError> {
    let path = path.as_ref();
    let text = match Format::from_path(path)? {
        Format::Json => to_json_string(def)?,
        Format::Yaml => to_yaml_string(def)?,
    };
    std::fs::write(path, text).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DagError;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tasks::SandboxedFs;

    const YAML: &str = r#"
schema_version: 1
id: release
name: Release pipeline
version: "2"
config:
  max_parallel: 2
  retries: 1
  timeout: 30000
  allowed_commands: [cargo]
tasks:
  - id: build
    type: shell_cmd
    inputs:
      cmd: cargo
      args: [build]
  - id: notes
    name: Write release notes
    type: file_op
    inputs:
      operation: write
      path: NOTES.md
      content: "v2"
    outputs: [NOTES.md]
    dependencies: [build]
    timeout: 1500
"#;

    #[test]
    fn yaml_document_loads_with_defaults_and_durations() {
        let def = from_yaml_str(YAML).unwrap();
        assert_eq!(def.id, "release");
        assert_eq!(def.config.max_parallel, 2);
        assert_eq!(def.config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(def.tasks.len(), 2);

        let notes = def.task("notes").unwrap();
        assert_eq!(notes.task_type, "file_op");
        assert_eq!(notes.dependencies, vec!["build"]);
        assert_eq!(notes.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(notes.inputs["path"], json!("NOTES.md"));
        assert!(def.task("build").unwrap().timeout.is_none());
    }

    #[test]
    fn json_and_yaml_round_trip() {
        let def = from_yaml_str(YAML).unwrap();
        assert_eq!(from_json_str(&to_json_string(&def).unwrap()).unwrap(), def);
        assert_eq!(from_yaml_str(&to_yaml_string(&def).unwrap()).unwrap(), def);
    }

    #[test]
    fn malformed_and_cyclic_documents_are_rejected() {
        assert!(matches!(
            from_json_str("{ \"id\": \"x\" }"),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            from_json_str(r#"{"schema_version": 2, "id": "x", "tasks": []}"#),
            Err(ValidationError::UnsupportedSchemaVersion { found: 2, expected: 1 })
        ));

        let cyclic = r#"{
            "id": "loop",
            "tasks": [
                {"id": "a", "type": "file_op", "dependencies": ["b"]},
                {"id": "b", "type": "file_op", "dependencies": ["a"]}
            ]
        }"#;
        assert!(matches!(
            from_json_str(cyclic),
            Err(ValidationError::Dag(DagError::CyclicDependency(_)))
        ));
    }

    #[test]
    fn files_save_and_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let def = from_yaml_str(YAML).unwrap();

        for name in ["wf.json", "wf.yaml", "wf.yml"] {
            let path = dir.path().join(name);
            save_file(&def, &path).unwrap();
            assert_eq!(load_file(&path).unwrap(), def);
        }

        assert!(matches!(
            save_file(&def, dir.path().join("wf.toml")),
            Err(LoadError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            load_file(dir.path().join("missing.json")),
            Err(LoadError::Io { .. })
        ));
    }

    #[test]
    fn registry_checks_apply_at_load_time() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(SandboxedFs::new(dir.path().join("sandbox")).unwrap());
        let registry = TaskRegistry::with_builtins(fs);

        let path = dir.path().join("wf.yaml");
        std::fs::write(&path, YAML).unwrap();
        assert!(load_file_with_registry(&path, &registry).is_ok());

        std::fs::write(&path, YAML.replace("cmd: cargo", "cmd: curl")).unwrap();
        assert!(matches!(
            load_file_with_registry(&path, &registry),
            Err(LoadError::Invalid(ValidationError::CommandNotAllowed { .. }))
        ));

        std::fs::write(&path, YAML.replace("type: file_op", "type: ftp_upload")).unwrap();
        assert!(matches!(
            load_file_with_registry(&path, &registry),
            Err(LoadError::Invalid(ValidationError::InvalidTaskType { .. }))
        ));
    }

    #[test]
    fn checked_load_returns_the_execution_order() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(SandboxedFs::new(dir.path().join("sandbox")).unwrap());
        let registry = TaskRegistry::with_builtins(fs);

        let path = dir.path().join("wf.yml");
        std::fs::write(&path, YAML).unwrap();
        let (def, order) = load_file_checked(&path, &registry).unwrap();
        assert_eq!(def.id, "release");
        assert_eq!(order, vec!["build", "notes"]);

        std::fs::write(&path, YAML.replace("dependencies: [build]", "dependencies: [deploy]")).unwrap();
        assert!(matches!(
            load_file_checked(&path, &registry),
            Err(LoadError::Invalid(ValidationError::Dag(DagError::UnknownNode { .. })))
        ));
    }
}

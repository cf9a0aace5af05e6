//! Loads workflow definitions from a directory.
//!
//! Every `*.json`, `*.yaml` and `*.yml` file holds one definition. The
//! registry type name is the document's `type` field, or the file stem.

use crate::error::EngineError;
use rstflow_core::{Registry, WorkflowDefinition, WorkflowDefinitionRaw};
use std::fs;
use std::path::{Path, PathBuf};

enum Format {
    Json,
    Yaml,
}

fn format_of(path: &Path) -> Option<Format> {
    match path.extension()?.to_str()? {
        "json" => Some(Format::Json),
        "yaml" | "yml" => Some(Format::Yaml),
        _ => None,
    }
}

fn load_error(path: &Path, reason: impl ToString) -> EngineError {
    EngineError::Load {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Parses one definition file.
pub fn load_file(path: &Path) -> Result<(String, WorkflowDefinition), EngineError> {
    let format = format_of(path).ok_or_else(|| load_error(path, "unsupported extension"))?;
    let content = fs::read_to_string(path)?;

    let raw: WorkflowDefinitionRaw = match format {
        Format::Json => serde_json::from_str(&content).map_err(|e| load_error(path, e))?,
        Format::Yaml => serde_yaml::from_str(&content).map_err(|e| load_error(path, e))?,
    };

    let type_name = match raw.type_name.clone() {
        Some(name) => name,
        None => path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| load_error(path, "cannot derive type name from file name"))?,
    };

    let definition = WorkflowDefinition::from_raw(raw).map_err(|e| load_error(path, e))?;
    Ok((type_name, definition))
}

/// Parses every definition file in `dir`, in file name order.
pub fn load_definitions(dir: &Path) -> Result<Vec<(String, WorkflowDefinition)>, EngineError> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && format_of(path).is_some())
        .collect();
    paths.sort();

    paths.iter().map(|path| load_file(path)).collect()
}

/// Loads and registers every definition in `dir`.
///
/// A missing directory registers nothing. Returns the number of types
/// registered.
pub fn register_all(registry: &Registry, dir: &Path) -> Result<usize, EngineError> {
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "definitions directory not found");
        return Ok(0);
    }

    let definitions = load_definitions(dir)?;
    for (type_name, definition) in &definitions {
        registry.register(type_name.as_str(), definition)?;
    }

    tracing::info!(
        dir = %dir.display(),
        count = definitions.len(),
        "definitions registered"
    );
    Ok(definitions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ORDER_JSON: &str = r#"{
        "id": "order",
        "initial": "idle",
        "states": {
            "idle": {"on": {"START": "picking"}},
            "picking": {"timeoutMinutes": 30, "on": {"TIMEOUT": "expired"}},
            "expired": {"final": true}
        }
    }"#;

    const APPROVAL_YAML: &str = r#"
type: approval
id: approval-v2
initial: pending
context:
  approvals: 0
states:
  pending:
    on:
      APPROVE:
        - target: approved
          guard: "ctx.approvals >= 1"
        - actions:
            - increment: approvals
  approved:
    type: final
"#;

    #[test]
    fn test_register_all() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("order.json"), ORDER_JSON).unwrap();
        fs::write(dir.path().join("flow.yaml"), APPROVAL_YAML).unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let registry = Registry::new();
        let count = register_all(&registry, dir.path()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(registry.type_names(), vec!["approval", "order"]);

        let approval = registry.lookup("approval").unwrap();
        assert_eq!(approval.id, "approval-v2");
        assert!(approval.is_final("approved"));
        assert_eq!(registry.lookup("order").unwrap().timeout_minutes("picking"), Some(30.0));
    }

    #[test]
    fn test_missing_dir() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let count = register_all(&registry, &dir.path().join("nope")).unwrap();
        assert_eq!(count, 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_malformed_file_names_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{\"id\": \"broken\"").unwrap();

        let err = load_definitions(dir.path()).unwrap_err();
        match err {
            EngineError::Load { path: p, .. } => assert_eq!(p, path),
            other => panic!("expected Load error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_graph_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("bad.json"),
            r#"{"id": "bad", "initial": "idle", "states": {"idle": {"on": {"GO": "nowhere"}}}}"#,
        )
        .unwrap();

        let registry = Registry::new();
        let err = register_all(&registry, dir.path()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_DEFINITION");
        assert!(registry.is_empty());
    }
}

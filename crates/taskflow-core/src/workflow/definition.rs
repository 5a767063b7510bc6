//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and `WorkflowDefinition`, validates the
//! structural constraints that do not need the graph (ids, version, retry
//! and timeout bounds, schema defaults), and discovers workflow files on
//! disk. Graph-level checks live in [`super::graph`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use taskflow_types::state::TASKS_KEY;
use taskflow_types::workflow::{MAX_RETRY_DELAY_SECS, RetryPolicy, WorkflowDefinition};
use thiserror::Error;

use super::expression::ExpressionError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A definition that can never execute. Raised at registration and submit,
/// before any execution state exists.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid definition: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("duplicate task id: '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("task '{task}' has a transition to unknown task '{target}'")]
    UnknownTransitionTarget { task: String, target: String },

    #[error("error handler targets unknown task '{0}'")]
    UnknownHandlerTarget(String),

    #[error("unknown start task '{0}'")]
    UnknownStartTask(String),

    #[error("cycle detected between tasks: {}", .tasks.join(", "))]
    CyclicGraph { tasks: Vec<String> },

    #[error("tasks unreachable from the start tasks: {}", .tasks.join(", "))]
    Unreachable { tasks: Vec<String> },

    #[error("task '{task}': {source}")]
    Expression {
        task: String,
        source: ExpressionError,
    },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML workflow and run the structural checks.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Structural validation of a definition.
///
/// Checks the workflow id and semantic version, task id uniqueness, action
/// references, retry/timeout bounds, reserved `publish` keys and the types
/// of input schema defaults.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if !valid_identifier(&def.id) {
        return Err(DefinitionError::Invalid(format!(
            "workflow id '{}' must be non-empty and contain only alphanumerics, '_', '-' or '.'",
            def.id
        )));
    }

    semver::Version::parse(&def.version).map_err(|e| {
        DefinitionError::Invalid(format!("version '{}' is not valid semver: {e}", def.version))
    })?;

    if def.tasks.is_empty() {
        return Err(DefinitionError::Invalid(
            "workflow must have at least one task".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for task in &def.tasks {
        if !valid_identifier(&task.id) {
            return Err(DefinitionError::Invalid(format!(
                "task id '{}' must be non-empty and contain only alphanumerics, '_', '-' or '.'",
                task.id
            )));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(DefinitionError::DuplicateTask(task.id.clone()));
        }
    }

    for task in &def.tasks {
        if task.action.component.is_empty() || task.action.action.is_empty() {
            return Err(DefinitionError::Invalid(format!(
                "task '{}' must name a component and an action",
                task.id
            )));
        }

        let mut deps = HashSet::new();
        for dep in &task.depends_on {
            if dep == &task.id {
                return Err(DefinitionError::CyclicGraph {
                    tasks: vec![task.id.clone()],
                });
            }
            if !deps.insert(dep.as_str()) {
                return Err(DefinitionError::Invalid(format!(
                    "task '{}' lists dependency '{dep}' more than once",
                    task.id
                )));
            }
        }

        if let Some(retry) = &task.retry {
            validate_retry(&task.id, retry)?;
        }

        if task.timeout_secs == Some(0) {
            return Err(DefinitionError::Invalid(format!(
                "task '{}' timeout must be > 0",
                task.id
            )));
        }

        for key in task.publish.keys() {
            if key.is_empty() || key == TASKS_KEY {
                return Err(DefinitionError::Invalid(format!(
                    "task '{}' cannot publish to reserved key '{key}'",
                    task.id
                )));
            }
        }
    }

    if def.max_concurrency == Some(0) {
        return Err(DefinitionError::Invalid(
            "max_concurrency must be >= 1".to_string(),
        ));
    }

    if def.timeout_secs == Some(0) {
        return Err(DefinitionError::Invalid(
            "timeout must be > 0".to_string(),
        ));
    }

    for (name, field) in &def.input_schema.fields {
        if let Some(default) = &field.default {
            if !field.field_type.matches(default) {
                return Err(DefinitionError::Invalid(format!(
                    "default for input field '{name}' is not of type {}",
                    field.field_type
                )));
            }
        }
    }

    Ok(())
}

fn validate_retry(task_id: &str, retry: &RetryPolicy) -> Result<(), DefinitionError> {
    if retry.max_attempts == 0 {
        return Err(DefinitionError::Invalid(format!(
            "task '{task_id}' retry.max_attempts must be >= 1"
        )));
    }
    if !retry.base_delay_secs.is_finite()
        || retry.base_delay_secs < 0.0
        || retry.base_delay_secs > MAX_RETRY_DELAY_SECS
    {
        return Err(DefinitionError::Invalid(format!(
            "task '{task_id}' retry.base_delay_secs must be between 0 and {MAX_RETRY_DELAY_SECS}"
        )));
    }
    if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier <= 0.0 {
        return Err(DefinitionError::Invalid(format!(
            "task '{task_id}' retry.backoff_multiplier must be > 0"
        )));
    }
    if let Some(cap) = retry.max_delay_secs {
        if !cap.is_finite() || cap < 0.0 || cap > MAX_RETRY_DELAY_SECS {
            return Err(DefinitionError::Invalid(format!(
                "task '{task_id}' retry.max_delay_secs must be between 0 and {MAX_RETRY_DELAY_SECS}"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load and validate a workflow from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Write a workflow to a YAML file, creating parent directories.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Recursively find `*.yaml` / `*.yml` workflows under `base_dir`.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_support::{definition, task};
    use serde_json::json;
    use taskflow_types::workflow::{FieldType, InputField};

    #[test]
    fn test_valid_definition_passes() {
        let def = definition(vec![task("a", &[]), task("b", &["a"])]);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut def = definition(vec![task("a", &[])]);
        def.version = "one".to_string();
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("semver"), "got: {err}");
    }

    #[test]
    fn test_empty_tasks_rejected() {
        let def = definition(vec![]);
        assert!(matches!(
            validate_definition(&def),
            Err(DefinitionError::Invalid(_))
        ));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let def = definition(vec![task("a", &[]), task("a", &[])]);
        assert!(matches!(
            validate_definition(&def),
            Err(DefinitionError::DuplicateTask(id)) if id == "a"
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let def = definition(vec![task("a", &["a"])]);
        assert!(matches!(
            validate_definition(&def),
            Err(DefinitionError::CyclicGraph { tasks }) if tasks == vec!["a".to_string()]
        ));
    }

    #[test]
    fn test_retry_bounds() {
        let mut a = task("a", &[]);
        a.retry = Some(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        });
        let err = validate_definition(&definition(vec![a])).unwrap_err();
        assert!(err.to_string().contains("max_attempts"), "got: {err}");

        let mut slow = task("slow", &[]);
        slow.retry = Some(RetryPolicy {
            base_delay_secs: 1e20,
            ..RetryPolicy::default()
        });
        let err = validate_definition(&definition(vec![slow])).unwrap_err();
        assert!(err.to_string().contains("base_delay_secs"), "got: {err}");

        let mut capped = task("capped", &[]);
        capped.retry = Some(RetryPolicy {
            max_delay_secs: Some(MAX_RETRY_DELAY_SECS * 2.0),
            ..RetryPolicy::default()
        });
        let err = validate_definition(&definition(vec![capped])).unwrap_err();
        assert!(err.to_string().contains("max_delay_secs"), "got: {err}");
    }

    #[test]
    fn test_reserved_publish_key() {
        let mut a = task("a", &[]);
        a.publish.insert("tasks".to_string(), "1".to_string());
        let err = validate_definition(&definition(vec![a])).unwrap_err();
        assert!(err.to_string().contains("reserved"), "got: {err}");
    }

    #[test]
    fn test_schema_default_type_checked() {
        let mut def = definition(vec![task("a", &[])]);
        def.input_schema.fields.insert(
            "limit".to_string(),
            InputField {
                field_type: FieldType::Integer,
                required: false,
                default: Some(json!("ten")),
                description: None,
            },
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("limit"), "got: {err}");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
id: report
version: 0.3.1
tasks:
  - id: fetch_data
    action: { component: http, action: get }
  - id: generate_report
    action: { component: report, action: render }
    depends_on: [fetch_data]
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(def.id, "report");
        assert_eq!(def.tasks[1].depends_on, vec!["fetch_data"]);

        assert!(matches!(
            parse_workflow_yaml("tasks: ["),
            Err(DefinitionError::Parse(_))
        ));
    }

    #[test]
    fn test_save_load_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        let def = definition(vec![task("a", &[]), task("b", &["a"])]);
        let path = dir.path().join("nested").join("pipeline.yaml");
        save_workflow_file(&path, &def).unwrap();

        let loaded = load_workflow_file(&path).unwrap();
        assert_eq!(loaded, def);

        std::fs::write(dir.path().join("broken.yml"), "id: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_workflows(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, path);

        let missing = discover_workflows(&dir.path().join("nope")).unwrap();
        assert!(missing.is_empty());
    }
}

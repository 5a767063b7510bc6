//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! concurrency caps, timeouts, storage backend and logging.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `<data_dir>/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cap on tasks running at once across all executions (None = unbounded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<usize>,

    /// Per-execution cap used when neither the definition nor the submit
    /// options set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_execution_concurrency: Option<usize>,

    /// Timeout applied to tasks that do not declare their own.
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,

    /// Wall-clock cap for executions whose definition sets none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_timeout_secs: Option<u64>,

    /// Capacity of the broadcast event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Capacity of each execution's state manager mailbox.
    #[serde(default = "default_state_mailbox_capacity")]
    pub state_mailbox_capacity: usize,

    /// Finished executions kept in memory with their full state. Older
    /// ones are answered from the persisted execution record.
    #[serde(default = "default_retained_executions")]
    pub retained_executions: usize,

    /// Environment variables visible to expressions under `env`.
    #[serde(default)]
    pub env_allowlist: Vec<String>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_event_buffer() -> usize {
    1024
}

fn default_state_mailbox_capacity() -> usize {
    256
}

fn default_retained_executions() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: None,
            default_execution_concurrency: None,
            default_task_timeout_secs: default_task_timeout_secs(),
            workflow_timeout_secs: None,
            event_buffer: default_event_buffer(),
            state_mailbox_capacity: default_state_mailbox_capacity(),
            retained_executions: default_retained_executions(),
            env_allowlist: Vec::new(),
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive (e.g. "taskflow_core=debug"). Falls back to
    /// `RUST_LOG`, then `info`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
    /// Bridge spans to OpenTelemetry with the stdout exporter.
    #[serde(default)]
    pub otel_stdout: bool,
}

/// Which storage adapter backs definitions, executions and checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    /// One JSON file per record under `root`.
    File { root: PathBuf },
    /// SQLite database file at `path`.
    Sqlite { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_task_timeout_secs, 300);
        assert_eq!(config.event_buffer, 1024);
        assert_eq!(config.retained_executions, 256);
        assert_eq!(config.storage, StorageConfig::Memory);
        assert!(config.max_concurrent_tasks.is_none());
        assert!(!config.logging.json);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_concurrent_tasks = 16
default_execution_concurrency = 4
default_task_timeout_secs = 60
env_allowlist = ["REGION", "STAGE"]

[logging]
filter = "taskflow_core=debug"
json = true

[storage]
backend = "sqlite"
path = "/var/lib/taskflow/engine.db"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrent_tasks, Some(16));
        assert_eq!(config.default_execution_concurrency, Some(4));
        assert_eq!(config.default_task_timeout_secs, 60);
        assert_eq!(config.env_allowlist, vec!["REGION", "STAGE"]);
        assert_eq!(config.logging.filter.as_deref(), Some("taskflow_core=debug"));
        assert!(config.logging.json);
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                path: PathBuf::from("/var/lib/taskflow/engine.db")
            }
        );
    }
}

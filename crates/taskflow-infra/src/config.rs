//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.taskflow/` unless
//! `TASKFLOW_DATA_DIR` is set) and deserializes it into [`EngineConfig`].
//! Falls back to defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use taskflow_types::config::{EngineConfig, StorageConfig};

const DATA_DIR_ENV: &str = "TASKFLOW_DATA_DIR";

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Relative storage paths are resolved against `data_dir`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(mut config) => {
            config.storage = resolve_storage_paths(config.storage, data_dir);
            config
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Data directory: `TASKFLOW_DATA_DIR`, else `~/.taskflow`.
pub fn default_data_dir() -> PathBuf {
    data_dir_from(|name| std::env::var(name).ok())
}

fn data_dir_from(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(dir) = env(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskflow")
}

fn resolve_storage_paths(storage: StorageConfig, data_dir: &Path) -> StorageConfig {
    let anchor = |path: PathBuf| {
        if path.is_relative() {
            data_dir.join(path)
        } else {
            path
        }
    };
    match storage {
        StorageConfig::Memory => StorageConfig::Memory,
        StorageConfig::File { root } => StorageConfig::File { root: anchor(root) },
        StorageConfig::Sqlite { path } => StorageConfig::Sqlite { path: anchor(path) },
    }
}

//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.nodeflow/` by default)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use nodeflow_types::config::EngineConfig;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config; omitted fields take their defaults.
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
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `NODEFLOW_DATA_DIR` environment variable
/// 2. `~/.nodeflow` under the user's home directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NODEFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".nodeflow");
    }

    // Last resort: current directory
    PathBuf::from(".nodeflow")
}

/// Directory holding durable checkpoints: `config.checkpoint_dir`, or
/// `{data_dir}/checkpoints`.
pub fn checkpoint_dir(data_dir: &Path, config: &EngineConfig) -> PathBuf {
    config
        .checkpoint_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("checkpoints"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
queue_capacity = 16
lease_duration_secs = 30
default_node_timeout_secs = 5
checkpoint_dir = "/var/lib/nodeflow/cp"
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.lease_duration(), Duration::from_secs(30));
        assert_eq!(config.default_node_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.dead_letter_capacity, 1000);
        assert_eq!(
            checkpoint_dir(tmp.path(), &config),
            PathBuf::from("/var/lib/nodeflow/cp")
        );
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn checkpoint_dir_defaults_under_data_dir() {
        let data_dir = PathBuf::from("/home/user/.nodeflow");
        assert_eq!(
            checkpoint_dir(&data_dir, &EngineConfig::default()),
            PathBuf::from("/home/user/.nodeflow/checkpoints")
        );
    }
}

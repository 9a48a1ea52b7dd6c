//! Engine configuration loader.
//!
//! Reads `agentflow.toml` from the data directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed, and clamps values the engine cannot work with.

use std::path::{Path, PathBuf};

use agentflow_types::config::EngineConfig;

/// File name looked up in the data directory.
pub const CONFIG_FILE_NAME: &str = "agentflow.toml";

/// Data directory from `AGENTFLOW_DATA_DIR`, falling back to `~/.agentflow`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var("AGENTFLOW_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".agentflow")
        }
    }
}

/// Load engine configuration from `{data_dir}/agentflow.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: a warning and the default.
/// - Otherwise the parsed config, passed through [`sanitize`].
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                path = %config_path.display(),
                "no engine config found, using defaults"
            );
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(
                path = %config_path.display(),
                error = %err,
                "failed to read engine config, using defaults"
            );
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!(
                path = %config_path.display(),
                error = %err,
                "failed to parse engine config, using defaults"
            );
            EngineConfig::default()
        }
    }
}

/// Replace values that would stall or disable the engine.
///
/// Zero concurrency, batch concurrency, checkpoint retention and breaker
/// threshold become 1; a zero step timeout falls back to the default; a zero
/// auto-checkpoint interval disables auto-checkpointing.
pub fn sanitize(mut config: EngineConfig) -> EngineConfig {
    let defaults = EngineConfig::default();

    if config.max_concurrent_steps == 0 {
        tracing::warn!("max_concurrent_steps = 0 is invalid, using 1");
        config.max_concurrent_steps = 1;
    }
    if config.batch_concurrency == 0 {
        tracing::warn!("batch_concurrency = 0 is invalid, using 1");
        config.batch_concurrency = 1;
    }
    if config.max_checkpoints_per_execution == 0 {
        tracing::warn!("max_checkpoints_per_execution = 0 is invalid, using 1");
        config.max_checkpoints_per_execution = 1;
    }
    if config.circuit_breaker.failure_threshold == 0 {
        tracing::warn!("circuit_breaker.failure_threshold = 0 is invalid, using 1");
        config.circuit_breaker.failure_threshold = 1;
    }
    if config.default_step_timeout_secs == 0 {
        tracing::warn!(
            default = defaults.default_step_timeout_secs,
            "default_step_timeout_secs = 0 is invalid, using the default"
        );
        config.default_step_timeout_secs = defaults.default_step_timeout_secs;
    }
    if config.auto_checkpoint_interval_secs == Some(0) {
        config.auto_checkpoint_interval_secs = None;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
max_concurrent_steps = 16
default_step_timeout_secs = 60
auto_checkpoint_interval_secs = 120
batch_concurrency = 4

[circuit_breaker]
failure_threshold = 3
cooldown_secs = 10
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_steps, 16);
        assert_eq!(config.default_step_timeout_secs, 60);
        assert_eq!(config.auto_checkpoint_interval_secs, Some(120));
        assert_eq!(config.batch_concurrency, 4);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.cooldown_secs, 10);
        assert_eq!(config.max_checkpoints_per_execution, 10);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "max_concurrent_steps = [oops")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_clamps_zero_values() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
max_concurrent_steps = 0
batch_concurrency = 0
default_step_timeout_secs = 0
auto_checkpoint_interval_secs = 0

[circuit_breaker]
failure_threshold = 0
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrent_steps, 1);
        assert_eq!(config.batch_concurrency, 1);
        assert_eq!(config.default_step_timeout_secs, 300);
        assert!(config.auto_checkpoint_interval_secs.is_none());
        assert_eq!(config.circuit_breaker.failure_threshold, 1);
    }

    #[test]
    fn default_data_dir_is_absolute_or_local() {
        let dir = default_data_dir();
        assert!(!dir.as_os_str().is_empty());
    }
}

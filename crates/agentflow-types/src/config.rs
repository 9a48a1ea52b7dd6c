//! Engine configuration types for agentflow.
//!
//! `EngineConfig` represents `agentflow.toml`. Every field has a default, so
//! an empty file (or no file) yields a working configuration.

use serde::{Deserialize, Serialize};

/// Tunables for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Step tasks allowed to run at once, across all executions.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    /// Per-step timeout used when a step declares none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// How long cancelled steps get to wind down before being aborted.
    #[serde(default = "default_cancellation_grace_ms")]
    pub cancellation_grace_ms: u64,

    /// Periodic checkpoint interval. `None` disables auto-checkpointing.
    #[serde(default)]
    pub auto_checkpoint_interval_secs: Option<u64>,

    /// Checkpoints retained per execution; older ones are pruned.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints_per_execution: usize,

    /// Age after which terminal executions are eligible for cleanup.
    #[serde(default = "default_execution_retention_secs")]
    pub execution_retention_secs: u64,

    /// TTL of cached workflow definitions.
    #[serde(default = "default_definition_cache_ttl_secs")]
    pub definition_cache_ttl_secs: u64,

    /// Batch items started at once in concurrent mode.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_max_concurrent_steps() -> usize {
    8
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_cancellation_grace_ms() -> u64 {
    5_000
}

fn default_max_checkpoints() -> usize {
    10
}

fn default_execution_retention_secs() -> u64 {
    86_400
}

fn default_definition_cache_ttl_secs() -> u64 {
    3_600
}

fn default_batch_concurrency() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: default_max_concurrent_steps(),
            default_step_timeout_secs: default_step_timeout_secs(),
            cancellation_grace_ms: default_cancellation_grace_ms(),
            auto_checkpoint_interval_secs: None,
            max_checkpoints_per_execution: default_max_checkpoints(),
            execution_retention_secs: default_execution_retention_secs(),
            definition_cache_ttl_secs: default_definition_cache_ttl_secs(),
            batch_concurrency: default_batch_concurrency(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Circuit breaker settings applied to every guarded dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before closing again.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_steps, 8);
        assert_eq!(config.default_step_timeout_secs, 300);
        assert_eq!(config.cancellation_grace_ms, 5_000);
        assert!(config.auto_checkpoint_interval_secs.is_none());
        assert_eq!(config.max_checkpoints_per_execution, 10);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.cooldown_secs, 60);
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_concurrent_steps = 2
auto_checkpoint_interval_secs = 30

[circuit_breaker]
failure_threshold = 3
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrent_steps, 2);
        assert_eq!(config.auto_checkpoint_interval_secs, Some(30));
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.cooldown_secs, 60);
        assert_eq!(config.default_step_timeout_secs, 300);
    }
}

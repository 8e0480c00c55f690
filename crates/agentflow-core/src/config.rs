//! Engine configuration, loaded from TOML.
//!
//! Every field carries a default so a partial file (or none at all) yields a
//! usable configuration.

use crate::error::{AgentflowError, AgentflowResult};
use crate::resources::ResourceVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Longest accepted heartbeat interval (one day).
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;

/// Top-level configuration for the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default = "default_max_parallel_workflows")]
    pub max_parallel_workflows: usize,
    #[serde(default = "default_resource_limits")]
    pub global_resource_limits: ResourceVector,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_poll_interval")]
    pub scheduler_poll_interval_ms: u64,
    #[serde(default = "default_barrier_timeout")]
    pub default_barrier_timeout_seconds: u64,
    #[serde(default = "default_consensus_timeout")]
    pub default_consensus_timeout_seconds: u64,
    #[serde(default = "default_retention_window")]
    pub retention_window_minutes: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_admission_retry")]
    pub admission_retry_interval_ms: u64,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_ms: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default)]
    pub planner: PlannerConfig,
}

/// Duration-estimation and plan-annotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Actions matching this regex are checkpointed.
    #[serde(default = "default_checkpoint_pattern")]
    pub checkpoint_action_pattern: String,
    /// Actions matching this regex are rollback-safe.
    #[serde(default = "default_safe_pattern")]
    pub safe_action_pattern: String,
    /// Estimate used when the agent kind is not in `agent_base_seconds`.
    #[serde(default = "default_task_seconds")]
    pub default_task_seconds: f64,
    /// Base duration in seconds per agent kind.
    #[serde(default = "default_agent_base_seconds")]
    pub agent_base_seconds: HashMap<String, f64>,
    /// Multiplier applied when an action name contains the keyword.
    #[serde(default = "default_complexity_multipliers")]
    pub complexity_multipliers: HashMap<String, f64>,
}

fn default_max_parallel_workflows() -> usize {
    10
}
fn default_resource_limits() -> ResourceVector {
    ResourceVector::new(16.0, 32.0, 100.0, 10.0, 0.0)
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    50
}
fn default_barrier_timeout() -> u64 {
    300
}
fn default_consensus_timeout() -> u64 {
    60
}
fn default_retention_window() -> u64 {
    60
}
fn default_worker_pool_size() -> usize {
    8
}
fn default_admission_retry() -> u64 {
    500
}
fn default_metrics_interval() -> u64 {
    1000
}
fn default_cleanup_interval() -> u64 {
    5
}
fn default_checkpoint_pattern() -> String {
    "deploy|migrat|delete|release".to_string()
}
fn default_safe_pattern() -> String {
    "read|analy|fetch|list|validate".to_string()
}
fn default_task_seconds() -> f64 {
    60.0
}
fn default_agent_base_seconds() -> HashMap<String, f64> {
    [
        ("research", 120.0),
        ("analysis", 90.0),
        ("coder", 180.0),
        ("tester", 90.0),
        ("reviewer", 60.0),
        ("deployer", 150.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
fn default_complexity_multipliers() -> HashMap<String, f64> {
    [
        ("refactor", 1.8),
        ("migrate", 2.0),
        ("implement", 1.5),
        ("analyze", 1.3),
        ("deploy", 1.4),
        ("validate", 0.8),
        ("fetch", 0.5),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            checkpoint_action_pattern: default_checkpoint_pattern(),
            safe_action_pattern: default_safe_pattern(),
            default_task_seconds: default_task_seconds(),
            agent_base_seconds: default_agent_base_seconds(),
            complexity_multipliers: default_complexity_multipliers(),
        }
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_parallel_workflows: default_max_parallel_workflows(),
            global_resource_limits: default_resource_limits(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            scheduler_poll_interval_ms: default_poll_interval(),
            default_barrier_timeout_seconds: default_barrier_timeout(),
            default_consensus_timeout_seconds: default_consensus_timeout(),
            retention_window_minutes: default_retention_window(),
            worker_pool_size: default_worker_pool_size(),
            admission_retry_interval_ms: default_admission_retry(),
            metrics_interval_ms: default_metrics_interval(),
            cleanup_interval_seconds: default_cleanup_interval(),
            planner: PlannerConfig::default(),
        }
    }
}

impl OrchestrationConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> AgentflowResult<Self> {
        let config: OrchestrationConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> AgentflowResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentflowError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> AgentflowResult<()> {
        if self.max_parallel_workflows == 0 {
            return Err(AgentflowError::Config(
                "max_parallel_workflows must be at least 1".into(),
            ));
        }
        if self.scheduler_poll_interval_ms == 0 {
            return Err(AgentflowError::Config(
                "scheduler_poll_interval_ms must be positive".into(),
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(AgentflowError::Config(
                "worker_pool_size must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(AgentflowError::Config(
                "heartbeat_interval_seconds must be positive".into(),
            ));
        }
        if self.heartbeat_interval_seconds > MAX_HEARTBEAT_INTERVAL_SECS {
            return Err(AgentflowError::Config(format!(
                "heartbeat_interval_seconds must be at most {MAX_HEARTBEAT_INTERVAL_SECS}"
            )));
        }
        if !self.global_resource_limits.is_non_negative() {
            return Err(AgentflowError::Config(
                "global_resource_limits must not contain negative values".into(),
            ));
        }
        for (name, pattern) in [
            ("checkpoint_action_pattern", &self.planner.checkpoint_action_pattern),
            ("safe_action_pattern", &self.planner.safe_action_pattern),
        ] {
            regex::Regex::new(pattern)
                .map_err(|e| AgentflowError::Config(format!("Invalid {name} '{pattern}': {e}")))?;
        }
        if self.planner.default_task_seconds <= 0.0 {
            return Err(AgentflowError::Config(
                "planner.default_task_seconds must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_secs(self.default_barrier_timeout_seconds)
    }

    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_secs(self.default_consensus_timeout_seconds)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_window_minutes.saturating_mul(60))
    }

    pub fn admission_retry_interval(&self) -> Duration {
        Duration::from_millis(self.admission_retry_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.retention_window(), Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_toml() {
        let config = OrchestrationConfig::from_toml_str(
            r#"
            max_parallel_workflows = 2
            heartbeat_interval_seconds = 5

            [global_resource_limits]
            cpu = 4.0
            "#,
        )
        .unwrap();
        assert_eq!(config.max_parallel_workflows, 2);
        assert_eq!(config.global_resource_limits.cpu, 4.0);
        assert_eq!(config.global_resource_limits.memory, 0.0);
        assert_eq!(config.worker_pool_size, 8);
        assert!(config.planner.agent_base_seconds.contains_key("coder"));
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let err = OrchestrationConfig::from_toml_str("scheduler_poll_interval_ms = 0").unwrap_err();
        assert!(matches!(err, AgentflowError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_regex() {
        let err = OrchestrationConfig::from_toml_str(
            r#"
            [planner]
            checkpoint_action_pattern = "deploy("
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("checkpoint_action_pattern"));
    }

    #[test]
    fn test_rejects_oversized_heartbeat_interval() {
        let raw = "heartbeat_interval_seconds = 9223372036854775807";
        let err = OrchestrationConfig::from_toml_str(raw).unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval_seconds"));
        assert!(OrchestrationConfig::from_toml_str("heartbeat_interval_seconds = 86400").is_ok());
    }

    #[test]
    fn test_retention_window_saturates() {
        let config = OrchestrationConfig {
            retention_window_minutes: u64::MAX,
            ..OrchestrationConfig::default()
        };
        assert_eq!(config.retention_window(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_malformed_toml() {
        let err = OrchestrationConfig::from_toml_str("max_parallel_workflows = [").unwrap_err();
        assert!(matches!(err, AgentflowError::Toml(_)));
    }
}

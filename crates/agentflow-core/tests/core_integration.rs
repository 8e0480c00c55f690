#![allow(clippy::unwrap_used, clippy::expect_used)]

use agentflow_core::*;
use std::io::Write;
use std::time::Duration;

// ---------------------------------------------------------------------------
// 1. Config file loading
// ---------------------------------------------------------------------------

#[test]
fn config_loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
max_parallel_workflows = 3
scheduler_poll_interval_ms = 20
default_barrier_timeout_seconds = 5
retention_window_minutes = 15

[global_resource_limits]
cpu = 4.0
memory = 8.0

[planner]
checkpoint_action_pattern = "deploy"
default_task_seconds = 30.0
"#
    )
    .unwrap();

    let config = OrchestrationConfig::from_file(file.path()).unwrap();
    assert_eq!(config.max_parallel_workflows, 3);
    assert_eq!(config.poll_interval(), Duration::from_millis(20));
    assert_eq!(config.barrier_timeout(), Duration::from_secs(5));
    assert_eq!(config.retention_window(), Duration::from_secs(900));
    assert_eq!(config.global_resource_limits.cpu, 4.0);
    assert_eq!(config.planner.checkpoint_action_pattern, "deploy");
    assert_eq!(config.planner.safe_action_pattern, "read|analy|fetch|list|validate");
}

#[test]
fn config_missing_file_is_config_error() {
    let err = OrchestrationConfig::from_file("/definitely/not/here.toml").unwrap_err();
    assert!(matches!(err, AgentflowError::Config(_)));
    assert!(err.to_string().contains("Failed to read config file"));
}

// ---------------------------------------------------------------------------
// 2. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let err = AgentflowError::Validation("cycle detected".to_string());
    assert_eq!(err.to_string(), "Validation error: cycle detected");

    let err = AgentflowError::SynchronizationTimeout {
        id: "barrier-1".to_string(),
    };
    assert_eq!(err.to_string(), "Synchronization timeout on 'barrier-1'");

    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: AgentflowError = json_err.into();
    assert!(matches!(err, AgentflowError::Serialization(_)));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: AgentflowError = io_err.into();
    assert!(err.to_string().starts_with("IO error"));
}

// ---------------------------------------------------------------------------
// 3. Registry snapshot serialization
// ---------------------------------------------------------------------------

#[test]
fn agent_record_serializes_for_snapshots() {
    let registry = AgentRegistry::new();
    registry
        .register(
            AgentRecord::new("gpu-worker", "research", 1)
                .with_resources(ResourceVector::new(2.0, 4.0, 0.0, 1.0, 1.0))
                .with_capabilities(vec!["embed".into()]),
        )
        .unwrap();

    let json = serde_json::to_value(registry.list()).unwrap();
    assert_eq!(json[0]["name"], "gpu-worker");
    assert_eq!(json[0]["resources"]["gpu"], 1.0);
    assert_eq!(json[0]["alive"], true);
}

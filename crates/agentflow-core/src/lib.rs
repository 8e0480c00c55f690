//! Core types and error definitions for the Agentflow engine.
//!
//! This crate provides the foundations shared by the planner, scheduler and
//! coordination crates.
//!
//! # Main types
//!
//! - [`AgentflowError`]: Error taxonomy for every engine subsystem.
//! - [`AgentflowResult`]: Convenience alias for `Result<T, AgentflowError>`.
//! - [`OrchestrationConfig`]: TOML-backed engine configuration.
//! - [`ResourceVector`]: cpu/memory/storage/network/gpu units.
//! - [`AgentRegistry`]: Read-mostly registry of [`AgentRecord`]s.
//! - [`Shutdown`]: Stop signal shared by the background loops.

/// Agent records, liveness and rolling statistics.
pub mod agent;
/// Engine configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Resource vectors used for admission control.
pub mod resources;
/// Cooperative shutdown signal.
pub mod shutdown;
/// Tracing subscriber initialisation.
pub mod telemetry;

pub use agent::{AgentRecord, AgentRegistry, AgentStats, LIVENESS_MULTIPLIER};
pub use config::{OrchestrationConfig, PlannerConfig};
pub use error::{AgentflowError, AgentflowResult};
pub use resources::ResourceVector;
pub use shutdown::Shutdown;

//! Synchronization primitives for agents that need to rendezvous.
//!
//! The [`CoordinationBus`] owns every barrier and consensus group and fans
//! finished results out to their participants. Leader election is a thin
//! layer over consensus, and the [`HeartbeatMonitor`] keeps agent liveness in
//! the shared [`agentflow_core::AgentRegistry`] up to date.
//!
//! # Main types
//!
//! - [`CoordinationBus`]: Barriers, consensus groups, notices and cleanup.
//! - [`Barrier`] / [`ConsensusGroup`]: The primitives' state machines.
//! - [`LeaderElection`]: Consensus-gated election with a pluggable [`LeaderSelector`].
//! - [`HeartbeatMonitor`]: Liveness sweep and probe broadcast.

/// Barrier state machine.
pub mod barrier;
/// The coordination bus.
pub mod bus;
/// Consensus state machine.
pub mod consensus;
/// Leader election over consensus.
pub mod election;
/// Heartbeat liveness.
pub mod heartbeat;
/// Results, notices and statistics.
pub mod types;

pub use barrier::{ArriveOutcome, Barrier};
pub use bus::CoordinationBus;
pub use consensus::{majority, ConsensusGroup, VoteOutcome};
pub use election::{FirstCandidate, LeaderElection, LeaderSelector};
pub use heartbeat::HeartbeatMonitor;
pub use types::{
    BarrierResult, CleanupReport, ConsensusDecision, ConsensusResult, CoordinationEvent,
    CoordinationNotice, CoordinationStats, SyncStatus,
};

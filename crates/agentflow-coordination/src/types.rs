use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use agentflow_core::{AgentflowError, AgentflowResult};

/// How a barrier ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    TimedOut,
    Cancelled,
}

/// Final state of a barrier, delivered to every participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierResult {
    pub barrier_id: String,
    pub status: SyncStatus,
    pub arrived: Vec<String>,
    pub missing: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl BarrierResult {
    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Completed
    }

    /// Turn a timeout or cancellation into an error.
    pub fn into_result(self) -> AgentflowResult<BarrierResult> {
        match self.status {
            SyncStatus::Completed => Ok(self),
            SyncStatus::TimedOut => Err(AgentflowError::SynchronizationTimeout {
                id: self.barrier_id,
            }),
            SyncStatus::Cancelled => Err(AgentflowError::Cancelled(format!(
                "barrier '{}' cancelled",
                self.barrier_id
            ))),
        }
    }
}

/// Outcome of a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusDecision {
    Approved,
    Rejected,
    TimedOut,
}

/// Final tally of a consensus group, delivered to every participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub consensus_id: String,
    pub decision: ConsensusDecision,
    pub yes_votes: usize,
    pub no_votes: usize,
    pub required_yes: usize,
    pub proposal: serde_json::Value,
    pub votes: BTreeMap<String, bool>,
    pub finalized_at: DateTime<Utc>,
}

impl ConsensusResult {
    pub fn is_approved(&self) -> bool {
        self.decision == ConsensusDecision::Approved
    }
}

/// Messages fanned out by the bus. Timeouts travel on the same channel as
/// successes and are told apart by their status field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationNotice {
    BarrierReleased {
        recipient: String,
        result: BarrierResult,
    },
    ConsensusFinalized {
        recipient: String,
        result: ConsensusResult,
    },
    LeaderElected {
        election_id: String,
        leader: String,
    },
    HeartbeatProbe {
        agent: String,
        sent_at: DateTime<Utc>,
    },
    AgentDown {
        agent: String,
    },
}

impl CoordinationNotice {
    /// Participant a notice is addressed to, if any.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            CoordinationNotice::BarrierReleased { recipient, .. }
            | CoordinationNotice::ConsensusFinalized { recipient, .. } => Some(recipient.as_str()),
            CoordinationNotice::HeartbeatProbe { agent, .. } => Some(agent.as_str()),
            _ => None,
        }
    }
}

/// One entry of the bus's timestamped history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub at: DateTime<Utc>,
    pub primitive: String,
    pub id: String,
    pub event: String,
}

/// Counts exposed to the metrics collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationStats {
    pub open_barriers: usize,
    pub open_consensus: usize,
    pub finished_awaiting_cleanup: usize,
    pub barriers_completed: u64,
    pub barriers_timed_out: u64,
    pub consensus_approved: u64,
    pub consensus_rejected: u64,
    pub consensus_timed_out: u64,
    pub history_len: usize,
}

/// What one cleanup sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired_barriers: Vec<String>,
    pub expired_consensus: Vec<String>,
    pub removed_finished: usize,
    pub trimmed_events: usize,
}

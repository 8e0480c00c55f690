//! Consensus-gated leader election.
//!
//! Voters approve or reject holding an election over a candidate list; once
//! approved, a [`LeaderSelector`] picks the leader. The default
//! [`FirstCandidate`] selector takes the first candidate as supplied, and can
//! be swapped for a ranking strategy without touching the consensus primitive.

use crate::bus::CoordinationBus;
use crate::types::{ConsensusDecision, ConsensusResult, CoordinationNotice};
use agentflow_core::{AgentflowError, AgentflowResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Picks a leader from the candidates of an approved election.
pub trait LeaderSelector: Send + Sync {
    fn select(&self, candidates: &[String], tally: &ConsensusResult) -> Option<String>;
}

/// Selects the first candidate in the supplied order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCandidate;

impl LeaderSelector for FirstCandidate {
    fn select(&self, candidates: &[String], _tally: &ConsensusResult) -> Option<String> {
        candidates.first().cloned()
    }
}

/// Runs elections on top of a [`CoordinationBus`].
pub struct LeaderElection {
    bus: Arc<CoordinationBus>,
    selector: Box<dyn LeaderSelector>,
}

impl LeaderElection {
    pub fn new(bus: Arc<CoordinationBus>) -> Self {
        Self::with_selector(bus, Box::new(FirstCandidate))
    }

    pub fn with_selector(bus: Arc<CoordinationBus>, selector: Box<dyn LeaderSelector>) -> Self {
        Self { bus, selector }
    }

    /// Open an election. Voters then cast their votes through
    /// [`CoordinationBus::vote`] using `election_id`.
    pub fn start(
        &self,
        election_id: &str,
        voters: Vec<String>,
        candidates: Vec<String>,
        timeout: Option<Duration>,
    ) -> AgentflowResult<()> {
        if candidates.is_empty() {
            return Err(AgentflowError::Validation(format!(
                "election '{election_id}' has no candidates"
            )));
        }
        let proposal = serde_json::json!({
            "kind": "leader_election",
            "candidates": candidates,
        });
        self.bus
            .start_consensus(election_id, voters, proposal, None, timeout)
    }

    /// Wait for the vote and pick the leader.
    ///
    /// Returns `Ok(None)` when the voters reject the election and a
    /// synchronization timeout when the vote does not finish in time.
    pub async fn resolve(&self, election_id: &str) -> AgentflowResult<Option<String>> {
        let tally = self.bus.wait_consensus(election_id).await?;
        match tally.decision {
            ConsensusDecision::Approved => {
                let candidates: Vec<String> = tally
                    .proposal
                    .get("candidates")
                    .cloned()
                    .map(serde_json::from_value::<Vec<String>>)
                    .transpose()?
                    .unwrap_or_default();
                let leader = self.selector.select(&candidates, &tally);
                if let Some(leader) = &leader {
                    info!(election_id, leader = %leader, "Leader elected");
                    self.bus.publish(CoordinationNotice::LeaderElected {
                        election_id: election_id.to_string(),
                        leader: leader.clone(),
                    });
                }
                Ok(leader)
            }
            ConsensusDecision::Rejected => {
                info!(election_id, "Election rejected by voters");
                Ok(None)
            }
            ConsensusDecision::TimedOut => Err(AgentflowError::SynchronizationTimeout {
                id: election_id.to_string(),
            }),
        }
    }
}

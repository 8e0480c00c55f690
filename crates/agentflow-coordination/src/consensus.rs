use crate::types::{ConsensusDecision, ConsensusResult};
use agentflow_core::{AgentflowError, AgentflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Result of a single `vote` call.
#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    /// Recorded; the group is still open.
    Pending {
        yes: usize,
        no: usize,
        outstanding: usize,
    },
    /// This vote finalized the group.
    Finalized(ConsensusResult),
    /// The group had already finalized; the vote was dropped.
    Ignored,
}

/// Majority of `participants`.
pub fn majority(participants: usize) -> usize {
    participants / 2 + 1
}

/// A yes/no vote among a fixed set of participants toward a yes-threshold.
///
/// A participant may vote again; the later vote replaces the earlier one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusGroup {
    pub id: String,
    pub participants: BTreeSet<String>,
    pub proposal: serde_json::Value,
    pub votes: BTreeMap<String, bool>,
    pub required_yes: usize,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub result: Option<ConsensusResult>,
}

impl ConsensusGroup {
    /// `required_yes` defaults to a simple majority of the participants.
    pub fn new(
        id: impl Into<String>,
        participants: impl IntoIterator<Item = String>,
        proposal: serde_json::Value,
        required_yes: Option<usize>,
        deadline: DateTime<Utc>,
    ) -> AgentflowResult<Self> {
        let id = id.into();
        let participants: BTreeSet<String> = participants.into_iter().collect();
        if participants.is_empty() {
            return Err(AgentflowError::Validation(format!(
                "consensus '{id}' needs at least one participant"
            )));
        }
        let required_yes = required_yes.unwrap_or_else(|| majority(participants.len()));
        if required_yes == 0 || required_yes > participants.len() {
            return Err(AgentflowError::Validation(format!(
                "consensus '{id}' requires {required_yes} yes votes from {} participants",
                participants.len()
            )));
        }
        Ok(Self {
            id,
            participants,
            proposal,
            votes: BTreeMap::new(),
            required_yes,
            created_at: Utc::now(),
            deadline,
            result: None,
        })
    }

    pub fn is_finalized(&self) -> bool {
        self.result.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_finalized() && now >= self.deadline
    }

    pub fn yes_votes(&self) -> usize {
        self.votes.values().filter(|v| **v).count()
    }

    pub fn no_votes(&self) -> usize {
        self.votes.values().filter(|v| !**v).count()
    }

    /// Participants that have not voted yet.
    pub fn outstanding(&self) -> usize {
        self.participants.len() - self.votes.len()
    }

    pub fn vote(
        &mut self,
        participant: &str,
        approve: bool,
        now: DateTime<Utc>,
    ) -> AgentflowResult<VoteOutcome> {
        if self.is_finalized() {
            return Ok(VoteOutcome::Ignored);
        }
        if !self.participants.contains(participant) {
            return Err(AgentflowError::Validation(format!(
                "'{participant}' is not a participant of consensus '{}'",
                self.id
            )));
        }
        if let Some(previous) = self.votes.insert(participant.to_string(), approve) {
            if previous != approve {
                debug!(consensus_id = %self.id, participant, approve, "Vote overwritten");
            }
        }
        Ok(match self.evaluate(now) {
            Some(result) => VoteOutcome::Finalized(result),
            None => VoteOutcome::Pending {
                yes: self.yes_votes(),
                no: self.no_votes(),
                outstanding: self.outstanding(),
            },
        })
    }

    /// Approve once the threshold is met, reject once it can no longer be met.
    fn evaluate(&mut self, now: DateTime<Utc>) -> Option<ConsensusResult> {
        let yes = self.yes_votes();
        if yes >= self.required_yes {
            return self.finalize(ConsensusDecision::Approved, now);
        }
        if yes + self.outstanding() < self.required_yes {
            return self.finalize(ConsensusDecision::Rejected, now);
        }
        None
    }

    /// Finalize as timed out. Returns the result only if this call finalized it.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<ConsensusResult> {
        self.finalize(ConsensusDecision::TimedOut, now)
    }

    fn finalize(&mut self, decision: ConsensusDecision, now: DateTime<Utc>) -> Option<ConsensusResult> {
        if self.result.is_some() {
            return None;
        }
        let result = ConsensusResult {
            consensus_id: self.id.clone(),
            decision,
            yes_votes: self.yes_votes(),
            no_votes: self.no_votes(),
            required_yes: self.required_yes,
            proposal: self.proposal.clone(),
            votes: self.votes.clone(),
            finalized_at: now,
        };
        self.result = Some(result.clone());
        Some(result)
    }
}

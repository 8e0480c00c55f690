use crate::types::{BarrierResult, SyncStatus};
use agentflow_core::{AgentflowError, AgentflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Result of a single `arrive` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ArriveOutcome {
    /// Recorded; still waiting on `remaining` participants.
    Waiting { remaining: usize },
    /// This arrival completed the barrier.
    Released(BarrierResult),
    /// The barrier had already finished; nothing changed.
    AlreadyComplete,
}

/// A rendezvous point that releases once every participant has arrived.
///
/// The result is set exactly once, either when the arrived set covers the
/// participants or when the barrier is cancelled or expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Barrier {
    pub id: String,
    pub participants: BTreeSet<String>,
    pub arrived: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub result: Option<BarrierResult>,
}

impl Barrier {
    pub fn new(
        id: impl Into<String>,
        participants: impl IntoIterator<Item = String>,
        deadline: Option<DateTime<Utc>>,
    ) -> AgentflowResult<Self> {
        let id = id.into();
        let participants: BTreeSet<String> = participants.into_iter().collect();
        if participants.is_empty() {
            return Err(AgentflowError::Validation(format!(
                "barrier '{id}' needs at least one participant"
            )));
        }
        Ok(Self {
            id,
            participants,
            arrived: BTreeSet::new(),
            created_at: Utc::now(),
            deadline,
            result: None,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_complete() && self.deadline.is_some_and(|d| now >= d)
    }

    pub fn remaining(&self) -> usize {
        self.participants.difference(&self.arrived).count()
    }

    /// Record an arrival. Repeated arrivals by the same participant are no-ops.
    pub fn arrive(&mut self, participant: &str, now: DateTime<Utc>) -> AgentflowResult<ArriveOutcome> {
        if self.is_complete() {
            return Ok(ArriveOutcome::AlreadyComplete);
        }
        if !self.participants.contains(participant) {
            return Err(AgentflowError::Validation(format!(
                "'{participant}' is not a participant of barrier '{}'",
                self.id
            )));
        }
        self.arrived.insert(participant.to_string());
        if self.arrived.is_superset(&self.participants) {
            return Ok(match self.finish(SyncStatus::Completed, now) {
                Some(result) => ArriveOutcome::Released(result),
                None => ArriveOutcome::AlreadyComplete,
            });
        }
        Ok(ArriveOutcome::Waiting {
            remaining: self.remaining(),
        })
    }

    /// Finish as cancelled. Returns the result only if this call finished it.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Option<BarrierResult> {
        self.finish(SyncStatus::Cancelled, now)
    }

    /// Finish as timed out. Returns the result only if this call finished it.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<BarrierResult> {
        self.finish(SyncStatus::TimedOut, now)
    }

    fn finish(&mut self, status: SyncStatus, now: DateTime<Utc>) -> Option<BarrierResult> {
        if self.result.is_some() {
            return None;
        }
        let result = BarrierResult {
            barrier_id: self.id.clone(),
            status,
            arrived: self.arrived.iter().cloned().collect(),
            missing: self.participants.difference(&self.arrived).cloned().collect(),
            finished_at: now,
        };
        self.result = Some(result.clone());
        Some(result)
    }
}

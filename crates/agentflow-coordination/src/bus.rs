use crate::barrier::{ArriveOutcome, Barrier};
use crate::consensus::{ConsensusGroup, VoteOutcome};
use crate::types::{
    BarrierResult, CleanupReport, ConsensusDecision, ConsensusResult, CoordinationEvent,
    CoordinationNotice, CoordinationStats, SyncStatus,
};
use agentflow_core::{AgentflowError, AgentflowResult, OrchestrationConfig, Shutdown};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const NOTICE_CAPACITY: usize = 1024;

struct BarrierSlot {
    barrier: Barrier,
    tx: watch::Sender<Option<BarrierResult>>,
}

struct ConsensusSlot {
    group: ConsensusGroup,
    tx: watch::Sender<Option<ConsensusResult>>,
}

#[derive(Default)]
struct SyncState {
    barriers: HashMap<String, BarrierSlot>,
    consensus: HashMap<String, ConsensusSlot>,
    history: VecDeque<CoordinationEvent>,
    stats: CoordinationStats,
}

impl SyncState {
    fn record(&mut self, primitive: &str, id: &str, event: impl Into<String>) {
        self.history.push_back(CoordinationEvent {
            at: Utc::now(),
            primitive: primitive.to_string(),
            id: id.to_string(),
            event: event.into(),
        });
    }

    fn count_barrier(&mut self, status: SyncStatus) {
        match status {
            SyncStatus::Completed => self.stats.barriers_completed += 1,
            SyncStatus::TimedOut => self.stats.barriers_timed_out += 1,
            SyncStatus::Cancelled => {}
        }
    }

    fn count_consensus(&mut self, decision: ConsensusDecision) {
        match decision {
            ConsensusDecision::Approved => self.stats.consensus_approved += 1,
            ConsensusDecision::Rejected => self.stats.consensus_rejected += 1,
            ConsensusDecision::TimedOut => self.stats.consensus_timed_out += 1,
        }
    }
}

/// Synchronization primitives agents use to rendezvous.
///
/// All barrier and consensus state sits behind one lock that is never held
/// across an await point. Finished results are published through a `watch`
/// channel per primitive (for waiters) and fanned out to every participant on
/// the broadcast notice channel.
pub struct CoordinationBus {
    state: Mutex<SyncState>,
    notices: broadcast::Sender<CoordinationNotice>,
    barrier_timeout: Duration,
    consensus_timeout: Duration,
    retention: Duration,
}

fn deadline_after(timeout: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Utc::now()
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn remaining_until(deadline: DateTime<Utc>) -> Duration {
    deadline
        .signed_duration_since(Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

impl CoordinationBus {
    pub fn new(barrier_timeout: Duration, consensus_timeout: Duration, retention: Duration) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            state: Mutex::new(SyncState::default()),
            notices,
            barrier_timeout,
            consensus_timeout,
            retention,
        }
    }

    pub fn from_config(config: &OrchestrationConfig) -> Self {
        Self::new(
            config.barrier_timeout(),
            config.consensus_timeout(),
            config.retention_window(),
        )
    }

    /// Receive every notice published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn publish(&self, notice: CoordinationNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn fan_out_barrier(&self, participants: &[String], result: &BarrierResult) {
        for participant in participants {
            self.publish(CoordinationNotice::BarrierReleased {
                recipient: participant.clone(),
                result: result.clone(),
            });
        }
    }

    fn fan_out_consensus(&self, participants: &[String], result: &ConsensusResult) {
        for participant in participants {
            self.publish(CoordinationNotice::ConsensusFinalized {
                recipient: participant.clone(),
                result: result.clone(),
            });
        }
    }

    // --- Barriers ---

    /// Create a barrier. `timeout` falls back to the configured default.
    pub fn create_barrier(
        &self,
        id: impl Into<String>,
        participants: Vec<String>,
        timeout: Option<Duration>,
    ) -> AgentflowResult<()> {
        let id = id.into();
        let deadline = deadline_after(timeout.unwrap_or(self.barrier_timeout));
        let barrier = Barrier::new(id.clone(), participants, Some(deadline))?;
        let mut state = self.state.lock();
        if state
            .barriers
            .get(&id)
            .is_some_and(|slot| !slot.barrier.is_complete())
        {
            return Err(AgentflowError::Validation(format!(
                "barrier '{id}' already exists"
            )));
        }
        let participants = barrier.participants.len();
        let (tx, _) = watch::channel(None);
        state.barriers.insert(id.clone(), BarrierSlot { barrier, tx });
        state.record("barrier", &id, format!("created for {participants} participants"));
        info!(barrier_id = %id, participants, deadline = %deadline, "Barrier created");
        Ok(())
    }

    /// Record an arrival. Completes and fans out the barrier on the last one.
    pub fn arrive(&self, id: &str, participant: &str) -> AgentflowResult<ArriveOutcome> {
        let now = Utc::now();
        let (outcome, fan_out) = {
            let mut state = self.state.lock();
            let expired = state
                .barriers
                .get(id)
                .map(|slot| slot.barrier.is_expired(now))
                .ok_or_else(|| AgentflowError::NotFound(format!("barrier '{id}'")))?;
            if expired {
                drop(state);
                self.expire_barrier(id)?;
                return Err(AgentflowError::SynchronizationTimeout { id: id.to_string() });
            }
            let slot = state
                .barriers
                .get_mut(id)
                .ok_or_else(|| AgentflowError::NotFound(format!("barrier '{id}'")))?;
            let outcome = slot.barrier.arrive(participant, now)?;
            let mut fan_out = None;
            if let ArriveOutcome::Released(result) = &outcome {
                slot.tx.send_replace(Some(result.clone()));
                let participants: Vec<String> = slot.barrier.participants.iter().cloned().collect();
                fan_out = Some((participants, result.clone()));
                state.count_barrier(SyncStatus::Completed);
                state.record("barrier", id, "released");
            }
            (outcome, fan_out)
        };
        match &outcome {
            ArriveOutcome::Waiting { remaining } => {
                debug!(barrier_id = %id, participant, remaining, "Barrier arrival");
            }
            ArriveOutcome::Released(_) => {
                info!(barrier_id = %id, participant, "Barrier released");
            }
            ArriveOutcome::AlreadyComplete => {
                debug!(barrier_id = %id, participant, "Arrival after completion ignored");
            }
        }
        if let Some((participants, result)) = fan_out {
            self.fan_out_barrier(&participants, &result);
        }
        Ok(outcome)
    }

    /// Wait until the barrier finishes. A timeout is reported through the
    /// result's status, not as an error.
    pub async fn wait_barrier(&self, id: &str) -> AgentflowResult<BarrierResult> {
        let (mut rx, deadline) = {
            let state = self.state.lock();
            let slot = state
                .barriers
                .get(id)
                .ok_or_else(|| AgentflowError::NotFound(format!("barrier '{id}'")))?;
            (slot.tx.subscribe(), slot.barrier.deadline)
        };

        let finished = match deadline {
            Some(deadline) => {
                match tokio::time::timeout(remaining_until(deadline), rx.wait_for(Option::is_some))
                    .await
                {
                    Ok(Ok(value)) => (*value).clone(),
                    _ => None,
                }
            }
            None => match rx.wait_for(Option::is_some).await {
                Ok(value) => (*value).clone(),
                Err(_) => None,
            },
        };
        if let Some(result) = finished.or_else(|| rx.borrow().clone()) {
            return Ok(result);
        }
        match self.expire_barrier(id) {
            Ok(result) => Ok(result),
            // Another waiter expired and removed it first.
            Err(AgentflowError::NotFound(_)) => rx
                .borrow()
                .clone()
                .ok_or_else(|| AgentflowError::NotFound(format!("barrier '{id}'"))),
            Err(e) => Err(e),
        }
    }

    /// Arrive and then wait for the barrier to finish.
    pub async fn arrive_and_wait(&self, id: &str, participant: &str) -> AgentflowResult<BarrierResult> {
        match self.arrive(id, participant)? {
            ArriveOutcome::Released(result) => Ok(result),
            _ => self.wait_barrier(id).await,
        }
    }

    /// Time out a barrier now, notify everyone and discard it.
    pub fn expire_barrier(&self, id: &str) -> AgentflowResult<BarrierResult> {
        self.finish_barrier(id, SyncStatus::TimedOut)
    }

    /// Cancel a barrier, notify everyone and discard it.
    pub fn cancel_barrier(&self, id: &str) -> AgentflowResult<BarrierResult> {
        self.finish_barrier(id, SyncStatus::Cancelled)
    }

    fn finish_barrier(&self, id: &str, status: SyncStatus) -> AgentflowResult<BarrierResult> {
        let now = Utc::now();
        let (result, participants) = {
            let mut state = self.state.lock();
            let mut slot = state
                .barriers
                .remove(id)
                .ok_or_else(|| AgentflowError::NotFound(format!("barrier '{id}'")))?;
            let finished = match status {
                SyncStatus::TimedOut => slot.barrier.expire(now),
                _ => slot.barrier.cancel(now),
            };
            let Some(result) = finished else {
                // Already finished earlier; put it back for cleanup and report the original result.
                let existing = slot.barrier.result.clone();
                state.barriers.insert(id.to_string(), slot);
                return existing.ok_or_else(|| AgentflowError::NotFound(format!("barrier '{id}'")));
            };
            slot.tx.send_replace(Some(result.clone()));
            state.count_barrier(status);
            let event = match status {
                SyncStatus::TimedOut => "timed_out",
                _ => "cancelled",
            };
            state.record("barrier", id, event);
            let participants: Vec<String> = slot.barrier.participants.iter().cloned().collect();
            (result, participants)
        };
        warn!(
            barrier_id = %id,
            status = ?status,
            missing = ?result.missing,
            "Barrier finished without all participants"
        );
        self.fan_out_barrier(&participants, &result);
        Ok(result)
    }

    /// Snapshot of a barrier, if it is still held by the bus.
    pub fn barrier(&self, id: &str) -> Option<Barrier> {
        self.state.lock().barriers.get(id).map(|slot| slot.barrier.clone())
    }

    // --- Consensus ---

    /// Open a consensus group. `required_yes` defaults to a majority and
    /// `timeout` to the configured default.
    pub fn start_consensus(
        &self,
        id: impl Into<String>,
        participants: Vec<String>,
        proposal: serde_json::Value,
        required_yes: Option<usize>,
        timeout: Option<Duration>,
    ) -> AgentflowResult<()> {
        let id = id.into();
        let deadline = deadline_after(timeout.unwrap_or(self.consensus_timeout));
        let group = ConsensusGroup::new(id.clone(), participants, proposal, required_yes, deadline)?;
        let mut state = self.state.lock();
        if state
            .consensus
            .get(&id)
            .is_some_and(|slot| !slot.group.is_finalized())
        {
            return Err(AgentflowError::Validation(format!(
                "consensus '{id}' already exists"
            )));
        }
        let required = group.required_yes;
        let participants = group.participants.len();
        let (tx, _) = watch::channel(None);
        state.consensus.insert(id.clone(), ConsensusSlot { group, tx });
        state.record(
            "consensus",
            &id,
            format!("started, {required}/{participants} yes votes required"),
        );
        info!(consensus_id = %id, participants, required, "Consensus started");
        Ok(())
    }

    /// Record a vote. Later votes from the same participant replace earlier
    /// ones until the group finalizes; afterwards votes are ignored.
    pub fn vote(&self, id: &str, participant: &str, approve: bool) -> AgentflowResult<VoteOutcome> {
        let now = Utc::now();
        let (outcome, fan_out) = {
            let mut state = self.state.lock();
            let expired = state
                .consensus
                .get(id)
                .map(|slot| slot.group.is_expired(now))
                .ok_or_else(|| AgentflowError::NotFound(format!("consensus '{id}'")))?;
            if expired {
                drop(state);
                self.expire_consensus(id)?;
                return Err(AgentflowError::SynchronizationTimeout { id: id.to_string() });
            }
            let slot = state
                .consensus
                .get_mut(id)
                .ok_or_else(|| AgentflowError::NotFound(format!("consensus '{id}'")))?;
            let outcome = slot.group.vote(participant, approve, now)?;
            let mut fan_out = None;
            if let VoteOutcome::Finalized(result) = &outcome {
                slot.tx.send_replace(Some(result.clone()));
                let participants: Vec<String> = slot.group.participants.iter().cloned().collect();
                fan_out = Some((participants, result.clone()));
                state.count_consensus(result.decision);
                state.record(
                    "consensus",
                    id,
                    format!("{:?}", result.decision).to_lowercase(),
                );
            }
            (outcome, fan_out)
        };
        match &outcome {
            VoteOutcome::Finalized(result) => info!(
                consensus_id = %id,
                decision = ?result.decision,
                yes = result.yes_votes,
                no = result.no_votes,
                "Consensus finalized"
            ),
            VoteOutcome::Ignored => {
                debug!(consensus_id = %id, participant, "Vote after finalization ignored");
            }
            VoteOutcome::Pending { .. } => debug!(consensus_id = %id, participant, approve, "Vote recorded"),
        }
        if let Some((participants, result)) = fan_out {
            self.fan_out_consensus(&participants, &result);
        }
        Ok(outcome)
    }

    /// Wait until the group finalizes or its deadline passes.
    pub async fn wait_consensus(&self, id: &str) -> AgentflowResult<ConsensusResult> {
        let (mut rx, deadline) = {
            let state = self.state.lock();
            let slot = state
                .consensus
                .get(id)
                .ok_or_else(|| AgentflowError::NotFound(format!("consensus '{id}'")))?;
            (slot.tx.subscribe(), slot.group.deadline)
        };
        let finished =
            match tokio::time::timeout(remaining_until(deadline), rx.wait_for(Option::is_some)).await {
                Ok(Ok(value)) => (*value).clone(),
                _ => None,
            };
        if let Some(result) = finished.or_else(|| rx.borrow().clone()) {
            return Ok(result);
        }
        match self.expire_consensus(id) {
            Ok(result) => Ok(result),
            Err(AgentflowError::NotFound(_)) => rx
                .borrow()
                .clone()
                .ok_or_else(|| AgentflowError::NotFound(format!("consensus '{id}'"))),
            Err(e) => Err(e),
        }
    }

    /// Time out a consensus group now, notify everyone and discard it.
    pub fn expire_consensus(&self, id: &str) -> AgentflowResult<ConsensusResult> {
        let now = Utc::now();
        let (result, participants) = {
            let mut state = self.state.lock();
            let mut slot = state
                .consensus
                .remove(id)
                .ok_or_else(|| AgentflowError::NotFound(format!("consensus '{id}'")))?;
            let Some(result) = slot.group.expire(now) else {
                let existing = slot.group.result.clone();
                state.consensus.insert(id.to_string(), slot);
                return existing.ok_or_else(|| AgentflowError::NotFound(format!("consensus '{id}'")));
            };
            slot.tx.send_replace(Some(result.clone()));
            state.count_consensus(ConsensusDecision::TimedOut);
            state.record("consensus", id, "timed_out");
            let participants: Vec<String> = slot.group.participants.iter().cloned().collect();
            (result, participants)
        };
        warn!(
            consensus_id = %id,
            yes = result.yes_votes,
            required = result.required_yes,
            "Consensus timed out"
        );
        self.fan_out_consensus(&participants, &result);
        Ok(result)
    }

    /// Snapshot of a consensus group, if it is still held by the bus.
    pub fn consensus(&self, id: &str) -> Option<ConsensusGroup> {
        self.state.lock().consensus.get(id).map(|slot| slot.group.clone())
    }

    // --- Housekeeping ---

    /// Expire overdue primitives, drop finished ones older than the retention
    /// window and trim the history to the same window.
    pub fn cleanup(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();
        let (expired_barriers, expired_consensus) = {
            let mut state = self.state.lock();
            let barriers: Vec<String> = state
                .barriers
                .iter()
                .filter(|(_, slot)| slot.barrier.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect();
            let consensus: Vec<String> = state
                .consensus
                .iter()
                .filter(|(_, slot)| slot.group.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect();

            let cutoff = chrono::Duration::from_std(self.retention)
                .ok()
                .and_then(|window| now.checked_sub_signed(window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            let before = state.barriers.len() + state.consensus.len();
            state.barriers.retain(|_, slot| {
                !matches!(&slot.barrier.result, Some(result) if result.finished_at < cutoff)
            });
            state.consensus.retain(|_, slot| {
                !matches!(&slot.group.result, Some(result) if result.finalized_at < cutoff)
            });
            report.removed_finished = before - state.barriers.len() - state.consensus.len();

            let before = state.history.len();
            while state.history.front().is_some_and(|e| e.at < cutoff) {
                state.history.pop_front();
            }
            report.trimmed_events = before - state.history.len();
            (barriers, consensus)
        };

        for id in expired_barriers {
            warn!(barrier_id = %id, "Removing expired barrier");
            if self.expire_barrier(&id).is_ok() {
                report.expired_barriers.push(id);
            }
        }
        for id in expired_consensus {
            warn!(consensus_id = %id, "Removing expired consensus group");
            if self.expire_consensus(&id).is_ok() {
                report.expired_consensus.push(id);
            }
        }
        report
    }

    pub fn stats(&self) -> CoordinationStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.open_barriers = state
            .barriers
            .values()
            .filter(|slot| !slot.barrier.is_complete())
            .count();
        stats.open_consensus = state
            .consensus
            .values()
            .filter(|slot| !slot.group.is_finalized())
            .count();
        stats.finished_awaiting_cleanup = state.barriers.len() + state.consensus.len()
            - stats.open_barriers
            - stats.open_consensus;
        stats.history_len = state.history.len();
        stats
    }

    /// Spawn the periodic cleanup sweep.
    pub fn spawn_cleanup(self: Arc<Self>, period: Duration, shutdown: &Shutdown) -> JoinHandle<()> {
        shutdown.spawn_periodic("coordination-cleanup", period, move || {
            let bus = self.clone();
            async move {
                let report = bus.cleanup(Utc::now());
                if report.removed_finished > 0 || report.trimmed_events > 0 {
                    debug!(
                        removed = report.removed_finished,
                        trimmed = report.trimmed_events,
                        "Coordination cleanup"
                    );
                }
            }
        })
    }

    /// Timestamped barrier/consensus history within the retention window.
    pub fn history(&self) -> Vec<CoordinationEvent> {
        self.state.lock().history.iter().cloned().collect()
    }
}

impl Default for CoordinationBus {
    fn default() -> Self {
        Self::from_config(&OrchestrationConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn bus() -> CoordinationBus {
        CoordinationBus::new(
            Duration::from_secs(30),
            Duration::from_secs(30),
            Duration::from_secs(3600),
        )
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_barrier_fans_out_to_every_participant() {
        let bus = bus();
        let mut rx = bus.subscribe();
        bus.create_barrier("sync", names(&["a", "b"]), None).unwrap();
        bus.arrive("sync", "a").unwrap();
        assert!(matches!(
            bus.arrive("sync", "b").unwrap(),
            ArriveOutcome::Released(_)
        ));

        let mut recipients = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                CoordinationNotice::BarrierReleased { recipient, result } => {
                    assert!(result.is_success());
                    recipients.push(recipient);
                }
                other => panic!("unexpected notice {other:?}"),
            }
        }
        recipients.sort();
        assert_eq!(recipients, names(&["a", "b"]));
        assert_eq!(bus.stats().barriers_completed, 1);
    }

    #[tokio::test]
    async fn test_waiter_released_by_last_arrival() {
        let bus = Arc::new(bus());
        bus.create_barrier("sync", names(&["a", "b"]), None).unwrap();
        bus.arrive("sync", "a").unwrap();

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.wait_barrier("sync").await })
        };
        tokio::task::yield_now().await;
        bus.arrive("sync", "b").unwrap();
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_open_barrier_rejected() {
        let bus = bus();
        bus.create_barrier("dup", names(&["a"]), None).unwrap();
        assert!(bus.create_barrier("dup", names(&["a"]), None).is_err());
    }

    #[tokio::test]
    async fn test_unknown_barrier() {
        let bus = bus();
        assert!(matches!(
            bus.arrive("nope", "a"),
            Err(AgentflowError::NotFound(_))
        ));
        assert!(bus.wait_barrier("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_barrier_is_final() {
        let bus = bus();
        bus.create_barrier("c", names(&["a", "b"]), None).unwrap();
        let result = bus.cancel_barrier("c").unwrap();
        assert_eq!(result.status, SyncStatus::Cancelled);
        assert!(result.into_result().is_err());
        assert!(bus.barrier("c").is_none());
    }

    #[tokio::test]
    async fn test_consensus_votes_and_late_votes() {
        let bus = bus();
        bus.start_consensus("merge", names(&["x", "y", "z"]), serde_json::json!("merge"), Some(2), None)
            .unwrap();
        bus.vote("merge", "x", true).unwrap();
        bus.vote("merge", "y", false).unwrap();
        assert!(matches!(
            bus.vote("merge", "z", true).unwrap(),
            VoteOutcome::Finalized(_)
        ));
        assert_eq!(bus.vote("merge", "y", true).unwrap(), VoteOutcome::Ignored);
        let result = bus.wait_consensus("merge").await.unwrap();
        assert!(result.is_approved());
        assert_eq!(result.votes.get("y"), Some(&false));
    }

    #[tokio::test]
    async fn test_cleanup_removes_finished_and_expired() {
        let bus = bus();
        bus.create_barrier("done", names(&["a"]), None).unwrap();
        bus.arrive("done", "a").unwrap();
        bus.create_barrier("stale", names(&["a", "b"]), Some(Duration::ZERO))
            .unwrap();
        bus.start_consensus("old", names(&["a"]), serde_json::Value::Null, None, Some(Duration::ZERO))
            .unwrap();

        let report = bus.cleanup(Utc::now());
        assert_eq!(report.removed_finished, 0);
        assert_eq!(report.expired_barriers, names(&["stale"]));
        assert_eq!(report.expired_consensus, names(&["old"]));
        let stats = bus.stats();
        assert_eq!(stats.open_barriers, 0);
        assert_eq!(stats.open_consensus, 0);
        assert_eq!(stats.finished_awaiting_cleanup, 1);
        assert_eq!(stats.barriers_timed_out, 1);
        assert_eq!(stats.consensus_timed_out, 1);

        let report = bus.cleanup(Utc::now() + chrono::Duration::hours(2));
        assert_eq!(report.removed_finished, 1);
        assert!(bus.barrier("done").is_none());
        assert_eq!(bus.stats().finished_awaiting_cleanup, 0);
    }

    #[tokio::test]
    async fn test_finished_primitives_readable_within_retention() {
        let bus = CoordinationBus::new(
            Duration::from_secs(30),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        bus.create_barrier("done", names(&["a"]), None).unwrap();
        bus.arrive("done", "a").unwrap();
        bus.start_consensus("ship", names(&["a"]), serde_json::json!("ship"), None, None)
            .unwrap();
        bus.vote("ship", "a", true).unwrap();

        let report = bus.cleanup(Utc::now() + chrono::Duration::seconds(30));
        assert_eq!(report.removed_finished, 0);
        assert!(bus.barrier("done").unwrap().is_complete());
        assert!(bus.consensus("ship").unwrap().result.unwrap().is_approved());

        let report = bus.cleanup(Utc::now() + chrono::Duration::seconds(120));
        assert_eq!(report.removed_finished, 2);
        assert!(bus.barrier("done").is_none());
        assert!(bus.consensus("ship").is_none());
    }

    #[tokio::test]
    async fn test_history_trimmed_to_retention() {
        let bus = CoordinationBus::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        bus.create_barrier("b", names(&["a", "b"]), None).unwrap();
        assert_eq!(bus.history().len(), 1);
        let report = bus.cleanup(Utc::now() + chrono::Duration::seconds(120));
        assert_eq!(report.trimmed_events, 1);
        assert!(report.expired_barriers.is_empty());
        assert!(bus.history().is_empty());
        assert!(bus.barrier("b").is_some());
    }
}

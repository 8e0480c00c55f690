//! Barrier, consensus and election behaviour through the public bus API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use agentflow_coordination::*;
use agentflow_core::AgentflowError;
use std::sync::Arc;
use std::time::Duration;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn bus() -> Arc<CoordinationBus> {
    Arc::new(CoordinationBus::new(
        Duration::from_secs(30),
        Duration::from_secs(30),
        Duration::from_secs(3600),
    ))
}

// ---------------------------------------------------------------------------
// Barrier with missing participant times out for every waiter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn barrier_timeout_fails_all_waiters_and_removes_barrier() {
    let bus = bus();
    let mut notices = bus.subscribe();
    bus.create_barrier("stage-2", names(&["x", "y", "z"]), Some(Duration::from_millis(300)))
        .unwrap();

    let mut waiters = Vec::new();
    for participant in ["x", "y"] {
        let bus = bus.clone();
        waiters.push(tokio::spawn(async move {
            bus.arrive_and_wait("stage-2", participant).await
        }));
    }

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.status, SyncStatus::TimedOut);
        assert_eq!(result.missing, names(&["z"]));
        assert!(matches!(
            result.into_result(),
            Err(AgentflowError::SynchronizationTimeout { .. })
        ));
    }

    assert!(bus.barrier("stage-2").is_none());
    assert!(matches!(
        bus.arrive("stage-2", "z"),
        Err(AgentflowError::NotFound(_))
    ));

    let mut recipients = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let CoordinationNotice::BarrierReleased { recipient, result } = notice {
            assert_eq!(result.status, SyncStatus::TimedOut);
            recipients.push(recipient);
        }
    }
    recipients.sort();
    assert_eq!(recipients, names(&["x", "y", "z"]));
    assert_eq!(bus.stats().barriers_timed_out, 1);
}

#[tokio::test]
async fn barrier_releases_all_waiters_together() {
    let bus = bus();
    bus.create_barrier("sync", names(&["a", "b", "c"]), None).unwrap();

    let mut waiters = Vec::new();
    for participant in ["a", "b", "c"] {
        let bus = bus.clone();
        waiters.push(tokio::spawn(async move {
            bus.arrive_and_wait("sync", participant).await
        }));
    }
    for waiter in waiters {
        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_success());
        assert_eq!(result.arrived, names(&["a", "b", "c"]));
    }
}

#[tokio::test]
async fn repeated_arrival_matches_single_arrival() {
    let bus = bus();
    bus.create_barrier("once", names(&["a", "b"]), None).unwrap();
    bus.create_barrier("many", names(&["a", "b"]), None).unwrap();

    bus.arrive("once", "a").unwrap();
    for _ in 0..5 {
        assert_eq!(
            bus.arrive("many", "a").unwrap(),
            ArriveOutcome::Waiting { remaining: 1 }
        );
    }
    let once = bus.barrier("once").unwrap();
    let many = bus.barrier("many").unwrap();
    assert_eq!(once.arrived, many.arrived);
    assert!(!many.is_complete());
}

// ---------------------------------------------------------------------------
// Consensus finalizes on the exact threshold vote
// ---------------------------------------------------------------------------

#[tokio::test]
async fn consensus_approves_exactly_on_third_vote() {
    let bus = bus();
    let mut notices = bus.subscribe();
    bus.start_consensus(
        "release",
        names(&["x", "y", "z"]),
        serde_json::json!({"version": "1.2.0"}),
        Some(2),
        None,
    )
    .unwrap();

    assert!(matches!(
        bus.vote("release", "x", true).unwrap(),
        VoteOutcome::Pending { .. }
    ));
    assert!(matches!(
        bus.vote("release", "y", false).unwrap(),
        VoteOutcome::Pending { .. }
    ));
    assert!(bus.consensus("release").unwrap().result.is_none());

    let result = match bus.vote("release", "z", true).unwrap() {
        VoteOutcome::Finalized(result) => result,
        other => panic!("expected finalization on z's vote, got {other:?}"),
    };
    assert_eq!(result.decision, ConsensusDecision::Approved);
    assert_eq!(result.yes_votes, 2);

    // Later votes change nothing.
    assert_eq!(bus.vote("release", "y", true).unwrap(), VoteOutcome::Ignored);
    let stored = bus.consensus("release").unwrap().result.unwrap();
    assert_eq!(stored, result);

    let mut recipients = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let CoordinationNotice::ConsensusFinalized { recipient, result } = notice {
            assert!(result.is_approved());
            recipients.push(recipient);
        }
    }
    recipients.sort();
    assert_eq!(recipients, names(&["x", "y", "z"]));
}

#[tokio::test]
async fn consensus_timeout_reported_through_status() {
    let bus = bus();
    bus.start_consensus(
        "slow",
        names(&["x", "y", "z"]),
        serde_json::Value::Null,
        None,
        Some(Duration::from_millis(50)),
    )
    .unwrap();
    bus.vote("slow", "x", true).unwrap();

    let result = bus.wait_consensus("slow").await.unwrap();
    assert_eq!(result.decision, ConsensusDecision::TimedOut);
    assert!(bus.consensus("slow").is_none());
}

#[tokio::test]
async fn vote_by_non_participant_is_rejected() {
    let bus = bus();
    bus.start_consensus("c", names(&["x"]), serde_json::Value::Null, None, None)
        .unwrap();
    assert!(matches!(
        bus.vote("c", "mallory", true),
        Err(AgentflowError::Validation(_))
    ));
}

// ---------------------------------------------------------------------------
// Leader election
// ---------------------------------------------------------------------------

#[tokio::test]
async fn election_announces_leader() {
    let bus = bus();
    let mut notices = bus.subscribe();
    let election = LeaderElection::new(bus.clone());
    election
        .start("coordinator", names(&["a", "b", "c"]), names(&["b", "a"]), None)
        .unwrap();
    bus.vote("coordinator", "a", true).unwrap();
    bus.vote("coordinator", "c", true).unwrap();

    let leader = election.resolve("coordinator").await.unwrap();
    assert_eq!(leader.as_deref(), Some("b"));

    let mut announced = None;
    while let Ok(notice) = notices.try_recv() {
        if let CoordinationNotice::LeaderElected { leader, .. } = notice {
            announced = Some(leader);
        }
    }
    assert_eq!(announced.as_deref(), Some("b"));
}

use crate::admission::LedgerSnapshot;
use crate::scheduler::{Scheduler, SchedulerStats};
use agentflow_coordination::{CoordinationBus, CoordinationStats};
use agentflow_core::AgentStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One agent's load and rolling statistics at sampling time.
#[derive(Debug, Clone, Serialize)]
pub struct AgentLoad {
    pub name: String,
    pub kind: String,
    pub alive: bool,
    pub active: usize,
    pub max_concurrent: usize,
    pub stats: AgentStats,
}

/// Point-in-time view over scheduler, ledger and coordination state.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub scheduler: SchedulerStats,
    pub agents: Vec<AgentLoad>,
    pub resources: LedgerSnapshot,
    pub coordination: CoordinationStats,
}

impl MetricsSnapshot {
    pub fn tasks_in(&self, status: &str) -> usize {
        self.scheduler.tasks_by_status.get(status).copied().unwrap_or(0)
    }

    pub fn workflows_in(&self, status: &str) -> usize {
        self.scheduler
            .workflows_by_status
            .get(status)
            .copied()
            .unwrap_or(0)
    }
}

/// Read-only aggregator sampled by the metrics loop.
pub struct MetricsCollector {
    scheduler: Scheduler,
    bus: Arc<CoordinationBus>,
    history: RwLock<VecDeque<MetricsSnapshot>>,
    capacity: usize,
}

impl MetricsCollector {
    /// `capacity` bounds the retained sample history (at least one sample).
    pub fn new(scheduler: Scheduler, bus: Arc<CoordinationBus>, capacity: usize) -> Self {
        Self {
            scheduler,
            bus,
            history: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Build a snapshot without recording it.
    ///
    /// Each source is read under its own lock in turn, so counts from
    /// different sources may be a few microseconds apart.
    pub async fn collect(&self) -> MetricsSnapshot {
        let scheduler = self.scheduler.stats().await;
        let agents = self
            .scheduler
            .registry()
            .list()
            .into_iter()
            .map(|a| AgentLoad {
                active: scheduler.active_by_agent.get(&a.name).copied().unwrap_or(0),
                name: a.name,
                kind: a.kind,
                alive: a.alive,
                max_concurrent: a.max_concurrent,
                stats: a.stats,
            })
            .collect();
        MetricsSnapshot {
            sampled_at: Utc::now(),
            agents,
            resources: self.scheduler.planner().ledger().snapshot(),
            coordination: self.bus.stats(),
            scheduler,
        }
    }

    /// Collect a snapshot and append it to the bounded history.
    pub async fn record(&self) -> MetricsSnapshot {
        let snapshot = self.collect().await;
        let mut history = self.history.write().await;
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    pub async fn latest(&self) -> Option<MetricsSnapshot> {
        self.history.read().await.back().cloned()
    }

    /// Recorded samples, oldest first.
    pub async fn history(&self) -> Vec<MetricsSnapshot> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Per-agent success rates from the most recent sample.
    pub async fn success_rates(&self) -> BTreeMap<String, f64> {
        self.latest()
            .await
            .map(|s| {
                s.agents
                    .into_iter()
                    .map(|a| (a.name, a.stats.success_rate))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serialize a fresh snapshot plus the sample count as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let snapshot = self.collect().await;
        let samples = self.history.read().await.len();
        serde_json::json!({
            "snapshot": snapshot,
            "samples": samples,
        })
    }
}

use crate::error::{AgentflowError, AgentflowResult};
use crate::resources::ResourceVector;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Missed-heartbeat multiplier after which an agent is declared dead.
pub const LIVENESS_MULTIPLIER: u32 = 3;

/// Rolling execution statistics for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub average_duration_ms: f64,
    pub success_rate: f64,
}

impl AgentStats {
    fn record(&mut self, success: bool, duration: Duration) {
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        let finished = self.succeeded + self.failed;
        let sample = duration.as_secs_f64() * 1000.0;
        self.average_duration_ms += (sample - self.average_duration_ms) / finished as f64;
        self.success_rate = self.succeeded as f64 / finished as f64;
    }
}

/// An agent the scheduler may dispatch to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    /// Agent type, used to look up duration estimates.
    pub kind: String,
    pub max_concurrent: usize,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: ResourceVector,
    /// Expected heartbeat period; `None` uses the engine default.
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
    pub last_heartbeat: DateTime<Utc>,
    pub alive: bool,
    #[serde(default)]
    pub stats: AgentStats,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            max_concurrent,
            capabilities: Vec::new(),
            resources: ResourceVector::zero(),
            heartbeat_interval_secs: None,
            last_heartbeat: Utc::now(),
            alive: true,
            stats: AgentStats::default(),
        }
    }

    pub fn with_resources(mut self, resources: ResourceVector) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_heartbeat_interval(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = Some(secs);
        self
    }

    /// True once `now` is past `LIVENESS_MULTIPLIER` intervals since the last heartbeat.
    /// An interval too large to multiply never expires.
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, default_interval: Duration) -> bool {
        let interval = self
            .heartbeat_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(default_interval);
        let Some(grace) = interval.checked_mul(LIVENESS_MULTIPLIER) else {
            return false;
        };
        match now.signed_duration_since(self.last_heartbeat).to_std() {
            Ok(elapsed) => elapsed > grace,
            // heartbeat stamped in the future
            Err(_) => false,
        }
    }
}

/// In-memory registry of agents, injected wherever lookups are needed.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace an agent.
    pub fn register(&self, record: AgentRecord) -> AgentflowResult<()> {
        if record.name.trim().is_empty() {
            return Err(AgentflowError::Validation("agent name must not be empty".into()));
        }
        if record.max_concurrent == 0 {
            return Err(AgentflowError::Validation(format!(
                "agent '{}' must allow at least one concurrent task",
                record.name
            )));
        }
        self.agents.write().insert(record.name.clone(), record);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<AgentRecord> {
        self.agents.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<AgentRecord> {
        self.agents.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.read().contains_key(name)
    }

    pub fn is_alive(&self, name: &str) -> bool {
        self.agents.read().get(name).is_some_and(|a| a.alive)
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Record a heartbeat. Returns `true` if the agent was dead and is now revived.
    pub fn heartbeat(&self, name: &str, at: DateTime<Utc>) -> AgentflowResult<bool> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(name)
            .ok_or_else(|| AgentflowError::NotFound(format!("agent '{name}'")))?;
        agent.last_heartbeat = at;
        let revived = !agent.alive;
        agent.alive = true;
        Ok(revived)
    }

    /// Mark every agent whose heartbeat expired as not alive.
    /// Returns the names that flipped from alive to dead during this sweep.
    pub fn sweep_liveness(&self, now: DateTime<Utc>, default_interval: Duration) -> Vec<String> {
        let mut agents = self.agents.write();
        let mut died: Vec<String> = agents
            .values_mut()
            .filter(|a| a.alive && a.heartbeat_expired(now, default_interval))
            .map(|a| {
                a.alive = false;
                a.name.clone()
            })
            .collect();
        died.sort();
        died
    }

    pub fn record_dispatch(&self, name: &str) {
        if let Some(agent) = self.agents.write().get_mut(name) {
            agent.stats.dispatched += 1;
        }
    }

    /// Fold one finished attempt into the agent's rolling statistics.
    pub fn record_outcome(&self, name: &str, success: bool, duration: Duration) {
        if let Some(agent) = self.agents.write().get_mut(name) {
            agent.stats.record(success, duration);
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = AgentRegistry::new();
        registry
            .register(AgentRecord::new("coder-1", "coder", 2))
            .unwrap();
        assert!(registry.contains("coder-1"));
        assert!(registry.is_alive("coder-1"));
        assert_eq!(registry.get("coder-1").unwrap().max_concurrent, 2);
        assert!(registry.get("nobody").is_none());
    }

    #[test]
    fn test_register_rejects_zero_capacity() {
        let registry = AgentRegistry::new();
        let err = registry
            .register(AgentRecord::new("broken", "coder", 0))
            .unwrap_err();
        assert!(matches!(err, AgentflowError::Validation(_)));
    }

    #[test]
    fn test_liveness_sweep_uses_three_intervals() {
        let registry = AgentRegistry::new();
        let start = Utc::now();
        let mut record = AgentRecord::new("tester", "tester", 1).with_heartbeat_interval(10);
        record.last_heartbeat = start;
        registry.register(record).unwrap();

        let default = Duration::from_secs(30);
        assert!(registry
            .sweep_liveness(start + chrono::Duration::seconds(30), default)
            .is_empty());
        let died = registry.sweep_liveness(start + chrono::Duration::seconds(31), default);
        assert_eq!(died, vec!["tester".to_string()]);
        assert!(!registry.is_alive("tester"));

        // A second sweep reports nothing new.
        assert!(registry
            .sweep_liveness(start + chrono::Duration::seconds(60), default)
            .is_empty());

        assert!(registry.heartbeat("tester", Utc::now()).unwrap());
        assert!(registry.is_alive("tester"));
    }

    #[test]
    fn test_huge_heartbeat_interval_never_expires() {
        let registry = AgentRegistry::new();
        let mut record =
            AgentRecord::new("sleepy", "research", 1).with_heartbeat_interval(u64::MAX / 2);
        record.last_heartbeat = Utc::now() - chrono::Duration::days(365);
        registry.register(record).unwrap();

        let died = registry.sweep_liveness(Utc::now(), Duration::from_secs(30));
        assert!(died.is_empty());
        assert!(registry.is_alive("sleepy"));

        let record = AgentRecord::new("default", "research", 1);
        assert!(!record.heartbeat_expired(Utc::now(), Duration::MAX));
    }

    #[test]
    fn test_heartbeat_unknown_agent() {
        let registry = AgentRegistry::new();
        assert!(registry.heartbeat("ghost", Utc::now()).is_err());
    }

    #[test]
    fn test_rolling_stats() {
        let registry = AgentRegistry::new();
        registry.register(AgentRecord::new("a", "coder", 1)).unwrap();
        registry.record_dispatch("a");
        registry.record_outcome("a", true, Duration::from_millis(100));
        registry.record_outcome("a", false, Duration::from_millis(300));
        let stats = registry.get("a").unwrap().stats;
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert!((stats.average_duration_ms - 200.0).abs() < 1e-6);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
    }
}

use crate::bus::CoordinationBus;
use crate::types::CoordinationNotice;
use agentflow_core::{AgentRegistry, AgentflowResult, Shutdown, LIVENESS_MULTIPLIER};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tracks agent liveness from heartbeats and publishes probes.
pub struct HeartbeatMonitor {
    registry: Arc<AgentRegistry>,
    bus: Arc<CoordinationBus>,
    default_interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<AgentRegistry>, bus: Arc<CoordinationBus>, default_interval: Duration) -> Self {
        Self {
            registry,
            bus,
            default_interval,
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Record a heartbeat from `agent`.
    pub fn beat(&self, agent: &str) -> AgentflowResult<()> {
        if self.registry.heartbeat(agent, Utc::now())? {
            info!(agent, "Agent back online");
        } else {
            debug!(agent, "Heartbeat");
        }
        Ok(())
    }

    /// Mark agents silent for longer than the liveness window as dead.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let died = self.registry.sweep_liveness(now, self.default_interval);
        for agent in &died {
            warn!(
                agent = %agent,
                multiplier = LIVENESS_MULTIPLIER,
                "Agent missed heartbeats, marking not alive"
            );
            self.bus.publish(CoordinationNotice::AgentDown {
                agent: agent.clone(),
            });
        }
        died
    }

    /// Send a probe to every live agent. Returns how many were probed.
    pub fn probe(&self) -> usize {
        let sent_at = Utc::now();
        let mut probed = 0;
        for agent in self.registry.list().into_iter().filter(|a| a.alive) {
            self.bus.publish(CoordinationNotice::HeartbeatProbe {
                agent: agent.name,
                sent_at,
            });
            probed += 1;
        }
        debug!(probed, "Heartbeat probes sent");
        probed
    }

    /// Spawn the liveness sweep and the probe broadcast as two loops.
    pub fn spawn(self: Arc<Self>, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let sweeper = self.clone();
        let sweep = shutdown.spawn_periodic("heartbeat-sweep", self.default_interval, move || {
            let sweeper = sweeper.clone();
            async move {
                sweeper.sweep(Utc::now());
            }
        });
        let prober = self.clone();
        let probe = shutdown.spawn_periodic("heartbeat-probe", self.default_interval, move || {
            let prober = prober.clone();
            async move {
                prober.probe();
            }
        });
        vec![sweep, probe]
    }
}

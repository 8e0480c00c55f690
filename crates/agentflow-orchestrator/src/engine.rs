use crate::admission::Admission;
use crate::executor::AgentExecutor;
use crate::monitor::{MetricsCollector, MetricsSnapshot};
use crate::planner::ExecutionPlanner;
use crate::scheduler::Scheduler;
use crate::types::{Task, Workflow};
use agentflow_coordination::{CoordinationBus, HeartbeatMonitor, LeaderElection};
use agentflow_core::{
    AgentRecord, AgentRegistry, AgentflowError, AgentflowResult, OrchestrationConfig, Shutdown,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ledger utilization at which the resource monitor starts warning.
pub const UTILIZATION_WARNING: f64 = 0.9;

/// Upper bound on retained metrics samples.
const MAX_METRICS_SAMPLES: u128 = 10_000;

/// The workflow engine: every component wired from one config, plus the
/// background loops that drive them.
pub struct Orchestrator {
    config: OrchestrationConfig,
    registry: Arc<AgentRegistry>,
    bus: Arc<CoordinationBus>,
    scheduler: Scheduler,
    metrics: Arc<MetricsCollector>,
    heartbeat: Arc<HeartbeatMonitor>,
    shutdown: Shutdown,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build an engine with an empty agent registry.
    pub fn new(config: OrchestrationConfig, executor: Arc<dyn AgentExecutor>) -> AgentflowResult<Self> {
        Self::with_registry(config, Arc::new(AgentRegistry::new()), executor)
    }

    /// Build an engine over an existing registry.
    pub fn with_registry(
        config: OrchestrationConfig,
        registry: Arc<AgentRegistry>,
        executor: Arc<dyn AgentExecutor>,
    ) -> AgentflowResult<Self> {
        config.validate()?;
        let bus = Arc::new(CoordinationBus::from_config(&config));
        let planner = Arc::new(ExecutionPlanner::new(&config, registry.clone())?);
        let scheduler = Scheduler::new(&config, registry.clone(), planner, executor);
        let samples = (config.retention_window().as_millis() / config.metrics_interval().as_millis().max(1))
            .clamp(1, MAX_METRICS_SAMPLES) as usize;
        let metrics = Arc::new(MetricsCollector::new(scheduler.clone(), bus.clone(), samples));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            bus.clone(),
            config.heartbeat_interval(),
        ));
        info!(
            max_parallel_workflows = config.max_parallel_workflows,
            worker_pool_size = config.worker_pool_size,
            "Orchestrator created"
        );
        Ok(Self {
            config,
            registry,
            bus,
            scheduler,
            metrics,
            heartbeat,
            shutdown: Shutdown::new(),
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<CoordinationBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn heartbeat_monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    /// Leader election backed by this engine's bus.
    pub fn election(&self) -> LeaderElection {
        LeaderElection::new(self.bus.clone())
    }

    /// Whether the background loops are running.
    pub fn is_running(&self) -> bool {
        !self.loops.lock().is_empty()
    }

    /// Spawn the background loops. Fails if they are already running or the
    /// engine was shut down.
    pub fn start(&self) -> AgentflowResult<()> {
        if self.shutdown.is_triggered() {
            return Err(AgentflowError::Cancelled("orchestrator was shut down".into()));
        }
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return Err(AgentflowError::Validation("orchestrator already started".into()));
        }

        let poll = self.config.poll_interval();

        let scheduler = self.scheduler.clone();
        loops.push(self.shutdown.spawn_periodic("dispatch", poll, move || {
            let scheduler = scheduler.clone();
            async move {
                let dispatched = scheduler.tick().await;
                if dispatched > 0 {
                    debug!(dispatched, "Dispatch pass");
                }
            }
        }));

        let scheduler = self.scheduler.clone();
        loops.push(self.shutdown.spawn_periodic("progress", poll, move || {
            let scheduler = scheduler.clone();
            async move {
                scheduler.refresh_progress().await;
            }
        }));

        let scheduler = self.scheduler.clone();
        loops.push(self.shutdown.spawn_periodic(
            "admission",
            self.config.admission_retry_interval(),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    scheduler.admit_waiting().await;
                }
            },
        ));

        let metrics = self.metrics.clone();
        loops.push(self.shutdown.spawn_periodic(
            "metrics",
            self.config.metrics_interval(),
            move || {
                let metrics = metrics.clone();
                async move {
                    metrics.record().await;
                }
            },
        ));

        let scheduler = self.scheduler.clone();
        loops.push(self.shutdown.spawn_periodic(
            "resource-monitor",
            self.config.metrics_interval(),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    let ledger = scheduler.planner().ledger().snapshot();
                    if ledger.utilization >= UTILIZATION_WARNING {
                        warn!(
                            utilization = ledger.utilization,
                            reserved = ledger.reserved_workflows,
                            waiting = ledger.waiting_workflows,
                            "Resource utilization high"
                        );
                    }
                }
            },
        ));

        loops.extend(self.heartbeat.clone().spawn(&self.shutdown));

        let cleanup = self.config.cleanup_interval();
        loops.push(self.bus.clone().spawn_cleanup(cleanup, &self.shutdown));
        let scheduler = self.scheduler.clone();
        loops.push(self.shutdown.spawn_periodic("history-prune", cleanup, move || {
            let scheduler = scheduler.clone();
            async move {
                scheduler.prune_history(Utc::now()).await;
            }
        }));

        info!(loops = loops.len(), "Orchestrator started");
        Ok(())
    }

    /// Signal every loop to stop and wait for them. In-flight executor calls
    /// are not interrupted.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let loops: Vec<JoinHandle<()>> = std::mem::take(&mut *self.loops.lock());
        let count = loops.len();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        info!(loops = count, "Orchestrator stopped");
    }

    pub fn register_agent(&self, record: AgentRecord) -> AgentflowResult<()> {
        let name = record.name.clone();
        self.registry.register(record)?;
        info!(agent = %name, "Agent registered");
        Ok(())
    }

    pub fn heartbeat(&self, agent: &str) -> AgentflowResult<()> {
        self.heartbeat.beat(agent)
    }

    pub async fn submit(&self, workflow: Workflow, tasks: Vec<Task>) -> AgentflowResult<Admission> {
        self.scheduler.submit(workflow, tasks).await
    }

    pub async fn cancel(&self, workflow_id: Uuid) -> AgentflowResult<()> {
        self.scheduler.cancel_workflow(workflow_id).await
    }

    pub async fn pause(&self, workflow_id: Uuid) -> AgentflowResult<()> {
        self.scheduler.pause_workflow(workflow_id).await
    }

    pub async fn resume(&self, workflow_id: Uuid) -> AgentflowResult<()> {
        self.scheduler.resume_workflow(workflow_id).await
    }

    pub async fn workflow(&self, workflow_id: Uuid) -> Option<Workflow> {
        self.scheduler.workflow(workflow_id).await
    }

    pub async fn wait_for_workflow(&self, workflow_id: Uuid, timeout: Duration) -> AgentflowResult<Workflow> {
        self.scheduler.wait_for_workflow(workflow_id, timeout).await
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.collect().await
    }
}

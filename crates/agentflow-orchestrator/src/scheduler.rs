//! Dependency-aware task dispatch.
//!
//! All task, workflow and queue state sits behind one `RwLock`. The registry
//! and the admission ledger have their own locks, and no method here holds
//! more than one of them at a time: agent records are snapshotted before the
//! state lock is taken, and ledger calls happen after it is released.

use crate::admission::Admission;
use crate::executor::AgentExecutor;
use crate::planner::{ExecutionPlan, ExecutionPlanner};
use crate::task_queue::{ReadyQueue, Verdict};
use crate::types::{Task, TaskStatus, TaskTally, Workflow, WorkflowStatus};
use agentflow_core::{AgentRecord, AgentRegistry, AgentflowError, AgentflowResult, OrchestrationConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct WorkflowEntry {
    workflow: Workflow,
    plan: ExecutionPlan,
    /// Holds a resource reservation (or held one, once released).
    admitted: bool,
    released: bool,
    /// Executor calls currently outstanding for this workflow.
    in_flight: usize,
}

struct InFlight {
    agent: String,
    workflow_id: Option<Uuid>,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<Uuid, Task>,
    workflows: HashMap<Uuid, WorkflowEntry>,
    ready: ReadyQueue,
    /// Outstanding executor calls per agent.
    active: HashMap<String, usize>,
    /// Keyed by (task, attempt) so a superseded attempt can be recognised.
    in_flight: HashMap<(Uuid, u32), InFlight>,
}

impl SchedulerState {
    fn is_completed(&self, id: &Uuid) -> bool {
        self.tasks
            .get(id)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    }

    /// Queue every idle task of the workflow whose dependencies completed.
    fn enqueue_ready(&mut self, workflow_id: &Uuid) -> usize {
        let Some(entry) = self.workflows.get(workflow_id) else {
            return 0;
        };
        if !entry.admitted
            || entry.workflow.status.is_terminal()
            || entry.workflow.status == WorkflowStatus::Paused
        {
            return 0;
        }
        let mut pushed = 0;
        for id in &entry.workflow.task_ids {
            let Some(task) = self.tasks.get(id) else {
                continue;
            };
            if task.status == TaskStatus::Idle
                && task.dependencies_met(|dep| {
                    self.tasks
                        .get(dep)
                        .is_some_and(|t| t.status == TaskStatus::Completed)
                })
                && self.ready.push(task)
            {
                pushed += 1;
            }
        }
        pushed
    }

    fn tally(&self, workflow_id: &Uuid) -> Option<TaskTally> {
        let entry = self.workflows.get(workflow_id)?;
        Some(TaskTally::from_tasks(
            entry
                .workflow
                .task_ids
                .iter()
                .filter_map(|id| self.tasks.get(id)),
        ))
    }

    /// Recompute progress and settle the status. Returns the new status if it changed.
    fn settle(&mut self, workflow_id: &Uuid, now: DateTime<Utc>) -> Option<WorkflowStatus> {
        let tally = self.tally(workflow_id)?;
        let entry = self.workflows.get_mut(workflow_id)?;
        let settled = entry.workflow.apply_tally(&tally, now)?;
        match settled {
            WorkflowStatus::Completed => info!(
                workflow_id = %workflow_id,
                name = %entry.workflow.name,
                tasks = tally.total,
                "Workflow completed"
            ),
            _ => warn!(
                workflow_id = %workflow_id,
                name = %entry.workflow.name,
                failed = tally.failed,
                "Workflow failed"
            ),
        }
        Some(settled)
    }

    /// Mark a terminal, admitted workflow as released exactly once.
    fn take_release(&mut self, workflow_id: &Uuid) -> Option<Uuid> {
        let entry = self.workflows.get_mut(workflow_id)?;
        if entry.workflow.status.is_terminal() && entry.admitted && !entry.released {
            entry.released = true;
            return Some(*workflow_id);
        }
        None
    }

    /// Fail every non-terminal transitive dependent of `root`.
    fn cascade_failure(&mut self, root: Uuid, workflow_id: &Uuid, now: DateTime<Utc>) -> usize {
        let members = self
            .workflows
            .get(workflow_id)
            .map(|e| e.workflow.task_ids.clone())
            .unwrap_or_default();
        let mut frontier = vec![root];
        let mut failed = 0;
        while let Some(parent) = frontier.pop() {
            for id in &members {
                let Some(task) = self.tasks.get_mut(id) else {
                    continue;
                };
                if task.dependencies.contains(&parent) && task.abort(format!("dependency {parent} failed"), now) {
                    warn!(task_id = %id, dependency = %parent, "Dependent task failed by cascade");
                    failed += 1;
                    frontier.push(*id);
                }
            }
        }
        failed
    }
}

/// Counts used by the metrics collector.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub tasks_by_status: BTreeMap<String, usize>,
    pub workflows_by_status: BTreeMap<String, usize>,
    pub ready_queue: usize,
    pub in_flight: usize,
    pub active_by_agent: BTreeMap<String, usize>,
    pub awaiting_admission: usize,
}

struct Inner {
    state: RwLock<SchedulerState>,
    registry: Arc<AgentRegistry>,
    planner: Arc<ExecutionPlanner>,
    executor: Arc<dyn AgentExecutor>,
    workers: Arc<Semaphore>,
    poll_interval: Duration,
    retention: Duration,
}

/// Dispatches ready tasks to agents and folds their results back in.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: &OrchestrationConfig,
        registry: Arc<AgentRegistry>,
        planner: Arc<ExecutionPlanner>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(SchedulerState::default()),
                registry,
                planner,
                executor,
                workers: Arc::new(Semaphore::new(config.worker_pool_size)),
                poll_interval: config.poll_interval(),
                retention: config.retention_window(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    pub fn planner(&self) -> &Arc<ExecutionPlanner> {
        &self.inner.planner
    }

    /// Validate, plan and admit a workflow.
    ///
    /// Cycles and unknown dependencies are rejected. A workflow that does not
    /// fit the free capacity is queued and started later; one whose estimate
    /// exceeds the global limits stays queued until it is cancelled.
    pub async fn submit(&self, mut workflow: Workflow, mut tasks: Vec<Task>) -> AgentflowResult<Admission> {
        if tasks.is_empty() {
            return Err(AgentflowError::Validation(format!(
                "workflow '{}' has no tasks",
                workflow.name
            )));
        }
        if workflow.max_parallel_tasks == 0 {
            return Err(AgentflowError::Validation(format!(
                "workflow '{}' must allow at least one parallel task",
                workflow.name
            )));
        }
        if workflow.status != WorkflowStatus::Pending {
            return Err(AgentflowError::Validation(format!(
                "workflow '{}' was already submitted",
                workflow.name
            )));
        }
        for task in &mut tasks {
            if task.agent.trim().is_empty() {
                return Err(AgentflowError::Validation(format!("task {} has no target agent", task.id)));
            }
            if task.max_attempts == 0 {
                return Err(AgentflowError::Validation(format!(
                    "task {} must allow at least one attempt",
                    task.id
                )));
            }
            if task.status != TaskStatus::Idle || task.attempts != 0 {
                return Err(AgentflowError::Validation(format!("task {} is not fresh", task.id)));
            }
            task.workflow_id = Some(workflow.id);
        }

        let plan = self.inner.planner.plan(&workflow, &tasks)?;
        workflow.task_ids = tasks.iter().map(|t| t.id).collect();
        workflow.estimated_duration_secs = Some(plan.critical_path_seconds);
        workflow.progress = 0.0;
        let snapshot = workflow.clone();

        {
            let mut state = self.inner.state.write().await;
            if state.workflows.contains_key(&workflow.id) {
                return Err(AgentflowError::Validation(format!(
                    "workflow {} already exists",
                    workflow.id
                )));
            }
            if let Some(task) = tasks.iter().find(|t| state.tasks.contains_key(&t.id)) {
                return Err(AgentflowError::Validation(format!("task {} already exists", task.id)));
            }
            for task in tasks {
                state.tasks.insert(task.id, task);
            }
            state.workflows.insert(
                workflow.id,
                WorkflowEntry {
                    workflow,
                    plan: plan.clone(),
                    admitted: false,
                    released: false,
                    in_flight: 0,
                },
            );
        }
        info!(
            workflow_id = %snapshot.id,
            name = %snapshot.name,
            tasks = snapshot.task_ids.len(),
            estimated_secs = plan.critical_path_seconds,
            "Workflow submitted"
        );

        let (admission, admitted) = self.inner.planner.admit(&snapshot, &plan, Utc::now());
        self.activate(admitted).await;
        Ok(admission)
    }

    /// Mark workflows admitted by the ledger as runnable and queue their ready tasks.
    async fn activate(&self, mut ids: Vec<Uuid>) {
        while !ids.is_empty() {
            let mut stale = Vec::new();
            {
                let mut state = self.inner.state.write().await;
                for id in ids.drain(..) {
                    let Some(entry) = state.workflows.get_mut(&id) else {
                        stale.push(id);
                        continue;
                    };
                    entry.admitted = true;
                    if entry.workflow.status.is_terminal() {
                        // cancelled while it was waiting
                        entry.released = true;
                        stale.push(id);
                        continue;
                    }
                    let queued = state.enqueue_ready(&id);
                    debug!(workflow_id = %id, queued, "Workflow activated");
                }
            }
            for id in stale {
                ids.extend(self.inner.planner.release(&id));
            }
        }
    }

    /// Retry queued workflows against the ledger.
    pub async fn admit_waiting(&self) -> usize {
        let admitted = self.inner.planner.ledger().admit_waiting();
        let count = admitted.len();
        if count > 0 {
            info!(count, "Queued workflows admitted");
        }
        self.activate(admitted).await;
        count
    }

    async fn release_workflow(&self, workflow_id: Uuid) {
        let admitted = self.inner.planner.release(&workflow_id);
        self.activate(admitted).await;
    }

    /// One dispatch pass. Returns how many tasks were handed to the executor.
    pub async fn tick(&self) -> usize {
        let agents: HashMap<String, AgentRecord> = self
            .inner
            .registry
            .list()
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect();
        let now = Utc::now();
        let mut launches: Vec<(Task, OwnedSemaphorePermit)> = Vec::new();
        let mut blocked: Vec<Uuid> = Vec::new();

        {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;

            let revived: Vec<Uuid> = state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Blocked && agents.get(&t.agent).is_some_and(|a| a.alive))
                .map(|t| t.id)
                .collect();
            for id in revived {
                if let Some(task) = state.tasks.get_mut(&id) {
                    if task.transition(TaskStatus::Idle).is_ok() {
                        info!(task_id = %id, agent = %task.agent, "Agent available again, task unblocked");
                        state.ready.push(task);
                    }
                }
            }

            loop {
                let Ok(permit) = self.inner.workers.clone().try_acquire_owned() else {
                    break;
                };
                let SchedulerState {
                    tasks,
                    workflows,
                    ready,
                    active,
                    ..
                } = &mut *state;
                let next = ready.pop_dispatchable(|entry| {
                    let Some(task) = tasks.get(&entry.task_id) else {
                        return Verdict::Discard;
                    };
                    if task.status != TaskStatus::Idle || !task.has_attempts_left() {
                        return Verdict::Discard;
                    }
                    let deps_done = task.dependencies_met(|dep| {
                        tasks
                            .get(dep)
                            .is_some_and(|t| t.status == TaskStatus::Completed)
                    });
                    if !deps_done {
                        return Verdict::Discard;
                    }
                    if let Some(workflow_id) = task.workflow_id {
                        let Some(wf) = workflows.get(&workflow_id) else {
                            return Verdict::Discard;
                        };
                        if !wf.admitted
                            || wf.workflow.status.is_terminal()
                            || wf.workflow.status == WorkflowStatus::Paused
                        {
                            return Verdict::Discard;
                        }
                        if wf.in_flight >= wf.workflow.max_parallel_tasks {
                            return Verdict::Defer;
                        }
                    }
                    match agents.get(&entry.agent) {
                        Some(agent) if agent.alive => match check_capacity(agent, active) {
                            Ok(()) => Verdict::Take,
                            Err(e) if e.is_soft() => Verdict::Defer,
                            Err(_) => Verdict::Discard,
                        },
                        _ => {
                            blocked.push(entry.task_id);
                            Verdict::Discard
                        }
                    }
                });
                let Some(entry) = next else {
                    break;
                };

                let Some(task) = state.tasks.get_mut(&entry.task_id) else {
                    continue;
                };
                if let Err(e) = task.start(now) {
                    warn!(task_id = %entry.task_id, error = %e, "Ready task could not start");
                    continue;
                }
                let task = task.clone();
                *state.active.entry(task.agent.clone()).or_insert(0) += 1;
                if let Some(wf) = task.workflow_id.and_then(|id| state.workflows.get_mut(&id)) {
                    wf.in_flight += 1;
                    if wf.workflow.status == WorkflowStatus::Pending {
                        if let Err(e) = wf.workflow.transition(WorkflowStatus::Running, now) {
                            warn!(workflow_id = %wf.workflow.id, error = %e, "Workflow could not start");
                        } else {
                            info!(workflow_id = %wf.workflow.id, name = %wf.workflow.name, "Workflow started");
                        }
                    }
                }
                state.in_flight.insert(
                    (task.id, task.attempts),
                    InFlight {
                        agent: task.agent.clone(),
                        workflow_id: task.workflow_id,
                    },
                );
                launches.push((task, permit));
            }

            for id in &blocked {
                if let Some(task) = state.tasks.get_mut(id) {
                    if task.transition(TaskStatus::Blocked).is_ok() {
                        warn!(task_id = %id, agent = %task.agent, "Target agent unavailable, task blocked");
                    }
                }
            }
        }

        let dispatched = launches.len();
        for (task, permit) in launches {
            self.inner.registry.record_dispatch(&task.agent);
            info!(
                task_id = %task.id,
                agent = %task.agent,
                action = %task.action,
                attempt = task.attempts,
                "Task dispatched"
            );
            self.launch(task, permit);
        }
        dispatched
    }

    /// Run the executor on the worker pool and report back when it returns.
    fn launch(&self, task: Task, permit: OwnedSemaphorePermit) {
        let scheduler = self.clone();
        let executor = self.inner.executor.clone();
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let call = {
                let task = task.clone();
                tokio::spawn(async move { execute_bounded(executor.as_ref(), &task).await })
            };
            let outcome = match call.await {
                Ok(outcome) => outcome,
                Err(join) => Err(AgentflowError::TaskExecution(format!("executor aborted: {join}"))),
            };
            drop(permit);
            if let Err(e) = scheduler
                .report(task.id, task.attempts, outcome, started.elapsed())
                .await
            {
                warn!(task_id = %task.id, error = %e, "Result could not be recorded");
            }
        });
    }

    /// Fold one attempt's outcome into the task and its workflow.
    ///
    /// Results for attempts that were cancelled, paused or superseded are
    /// discarded. Returns the task's status afterwards.
    pub async fn report(
        &self,
        task_id: Uuid,
        attempt: u32,
        outcome: AgentflowResult<serde_json::Value>,
        elapsed: Duration,
    ) -> AgentflowResult<TaskStatus> {
        let now = Utc::now();
        let mut finished: Option<(String, bool)> = None;
        let mut release = None;

        let status = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;

            let flight = state.in_flight.remove(&(task_id, attempt));
            if let Some(flight) = &flight {
                if let Some(count) = state.active.get_mut(&flight.agent) {
                    *count = count.saturating_sub(1);
                }
                if let Some(wf) = flight.workflow_id.and_then(|id| state.workflows.get_mut(&id)) {
                    wf.in_flight = wf.in_flight.saturating_sub(1);
                }
            }

            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| AgentflowError::NotFound(format!("task {task_id}")))?;
            if flight.is_none() || task.status != TaskStatus::Running || task.attempts != attempt {
                debug!(task_id = %task_id, attempt, status = ?task.status, "Discarding result of inactive attempt");
                return Ok(task.status);
            }
            let workflow_id = task.workflow_id;
            let agent = task.agent.clone();

            match outcome {
                Ok(value) => {
                    task.complete(value, elapsed, now)?;
                    info!(
                        task_id = %task_id,
                        agent = %agent,
                        duration_ms = elapsed.as_millis() as u64,
                        "Task completed"
                    );
                    finished = Some((agent, true));
                    if let Some(wf) = &workflow_id {
                        state.enqueue_ready(wf);
                    }
                }
                Err(err) => {
                    task.fail_attempt(err.to_string(), elapsed, now)?;
                    finished = Some((agent.clone(), false));
                    if task.has_attempts_left() {
                        task.requeue()?;
                        warn!(
                            task_id = %task_id,
                            agent = %agent,
                            attempt,
                            max_attempts = task.max_attempts,
                            error = %err,
                            "Task attempt failed, requeued"
                        );
                        state.ready.push(task);
                    } else {
                        error!(
                            task_id = %task_id,
                            agent = %agent,
                            attempts = task.attempts,
                            error = %err,
                            "Task failed permanently"
                        );
                        if let Some(wf) = &workflow_id {
                            state.cascade_failure(task_id, wf, now);
                        }
                    }
                }
            }

            if let Some(wf) = &workflow_id {
                state.settle(wf, now);
                release = state.take_release(wf);
            }
            state
                .tasks
                .get(&task_id)
                .map(|t| t.status)
                .unwrap_or(TaskStatus::Failed)
        };

        if let Some((agent, success)) = finished {
            self.inner.registry.record_outcome(&agent, success, elapsed);
        }
        if let Some(workflow_id) = release {
            self.release_workflow(workflow_id).await;
        }
        Ok(status)
    }

    /// Recompute progress and status of every live workflow.
    /// Returns how many settled in this pass.
    pub async fn refresh_progress(&self) -> usize {
        let now = Utc::now();
        let (settled, releases) = {
            let mut state = self.inner.state.write().await;
            let ids: Vec<Uuid> = state.workflows.keys().copied().collect();
            let mut settled = 0;
            let mut releases = Vec::new();
            for id in &ids {
                if state.settle(id, now).is_some() {
                    settled += 1;
                }
                if let Some(release) = state.take_release(id) {
                    releases.push(release);
                }
            }
            (settled, releases)
        };
        for id in releases {
            self.release_workflow(id).await;
        }
        settled
    }

    /// Fail every non-terminal task with reason "cancelled". Idempotent.
    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> AgentflowResult<()> {
        let now = Utc::now();
        let (admitted, release) = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let entry = state
                .workflows
                .get(&workflow_id)
                .ok_or_else(|| AgentflowError::NotFound(format!("workflow {workflow_id}")))?;
            if entry.workflow.status.is_terminal() {
                debug!(workflow_id = %workflow_id, status = ?entry.workflow.status, "Cancel on finished workflow ignored");
                return Ok(());
            }
            let task_ids = entry.workflow.task_ids.clone();
            let mut aborted = 0;
            for id in &task_ids {
                if let Some(task) = state.tasks.get_mut(id) {
                    if task.abort("cancelled", now) {
                        aborted += 1;
                    }
                }
            }
            state.ready.retain(|e| e.workflow_id != Some(workflow_id));
            let entry = state
                .workflows
                .get_mut(&workflow_id)
                .ok_or_else(|| AgentflowError::NotFound(format!("workflow {workflow_id}")))?;
            entry.workflow.transition(WorkflowStatus::Cancelled, now)?;
            let admitted = entry.admitted;
            state.settle(&workflow_id, now);
            info!(workflow_id = %workflow_id, aborted, "Workflow cancelled");
            (admitted, state.take_release(&workflow_id))
        };
        if !admitted && self.inner.planner.ledger().cancel_waiting(&workflow_id) {
            debug!(workflow_id = %workflow_id, "Removed from admission queue");
        }
        if let Some(id) = release {
            self.release_workflow(id).await;
        }
        Ok(())
    }

    /// Stop dispatching a workflow. Running tasks become Paused and their
    /// results are discarded when they arrive.
    pub async fn pause_workflow(&self, workflow_id: Uuid) -> AgentflowResult<()> {
        let now = Utc::now();
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        let entry = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| AgentflowError::NotFound(format!("workflow {workflow_id}")))?;
        if entry.workflow.status == WorkflowStatus::Paused {
            return Ok(());
        }
        entry.workflow.transition(WorkflowStatus::Paused, now)?;
        let task_ids = entry.workflow.task_ids.clone();
        let mut paused = 0;
        for id in &task_ids {
            if let Some(task) = state.tasks.get_mut(id) {
                if task.status == TaskStatus::Running && task.transition(TaskStatus::Paused).is_ok() {
                    paused += 1;
                }
            }
        }
        state.ready.retain(|e| e.workflow_id != Some(workflow_id));
        info!(workflow_id = %workflow_id, paused, "Workflow paused");
        Ok(())
    }

    /// Resume a paused workflow; paused tasks go back to Idle and are requeued.
    ///
    /// Attempts are counted at dispatch, so pausing a running task spends the
    /// attempt it was on. A task paused during its last attempt therefore
    /// fails permanently here ("attempts exhausted while paused") even though
    /// the executor never reported a failure for it.
    pub async fn resume_workflow(&self, workflow_id: Uuid) -> AgentflowResult<()> {
        let now = Utc::now();
        let release = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let entry = state
                .workflows
                .get_mut(&workflow_id)
                .ok_or_else(|| AgentflowError::NotFound(format!("workflow {workflow_id}")))?;
            match entry.workflow.status {
                WorkflowStatus::Paused => {}
                WorkflowStatus::Pending | WorkflowStatus::Running => return Ok(()),
                other => return Err(AgentflowError::transition(other, WorkflowStatus::Running)),
            }
            let target = if entry.workflow.started_at.is_some() {
                WorkflowStatus::Running
            } else {
                WorkflowStatus::Pending
            };
            entry.workflow.transition(target, now)?;
            let task_ids = entry.workflow.task_ids.clone();
            let mut exhausted = Vec::new();
            for id in &task_ids {
                let Some(task) = state.tasks.get_mut(id) else {
                    continue;
                };
                if task.status != TaskStatus::Paused {
                    continue;
                }
                if task.has_attempts_left() {
                    task.transition(TaskStatus::Idle)?;
                } else if task.abort("attempts exhausted while paused", now) {
                    warn!(task_id = %id, attempts = task.attempts, "Paused task has no attempts left");
                    exhausted.push(*id);
                }
            }
            for id in exhausted {
                state.cascade_failure(id, &workflow_id, now);
            }
            let queued = state.enqueue_ready(&workflow_id);
            state.settle(&workflow_id, now);
            info!(workflow_id = %workflow_id, queued, "Workflow resumed");
            state.take_release(&workflow_id)
        };
        if let Some(id) = release {
            self.release_workflow(id).await;
        }
        Ok(())
    }

    /// Drop terminal workflows (and their tasks) older than the retention window.
    pub async fn prune_history(&self, now: DateTime<Utc>) -> usize {
        let Ok(window) = chrono::Duration::from_std(self.inner.retention) else {
            return 0;
        };
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        let expired: Vec<Uuid> = state
            .workflows
            .values()
            .filter(|e| {
                e.workflow.status.is_terminal()
                    && e.in_flight == 0
                    && (e.released || !e.admitted)
                    && e.workflow.completed_at.is_some_and(|at| at + window < now)
            })
            .map(|e| e.workflow.id)
            .collect();
        for id in &expired {
            if let Some(entry) = state.workflows.remove(id) {
                for task_id in &entry.workflow.task_ids {
                    state.tasks.remove(task_id);
                }
            }
        }
        if !expired.is_empty() {
            debug!(pruned = expired.len(), "Workflow history pruned");
        }
        expired.len()
    }

    pub async fn workflow(&self, workflow_id: Uuid) -> Option<Workflow> {
        let state = self.inner.state.read().await;
        state.workflows.get(&workflow_id).map(|e| e.workflow.clone())
    }

    pub async fn workflows(&self) -> Vec<Workflow> {
        let state = self.inner.state.read().await;
        let mut workflows: Vec<Workflow> = state.workflows.values().map(|e| e.workflow.clone()).collect();
        workflows.sort_by_key(|w| w.created_at);
        workflows
    }

    pub async fn plan(&self, workflow_id: Uuid) -> Option<ExecutionPlan> {
        let state = self.inner.state.read().await;
        state.workflows.get(&workflow_id).map(|e| e.plan.clone())
    }

    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.inner.state.read().await.tasks.get(&task_id).cloned()
    }

    /// Tasks of a workflow in submission order.
    pub async fn workflow_tasks(&self, workflow_id: Uuid) -> Vec<Task> {
        let state = self.inner.state.read().await;
        state
            .workflows
            .get(&workflow_id)
            .map(|e| {
                e.workflow
                    .task_ids
                    .iter()
                    .filter_map(|id| state.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `task_id` could be dispatched right now as far as its
    /// dependencies go.
    pub async fn dependencies_satisfied(&self, task_id: Uuid) -> AgentflowResult<()> {
        let state = self.inner.state.read().await;
        let task = state
            .tasks
            .get(&task_id)
            .ok_or_else(|| AgentflowError::NotFound(format!("task {task_id}")))?;
        match task.dependencies.iter().find(|dep| !state.is_completed(dep)) {
            Some(dep) => Err(AgentflowError::DependencyNotSatisfied {
                task: task_id.to_string(),
                dependency: dep.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Whether `agent` has a free concurrency slot right now.
    pub async fn agent_capacity(&self, agent: &str) -> AgentflowResult<()> {
        let record = self
            .inner
            .registry
            .get(agent)
            .ok_or_else(|| AgentflowError::NotFound(format!("agent {agent}")))?;
        let state = self.inner.state.read().await;
        check_capacity(&record, &state.active)
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.read().await;
        let mut stats = SchedulerStats {
            ready_queue: state.ready.len(),
            in_flight: state.in_flight.len(),
            ..SchedulerStats::default()
        };
        for task in state.tasks.values() {
            *stats
                .tasks_by_status
                .entry(task.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        for entry in state.workflows.values() {
            *stats
                .workflows_by_status
                .entry(entry.workflow.status.as_str().to_string())
                .or_insert(0) += 1;
            if !entry.admitted && !entry.workflow.status.is_terminal() {
                stats.awaiting_admission += 1;
            }
        }
        stats.active_by_agent = state
            .active
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(agent, n)| (agent.clone(), *n))
            .collect();
        stats
    }

    /// Poll until the workflow is terminal or `timeout` passes, then return
    /// its latest snapshot.
    pub async fn wait_for_workflow(&self, workflow_id: Uuid, timeout: Duration) -> AgentflowResult<Workflow> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let workflow = self
                .workflow(workflow_id)
                .await
                .ok_or_else(|| AgentflowError::NotFound(format!("workflow {workflow_id}")))?;
            if workflow.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(workflow);
            }
            tokio::time::sleep(self.inner.poll_interval).await;
        }
    }
}

fn check_capacity(agent: &AgentRecord, active: &HashMap<String, usize>) -> AgentflowResult<()> {
    if active.get(&agent.name).copied().unwrap_or(0) >= agent.max_concurrent {
        return Err(AgentflowError::CapacityUnavailable {
            agent: agent.name.clone(),
        });
    }
    Ok(())
}

async fn execute_bounded(executor: &dyn AgentExecutor, task: &Task) -> AgentflowResult<serde_json::Value> {
    match task.timeout() {
        Some(limit) => match tokio::time::timeout(limit, executor.execute(task)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AgentflowError::TaskExecution(format!(
                "timed out after {}ms",
                limit.as_millis()
            ))),
        },
        None => executor.execute(task).await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agentflow_core::ResourceVector;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Succeeds unless the action is listed in `failing`; logs call order.
    struct Recorder {
        failing: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AgentExecutor for Recorder {
        async fn execute(&self, task: &Task) -> AgentflowResult<serde_json::Value> {
            self.calls.lock().push(task.action.clone());
            if self.failing.contains(&task.action) {
                return Err(AgentflowError::TaskExecution(format!("{} broke", task.action)));
            }
            Ok(serde_json::json!({"action": task.action}))
        }
    }

    fn setup(executor: Arc<dyn AgentExecutor>, config: OrchestrationConfig) -> Scheduler {
        let registry = Arc::new(AgentRegistry::new());
        registry
            .register(AgentRecord::new("worker", "coder", 2).with_resources(ResourceVector::cpu(1.0)))
            .unwrap();
        let planner = Arc::new(ExecutionPlanner::new(&config, registry.clone()).unwrap());
        Scheduler::new(&config, registry, planner, executor)
    }

    async fn drive(scheduler: &Scheduler, workflow_id: Uuid) -> Workflow {
        for _ in 0..200 {
            scheduler.tick().await;
            tokio::time::sleep(Duration::from_millis(2)).await;
            scheduler.refresh_progress().await;
            let wf = scheduler.workflow(workflow_id).await.unwrap();
            if wf.status.is_terminal() {
                return wf;
            }
        }
        scheduler.workflow(workflow_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_rejects_empty_and_cyclic_workflows() {
        let scheduler = setup(Recorder::new(&[]), OrchestrationConfig::default());
        let err = scheduler.submit(Workflow::new("empty"), vec![]).await.unwrap_err();
        assert!(matches!(err, AgentflowError::Validation(_)));

        let mut a = Task::new("worker", "a");
        let mut b = Task::new("worker", "b");
        a.dependencies = vec![b.id];
        b.dependencies = vec![a.id];
        let err = scheduler.submit(Workflow::new("cycle"), vec![a, b]).await.unwrap_err();
        assert!(matches!(err, AgentflowError::Validation(_)));
        assert!(scheduler.workflows().await.is_empty());
    }

    #[tokio::test]
    async fn test_chain_runs_in_dependency_order() {
        let recorder = Recorder::new(&[]);
        let scheduler = setup(recorder.clone(), OrchestrationConfig::default());
        let a = Task::new("worker", "first");
        let b = Task::new("worker", "second").with_dependencies(vec![a.id]);
        let c = Task::new("worker", "third").with_dependencies(vec![b.id]);
        let wf = Workflow::new("chain");
        let id = wf.id;
        assert_eq!(scheduler.submit(wf, vec![c, b, a]).await.unwrap(), Admission::Admitted);

        let wf = drive(&scheduler, id).await;
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.progress, 1.0);
        assert_eq!(*recorder.calls.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_dependency_not_satisfied_reported() {
        let scheduler = setup(Recorder::new(&[]), OrchestrationConfig::default());
        let a = Task::new("worker", "a");
        let b = Task::new("worker", "b").with_dependencies(vec![a.id]);
        let (a_id, b_id) = (a.id, b.id);
        scheduler.submit(Workflow::new("w"), vec![a, b]).await.unwrap();
        let err = scheduler.dependencies_satisfied(b_id).await.unwrap_err();
        assert!(err.is_soft());
        assert!(scheduler.dependencies_satisfied(a_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_retry_then_permanent_failure_cascades() {
        let recorder = Recorder::new(&["flaky"]);
        let scheduler = setup(recorder.clone(), OrchestrationConfig::default());
        let root = Task::new("worker", "flaky").with_max_attempts(2);
        let child = Task::new("worker", "child").with_dependencies(vec![root.id]);
        let (root_id, child_id) = (root.id, child.id);
        let wf = Workflow::new("w");
        let id = wf.id;
        scheduler.submit(wf, vec![root, child]).await.unwrap();

        let wf = drive(&scheduler, id).await;
        assert_eq!(wf.status, WorkflowStatus::Failed);
        let root = scheduler.task(root_id).await.unwrap();
        assert_eq!(root.attempts, 2);
        assert_eq!(root.status, TaskStatus::Failed);
        let child = scheduler.task(child_id).await.unwrap();
        assert_eq!(child.status, TaskStatus::Failed);
        assert_eq!(child.error, Some(format!("dependency {root_id} failed")));
        assert_eq!(recorder.calls.lock().len(), 2);

        let stats = scheduler.registry().get("worker").unwrap().stats;
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.dispatched, 2);
    }

    #[tokio::test]
    async fn test_unknown_agent_blocks_until_registered() {
        let scheduler = setup(Recorder::new(&[]), OrchestrationConfig::default());
        let task = Task::new("ghost", "haunt");
        let task_id = task.id;
        scheduler.submit(Workflow::new("w"), vec![task]).await.unwrap();

        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(scheduler.task(task_id).await.unwrap().status, TaskStatus::Blocked);

        scheduler
            .registry()
            .register(AgentRecord::new("ghost", "research", 1))
            .unwrap();
        assert_eq!(scheduler.tick().await, 1);
    }

    #[tokio::test]
    async fn test_agent_capacity_limits_dispatch() {
        let scheduler = setup(Recorder::new(&[]), OrchestrationConfig::default());
        let tasks: Vec<Task> = (0..4).map(|i| Task::new("worker", format!("t{i}"))).collect();
        scheduler
            .submit(Workflow::new("w").with_max_parallel_tasks(10), tasks)
            .await
            .unwrap();
        // worker allows two concurrent tasks
        assert!(scheduler.agent_capacity("worker").await.is_ok());
        assert_eq!(scheduler.tick().await, 2);
        assert_eq!(scheduler.tick().await, 0);
        let err = scheduler.agent_capacity("worker").await.unwrap_err();
        assert!(matches!(err, AgentflowError::CapacityUnavailable { ref agent } if agent == "worker"));
        assert!(err.is_soft());
        assert!(matches!(
            scheduler.agent_capacity("ghost").await,
            Err(AgentflowError::NotFound(_))
        ));
        let stats = scheduler.stats().await;
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.active_by_agent.get("worker"), Some(&2));
    }

    #[tokio::test]
    async fn test_workflow_parallel_cap() {
        let scheduler = setup(Recorder::new(&[]), OrchestrationConfig::default());
        let tasks: Vec<Task> = (0..3).map(|i| Task::new("worker", format!("t{i}"))).collect();
        scheduler
            .submit(Workflow::new("w").with_max_parallel_tasks(1), tasks)
            .await
            .unwrap();
        assert_eq!(scheduler.tick().await, 1);
        assert_eq!(scheduler.tick().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let scheduler = setup(Recorder::new(&[]), OrchestrationConfig::default());
        let a = Task::new("worker", "a");
        let b = Task::new("worker", "b").with_dependencies(vec![a.id]);
        let wf = Workflow::new("w");
        let id = wf.id;
        scheduler.submit(wf, vec![a, b]).await.unwrap();

        scheduler.cancel_workflow(id).await.unwrap();
        scheduler.cancel_workflow(id).await.unwrap();
        let wf = scheduler.workflow(id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Cancelled);
        for task in scheduler.workflow_tasks(id).await {
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.as_deref(), Some("cancelled"));
        }
        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(scheduler.planner().ledger().allocated().cpu, 0.0);
    }

    #[tokio::test]
    async fn test_pause_discards_in_flight_result_and_resume_reruns() {
        let recorder = Recorder::new(&[]);
        let scheduler = setup(recorder.clone(), OrchestrationConfig::default());
        let task = Task::new("worker", "long");
        let task_id = task.id;
        let wf = Workflow::new("w");
        let id = wf.id;
        scheduler.submit(wf, vec![task]).await.unwrap();

        // dispatch by hand so the result can be reported after pausing
        {
            let mut state = scheduler.inner.state.write().await;
            let task = state.tasks.get_mut(&task_id).unwrap();
            task.start(Utc::now()).unwrap();
            state.in_flight.insert(
                (task_id, 1),
                InFlight {
                    agent: "worker".into(),
                    workflow_id: Some(id),
                },
            );
        }
        scheduler.pause_workflow(id).await.unwrap();
        let status = scheduler
            .report(task_id, 1, Ok(serde_json::Value::Null), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Paused);
        assert_eq!(scheduler.tick().await, 0);

        scheduler.resume_workflow(id).await.unwrap();
        let wf = drive(&scheduler, id).await;
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(scheduler.task(task_id).await.unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_pause_on_last_attempt_fails_task_on_resume() {
        let scheduler = setup(Recorder::new(&[]), OrchestrationConfig::default());
        let task = Task::new("worker", "once").with_max_attempts(1);
        let task_id = task.id;
        let wf = Workflow::new("w");
        let id = wf.id;
        scheduler.submit(wf, vec![task]).await.unwrap();
        {
            let mut state = scheduler.inner.state.write().await;
            state.tasks.get_mut(&task_id).unwrap().start(Utc::now()).unwrap();
        }
        // the running attempt is spent by the pause, not by a failure
        scheduler.pause_workflow(id).await.unwrap();
        scheduler.resume_workflow(id).await.unwrap();

        let task = scheduler.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.error.as_deref(), Some("attempts exhausted while paused"));
        let wf = scheduler.workflow(id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(scheduler.planner().ledger().snapshot().reserved_workflows, 0);
    }

    #[tokio::test]
    async fn test_task_timeout_counts_as_failure() {
        struct Sleeper;

        #[async_trait]
        impl AgentExecutor for Sleeper {
            async fn execute(&self, _task: &Task) -> AgentflowResult<serde_json::Value> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(serde_json::Value::Null)
            }
        }

        let scheduler = setup(Arc::new(Sleeper), OrchestrationConfig::default());
        let task = Task::new("worker", "slow")
            .with_timeout(Duration::from_millis(10))
            .with_max_attempts(1);
        let task_id = task.id;
        let wf = Workflow::new("w");
        let id = wf.id;
        scheduler.submit(wf, vec![task]).await.unwrap();

        let wf = drive(&scheduler, id).await;
        assert_eq!(wf.status, WorkflowStatus::Failed);
        let task = scheduler.task(task_id).await.unwrap();
        assert!(task.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_prune_history_after_retention() {
        let mut config = OrchestrationConfig::default();
        config.retention_window_minutes = 1;
        let scheduler = setup(Recorder::new(&[]), config);
        let task = Task::new("worker", "a");
        let wf = Workflow::new("w");
        let id = wf.id;
        scheduler.submit(wf, vec![task]).await.unwrap();
        drive(&scheduler, id).await;

        assert_eq!(scheduler.prune_history(Utc::now()).await, 0);
        let later = Utc::now() + chrono::Duration::minutes(2);
        assert_eq!(scheduler.prune_history(later).await, 1);
        assert!(scheduler.workflow(id).await.is_none());
        assert!(scheduler.workflow_tasks(id).await.is_empty());
    }
}

//! Dependency-graph analysis and admission for workflows.
//!
//! [`ExecutionPlanner::plan`] validates a workflow's task graph (Kahn's
//! algorithm), then derives the critical path, parallel levels, a dispatch
//! order that favours the critical path, a summed resource estimate, and the
//! checkpoint / rollback-safe annotations. Admission against the global
//! limits is delegated to the [`ResourceLedger`] the planner owns.

use crate::admission::{Admission, AdmissionRequest, ResourceLedger};
use crate::types::{Task, TaskPriority, Workflow};
use agentflow_core::{
    AgentRegistry, AgentflowError, AgentflowResult, OrchestrationConfig, PlannerConfig, ResourceVector,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Every n-th critical-path task is a checkpoint.
pub const CHECKPOINT_STRIDE: usize = 3;

/// Result of planning one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub workflow_id: Uuid,
    /// Kahn order of the graph.
    pub topological_order: Vec<Uuid>,
    /// Suggested linear order: critical path first, then priority, then id.
    pub optimized_order: Vec<Uuid>,
    pub critical_path: Vec<Uuid>,
    /// Sum of the estimates along the critical path.
    pub critical_path_seconds: f64,
    /// Tasks grouped by dependency depth.
    pub levels: Vec<Vec<Uuid>>,
    pub estimates: BTreeMap<Uuid, f64>,
    pub resources: ResourceVector,
    pub checkpoints: BTreeSet<Uuid>,
    pub rollback_safe: BTreeSet<Uuid>,
}

impl ExecutionPlan {
    pub fn level_of(&self, task_id: &Uuid) -> Option<usize> {
        self.levels.iter().position(|level| level.contains(task_id))
    }

    pub fn is_on_critical_path(&self, task_id: &Uuid) -> bool {
        self.critical_path.contains(task_id)
    }

    pub fn max_parallelism(&self) -> usize {
        self.levels.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// Builds execution plans and gates workflows on global resource limits.
pub struct ExecutionPlanner {
    config: PlannerConfig,
    checkpoint_actions: Regex,
    safe_actions: Regex,
    registry: Arc<AgentRegistry>,
    ledger: ResourceLedger,
}

impl ExecutionPlanner {
    pub fn new(config: &OrchestrationConfig, registry: Arc<AgentRegistry>) -> AgentflowResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(&format!("(?i){pattern}"))
                .map_err(|e| AgentflowError::Config(format!("invalid action pattern '{pattern}': {e}")))
        };
        Ok(Self {
            checkpoint_actions: compile(&config.planner.checkpoint_action_pattern)?,
            safe_actions: compile(&config.planner.safe_action_pattern)?,
            config: config.planner.clone(),
            registry,
            ledger: ResourceLedger::new(config.global_resource_limits, config.max_parallel_workflows),
        })
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Deterministic duration estimate in seconds: the agent kind's base time
    /// scaled by the largest multiplier whose keyword occurs in the action.
    pub fn estimate_seconds(&self, task: &Task) -> f64 {
        let kind = self
            .registry
            .get(&task.agent)
            .map(|agent| agent.kind)
            .unwrap_or_else(|| task.agent.clone());
        let base = self
            .config
            .agent_base_seconds
            .get(&kind)
            .copied()
            .unwrap_or(self.config.default_task_seconds);
        let action = task.action.to_lowercase();
        let multiplier = self
            .config
            .complexity_multipliers
            .iter()
            .filter(|(keyword, _)| action.contains(keyword.to_lowercase().as_str()))
            .map(|(_, m)| *m)
            .fold(None, |best: Option<f64>, m| Some(best.map_or(m, |b| b.max(m))))
            .unwrap_or(1.0);
        base * multiplier
    }

    /// Validate the task graph and compute the plan.
    pub fn plan(&self, workflow: &Workflow, tasks: &[Task]) -> AgentflowResult<ExecutionPlan> {
        let graph = TaskGraph::build(tasks)?;
        let order = graph.topological_order()?;

        let estimates: HashMap<Uuid, f64> = tasks.iter().map(|t| (t.id, self.estimate_seconds(t))).collect();
        let (critical_path, critical_path_seconds) = graph.critical_path(&order, &estimates);
        let levels = graph.levels(&order);
        let on_path: HashSet<Uuid> = critical_path.iter().copied().collect();
        let optimized_order = graph.optimized_order(&on_path);

        let resources: ResourceVector = tasks
            .iter()
            .map(|t| {
                self.registry
                    .get(&t.agent)
                    .map(|agent| agent.resources)
                    .unwrap_or_default()
            })
            .sum();

        let mut checkpoints: BTreeSet<Uuid> = critical_path
            .iter()
            .enumerate()
            .filter(|(i, _)| (i + 1) % CHECKPOINT_STRIDE == 0)
            .map(|(_, id)| *id)
            .collect();
        checkpoints.extend(
            tasks
                .iter()
                .filter(|t| self.checkpoint_actions.is_match(&t.action))
                .map(|t| t.id),
        );
        let rollback_safe: BTreeSet<Uuid> = tasks
            .iter()
            .filter(|t| t.dependencies.is_empty() || self.safe_actions.is_match(&t.action))
            .map(|t| t.id)
            .collect();

        debug!(
            workflow_id = %workflow.id,
            tasks = tasks.len(),
            levels = levels.len(),
            critical_path_seconds,
            "Plan computed"
        );

        Ok(ExecutionPlan {
            workflow_id: workflow.id,
            topological_order: order,
            optimized_order,
            critical_path,
            critical_path_seconds,
            levels,
            estimates: estimates.into_iter().collect(),
            resources,
            checkpoints,
            rollback_safe,
        })
    }

    /// Reserve the plan's resources or queue the workflow behind others.
    ///
    /// Never rejects: an estimate larger than the global limits waits in the
    /// queue until cancelled. Returns the caller's outcome and every workflow
    /// admitted by the call.
    pub fn admit(
        &self,
        workflow: &Workflow,
        plan: &ExecutionPlan,
        submitted_at: DateTime<Utc>,
    ) -> (Admission, Vec<Uuid>) {
        if !self.ledger.can_ever_fit(&plan.resources) {
            warn!(
                workflow_id = %workflow.id,
                name = %workflow.name,
                needs = ?plan.resources,
                limits = ?self.ledger.limits(),
                "Workflow estimate exceeds the global limits and cannot start"
            );
        }
        let (admission, admitted) = self.ledger.try_admit(AdmissionRequest {
            workflow_id: workflow.id,
            priority: workflow.priority,
            estimated_seconds: plan.critical_path_seconds,
            submitted_at,
            resources: plan.resources,
        });
        match admission {
            Admission::Admitted => info!(workflow_id = %workflow.id, cpu = plan.resources.cpu, "Workflow admitted"),
            Admission::Queued { ahead } => {
                let reason = match self.ledger.check_fits(&plan.resources) {
                    Err(e) => e.to_string(),
                    Ok(()) => "waiting behind the queue head".to_string(),
                };
                info!(workflow_id = %workflow.id, ahead, %reason, "Workflow queued for resources");
            }
        }
        (admission, admitted)
    }

    /// Release a workflow's reservation. Returns the workflows admitted as a result.
    pub fn release(&self, workflow_id: &Uuid) -> Vec<Uuid> {
        if let Some(freed) = self.ledger.release(workflow_id) {
            info!(workflow_id = %workflow_id, cpu = freed.cpu, memory = freed.memory, "Resources released");
        }
        self.ledger.admit_waiting()
    }
}

/// Adjacency view of one workflow's tasks.
struct TaskGraph<'a> {
    tasks: HashMap<Uuid, &'a Task>,
    dependents: HashMap<Uuid, Vec<Uuid>>,
}

impl<'a> TaskGraph<'a> {
    fn build(tasks: &'a [Task]) -> AgentflowResult<Self> {
        let mut by_id = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if by_id.insert(task.id, task).is_some() {
                return Err(AgentflowError::Validation(format!("duplicate task id {}", task.id)));
            }
        }
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for task in tasks {
            for dep in &task.dependencies {
                if !by_id.contains_key(dep) {
                    return Err(AgentflowError::Validation(format!(
                        "task {} depends on {dep}, which is not part of the workflow",
                        task.id
                    )));
                }
                dependents.entry(*dep).or_default().push(task.id);
            }
        }
        for children in dependents.values_mut() {
            children.sort();
            children.dedup();
        }
        Ok(Self {
            tasks: by_id,
            dependents,
        })
    }

    fn in_degrees(&self) -> HashMap<Uuid, usize> {
        self.tasks
            .values()
            .map(|t| {
                let unique: HashSet<&Uuid> = t.dependencies.iter().collect();
                (t.id, unique.len())
            })
            .collect()
    }

    /// Kahn's algorithm; ids are taken in sorted order for determinism.
    fn topological_order(&self) -> AgentflowResult<Vec<Uuid>> {
        let mut in_degree = self.in_degrees();
        let mut roots: Vec<Uuid> = in_degree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
        roots.sort();
        let mut queue: VecDeque<Uuid> = roots.into();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for child in self.dependents.get(&id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }

        if order.len() != self.tasks.len() {
            let mut stuck: Vec<Uuid> = in_degree.into_iter().filter(|(_, d)| *d > 0).map(|(id, _)| id).collect();
            stuck.sort();
            return Err(AgentflowError::Validation(format!(
                "dependency cycle among {} task(s), e.g. {}",
                stuck.len(),
                stuck.first().map(Uuid::to_string).unwrap_or_default()
            )));
        }
        Ok(order)
    }

    /// Longest-duration chain, reconstructed from the node of maximum distance.
    fn critical_path(&self, order: &[Uuid], estimates: &HashMap<Uuid, f64>) -> (Vec<Uuid>, f64) {
        let mut distance: HashMap<Uuid, f64> = HashMap::with_capacity(order.len());
        let mut predecessor: HashMap<Uuid, Uuid> = HashMap::new();

        for id in order {
            let Some(task) = self.tasks.get(id) else { continue };
            let mut best: Option<(Uuid, f64)> = None;
            for dep in &task.dependencies {
                let d = distance.get(dep).copied().unwrap_or(0.0);
                if best.map_or(true, |(_, b)| d > b) {
                    best = Some((*dep, d));
                }
            }
            let own = estimates.get(id).copied().unwrap_or(0.0);
            distance.insert(*id, best.map_or(0.0, |(_, d)| d) + own);
            if let Some((dep, _)) = best {
                predecessor.insert(*id, dep);
            }
        }

        let mut end: Option<(Uuid, f64)> = None;
        for id in order {
            let d = distance.get(id).copied().unwrap_or(0.0);
            if end.map_or(true, |(_, best)| d > best) {
                end = Some((*id, d));
            }
        }
        let Some((end, total)) = end else {
            return (Vec::new(), 0.0);
        };

        let mut path = vec![end];
        let mut cursor = end;
        while let Some(prev) = predecessor.get(&cursor) {
            path.push(*prev);
            cursor = *prev;
        }
        path.reverse();
        (path, total)
    }

    /// `level(t) = 0` without dependencies, else `1 + max(level(dep))`.
    fn levels(&self, order: &[Uuid]) -> Vec<Vec<Uuid>> {
        let mut level_of: HashMap<Uuid, usize> = HashMap::with_capacity(order.len());
        let mut levels: Vec<Vec<Uuid>> = Vec::new();
        for id in order {
            let Some(task) = self.tasks.get(id) else { continue };
            let level = task
                .dependencies
                .iter()
                .filter_map(|dep| level_of.get(dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(*id, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(*id);
        }
        for level in &mut levels {
            level.sort();
        }
        levels
    }

    /// Repeatedly take the best dependency-ready task: critical-path members
    /// first, then priority, then id.
    fn optimized_order(&self, on_path: &HashSet<Uuid>) -> Vec<Uuid> {
        let key = |id: &Uuid| -> (bool, TaskPriority, Uuid) {
            let priority = self.tasks.get(id).map(|t| t.priority).unwrap_or_default();
            (!on_path.contains(id), priority, *id)
        };
        let mut in_degree = self.in_degrees();
        let mut ready: BTreeSet<(bool, TaskPriority, Uuid)> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| key(id))
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some((_, _, id)) = ready.pop_first() {
            order.push(id);
            for child in self.dependents.get(&id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(key(child));
                    }
                }
            }
        }
        order
    }
}

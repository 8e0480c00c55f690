use agentflow_core::{AgentflowError, AgentflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Five urgency levels. Lower sorts first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Critical => write!(f, "critical"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Background => write!(f, "background"),
        }
    }
}

/// Status of a task in the execution queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Completed,
    Failed,
    /// Parked because the target agent is unknown or not alive.
    Blocked,
    Paused,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Paused => "paused",
        }
    }
}

/// A unit of work for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Set when the task is submitted as part of a workflow.
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    /// Target agent name.
    pub agent: String,
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Upper bound on a single executor call.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Duration of the last finished attempt.
    pub duration_ms: Option<u64>,
}

impl Task {
    pub fn new(agent: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: None,
            agent: agent.into(),
            action: action.into(),
            parameters: HashMap::new(),
            priority: TaskPriority::Normal,
            dependencies: Vec::new(),
            timeout_ms: None,
            attempts: 0,
            max_attempts: 3,
            status: TaskStatus::Idle,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            duration_ms: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// True when every dependency is reported completed by `is_completed`.
    pub fn dependencies_met(&self, mut is_completed: impl FnMut(&Uuid) -> bool) -> bool {
        self.dependencies.iter().all(|dep| is_completed(dep))
    }

    /// Whether the state machine permits `from -> to` for this task.
    fn allows(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self.status, to) {
            (Idle, Running) => self.has_attempts_left(),
            (Running, Completed) | (Running, Failed) => true,
            (Failed, Idle) => self.has_attempts_left(),
            (Running, Paused) | (Paused, Idle) => true,
            (Idle, Blocked) | (Blocked, Idle) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Move to `to`, or fail without touching the task.
    pub fn transition(&mut self, to: TaskStatus) -> AgentflowResult<()> {
        if !self.allows(to) {
            return Err(AgentflowError::transition(self.status, to));
        }
        self.status = to;
        Ok(())
    }

    /// Idle -> Running. Consumes one attempt.
    pub fn start(&mut self, now: DateTime<Utc>) -> AgentflowResult<()> {
        self.transition(TaskStatus::Running)?;
        self.attempts += 1;
        self.started_at = Some(now);
        self.error = None;
        Ok(())
    }

    pub fn complete(&mut self, result: serde_json::Value, duration: Duration, now: DateTime<Utc>) -> AgentflowResult<()> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        self.duration_ms = Some(duration.as_millis() as u64);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Running -> Failed for one attempt. The caller decides whether to requeue.
    pub fn fail_attempt(&mut self, error: impl Into<String>, duration: Duration, now: DateTime<Utc>) -> AgentflowResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.duration_ms = Some(duration.as_millis() as u64);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Failed -> Idle while attempts remain.
    pub fn requeue(&mut self) -> AgentflowResult<()> {
        self.transition(TaskStatus::Idle)?;
        self.completed_at = None;
        Ok(())
    }

    /// Any non-terminal status -> Failed with `reason`. No-op on terminal tasks.
    pub fn abort(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(reason.into());
        self.completed_at = Some(now);
        true
    }
}

/// Advisory only; the scheduler always follows dependencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    #[default]
    Parallel,
    Conditional,
    Pipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

/// Task counts used to derive a workflow's progress and status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskTally {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskTally {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut tally = TaskTally::default();
        for task in tasks {
            tally.total += 1;
            match task.status {
                TaskStatus::Completed => tally.completed += 1,
                TaskStatus::Failed => tally.failed += 1,
                _ => {}
            }
        }
        tally
    }

    pub fn all_terminal(&self) -> bool {
        self.completed + self.failed == self.total
    }
}

/// An ordered collection of tasks pursuing one goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    /// Free-form phase label, e.g. "research" or "rollout".
    #[serde(default)]
    pub phase: String,
    /// Task ids in submission order.
    #[serde(default)]
    pub task_ids: Vec<Uuid>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub priority: TaskPriority,
    pub max_parallel_tasks: usize,
    pub status: WorkflowStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Critical-path estimate from the planner, in seconds.
    pub estimated_duration_secs: Option<f64>,
    pub actual_duration_secs: Option<f64>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            phase: String::new(),
            task_ids: Vec::new(),
            mode: ExecutionMode::Parallel,
            priority: TaskPriority::Normal,
            max_parallel_tasks: 4,
            status: WorkflowStatus::Pending,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration_secs: None,
            actual_duration_secs: None,
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max;
        self
    }

    fn allows(&self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self.status, to) {
            (Pending, Running) | (Running, Paused) | (Paused, Running) => true,
            (Pending, Paused) | (Paused, Pending) => true,
            (from, Completed | Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn transition(&mut self, to: WorkflowStatus, now: DateTime<Utc>) -> AgentflowResult<()> {
        if !self.allows(to) {
            return Err(AgentflowError::transition(self.status, to));
        }
        if to == WorkflowStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
            if let Some(started) = self.started_at {
                self.actual_duration_secs =
                    Some((now - started).num_milliseconds().max(0) as f64 / 1000.0);
            }
        }
        self.status = to;
        Ok(())
    }

    /// Recompute progress from `tally` and settle the status once every task
    /// is terminal. Returns the new status when it changed.
    pub fn apply_tally(&mut self, tally: &TaskTally, now: DateTime<Utc>) -> Option<WorkflowStatus> {
        self.progress = if tally.total == 0 {
            0.0
        } else {
            tally.completed as f64 / tally.total as f64
        };
        if self.status.is_terminal() || tally.total == 0 || !tally.all_terminal() {
            return None;
        }
        let settled = if tally.failed == 0 {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        self.transition(settled, now).ok().map(|_| settled)
    }
}

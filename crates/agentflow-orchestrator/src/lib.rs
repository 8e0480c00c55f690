//! Workflow planning, admission and dependency-aware scheduling for agents.
//!
//! Workflows are DAGs of tasks targeted at named agents. The planner orders
//! and costs each DAG, admission control reserves global resources for it,
//! and the scheduler dispatches ready tasks through a bounded worker pool to
//! an injected [`AgentExecutor`].
//!
//! # Main types
//!
//! - [`Orchestrator`]: Wires every component and runs the background loops.
//! - [`Scheduler`]: Ready queue, dispatch, retries and workflow lifecycle.
//! - [`ExecutionPlanner`]: Topological order, critical path, levels and estimates.
//! - [`ResourceLedger`]: Global reservations and the admission wait queue.
//! - [`MetricsCollector`]: Read-only snapshots over all of the above.

/// Resource ledger and admission queue.
pub mod admission;
/// Component wiring and background loops.
pub mod engine;
/// The agent executor seam.
pub mod executor;
/// Metrics snapshots and history.
pub mod monitor;
/// DAG analysis and duration estimates.
pub mod planner;
/// Dependency-aware dispatch.
pub mod scheduler;
/// Priority-ordered ready queue.
pub mod task_queue;
/// Tasks, workflows and their state machines.
pub mod types;

pub use admission::{Admission, AdmissionRequest, LedgerSnapshot, ResourceLedger};
pub use engine::{Orchestrator, UTILIZATION_WARNING};
pub use executor::AgentExecutor;
pub use monitor::{AgentLoad, MetricsCollector, MetricsSnapshot};
pub use planner::{ExecutionPlan, ExecutionPlanner, CHECKPOINT_STRIDE};
pub use scheduler::{Scheduler, SchedulerStats};
pub use task_queue::{ReadyEntry, ReadyQueue, Verdict};
pub use types::{
    ExecutionMode, Task, TaskPriority, TaskStatus, TaskTally, Workflow, WorkflowStatus,
};

//! Resource-aware admission control.
//!
//! A workflow may start only while the sum of reserved estimates stays within
//! the global limits and fewer than `max_parallel_workflows` hold a
//! reservation. Workflows that do not fit wait in a min-heap ordered by
//! (priority, estimated duration, submission time) and are admitted strictly
//! from the head of that heap, so a large workflow is never overtaken
//! indefinitely by smaller ones. An estimate larger than the limits
//! themselves can never be admitted; it stays queued until cancelled and is
//! stepped over so it does not hold up the rest of the queue.

use crate::types::TaskPriority;
use agentflow_core::{AgentflowError, AgentflowResult, ResourceVector};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use uuid::Uuid;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Admission {
    Admitted,
    /// Waiting behind `ahead` other workflows.
    Queued { ahead: usize },
}

/// A workflow waiting for capacity.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub workflow_id: Uuid,
    pub priority: TaskPriority,
    pub estimated_seconds: f64,
    pub submitted_at: DateTime<Utc>,
    pub resources: ResourceVector,
}

#[derive(Debug)]
struct Waiting {
    request: AdmissionRequest,
    seq: u64,
}

impl Ord for Waiting {
    fn cmp(&self, other: &Self) -> Ordering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| {
                self.request
                    .estimated_seconds
                    .total_cmp(&other.request.estimated_seconds)
            })
            .then_with(|| self.request.submitted_at.cmp(&other.request.submitted_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiting {}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub limits: ResourceVector,
    pub allocated: ResourceVector,
    pub available: ResourceVector,
    pub utilization: f64,
    pub reserved_workflows: usize,
    pub waiting_workflows: usize,
    /// Waiting workflows whose estimate exceeds the limits.
    pub unfittable_workflows: usize,
    pub max_parallel_workflows: usize,
}

struct LedgerState {
    allocated: ResourceVector,
    reservations: HashMap<Uuid, ResourceVector>,
    waiting: BinaryHeap<Reverse<Waiting>>,
    next_seq: u64,
}

/// Global resource reservations plus the admission wait queue.
pub struct ResourceLedger {
    limits: ResourceVector,
    max_parallel_workflows: usize,
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    pub fn new(limits: ResourceVector, max_parallel_workflows: usize) -> Self {
        Self {
            limits,
            max_parallel_workflows,
            state: Mutex::new(LedgerState {
                allocated: ResourceVector::zero(),
                reservations: HashMap::new(),
                waiting: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn limits(&self) -> ResourceVector {
        self.limits
    }

    /// Whether `resources` could ever be admitted, ignoring current load.
    pub fn can_ever_fit(&self, resources: &ResourceVector) -> bool {
        resources.fits_within(&self.limits)
    }

    /// Ok when `resources` fit the capacity that is free right now.
    pub fn check_fits(&self, resources: &ResourceVector) -> AgentflowResult<()> {
        let state = self.state.lock();
        if (state.allocated + *resources).fits_within(&self.limits) {
            return Ok(());
        }
        let available = self.limits.saturating_sub(&state.allocated);
        Err(AgentflowError::ResourceExhausted(format!(
            "needs {resources:?}, only {available:?} free"
        )))
    }

    /// Queue the request and admit from the head of the queue.
    ///
    /// Returns every workflow admitted by this call (the caller's own one
    /// included when it fit) together with the caller's outcome.
    pub fn try_admit(&self, request: AdmissionRequest) -> (Admission, Vec<Uuid>) {
        let workflow_id = request.workflow_id;
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.waiting.push(Reverse(Waiting { request, seq }));
        let admitted = self.drain_head(&mut state);
        let outcome = if admitted.contains(&workflow_id) {
            Admission::Admitted
        } else {
            let ahead = state
                .waiting
                .iter()
                .find(|Reverse(w)| w.seq == seq)
                .map(|Reverse(ours)| {
                    state
                        .waiting
                        .iter()
                        .filter(|Reverse(w)| w < ours)
                        .count()
                })
                .unwrap_or(0);
            Admission::Queued { ahead }
        };
        (outcome, admitted)
    }

    /// Retry the wait queue. Returns the workflows admitted now.
    pub fn admit_waiting(&self) -> Vec<Uuid> {
        let mut state = self.state.lock();
        self.drain_head(&mut state)
    }

    fn drain_head(&self, state: &mut LedgerState) -> Vec<Uuid> {
        let mut admitted = Vec::new();
        let mut unfittable = Vec::new();
        while let Some(Reverse(head)) = state.waiting.peek() {
            let needed = head.request.resources;
            if !needed.fits_within(&self.limits) {
                unfittable.extend(state.waiting.pop());
                continue;
            }
            let fits = (state.allocated + needed).fits_within(&self.limits);
            if !fits || state.reservations.len() >= self.max_parallel_workflows {
                break;
            }
            let Some(Reverse(head)) = state.waiting.pop() else {
                break;
            };
            let id = head.request.workflow_id;
            state.allocated += needed;
            state.reservations.insert(id, needed);
            admitted.push(id);
        }
        state.waiting.extend(unfittable);
        admitted
    }

    /// Return a workflow's reservation to the pool.
    pub fn release(&self, workflow_id: &Uuid) -> Option<ResourceVector> {
        let mut state = self.state.lock();
        let released = state.reservations.remove(workflow_id)?;
        state.allocated = state.allocated.saturating_sub(&released);
        if state.reservations.is_empty() {
            // clear float drift
            state.allocated = ResourceVector::zero();
        }
        Some(released)
    }

    /// Remove a workflow from the wait queue. Returns whether it was queued.
    pub fn cancel_waiting(&self, workflow_id: &Uuid) -> bool {
        let mut state = self.state.lock();
        let before = state.waiting.len();
        state
            .waiting
            .retain(|Reverse(w)| w.request.workflow_id != *workflow_id);
        state.waiting.len() != before
    }

    pub fn is_reserved(&self, workflow_id: &Uuid) -> bool {
        self.state.lock().reservations.contains_key(workflow_id)
    }

    pub fn is_waiting(&self, workflow_id: &Uuid) -> bool {
        self.state
            .lock()
            .waiting
            .iter()
            .any(|Reverse(w)| w.request.workflow_id == *workflow_id)
    }

    pub fn allocated(&self) -> ResourceVector {
        self.state.lock().allocated
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            limits: self.limits,
            allocated: state.allocated,
            available: self.limits.saturating_sub(&state.allocated),
            utilization: state.allocated.utilization(&self.limits),
            reserved_workflows: state.reservations.len(),
            waiting_workflows: state.waiting.len(),
            unfittable_workflows: state
                .waiting
                .iter()
                .filter(|Reverse(w)| !w.request.resources.fits_within(&self.limits))
                .count(),
            max_parallel_workflows: self.max_parallel_workflows,
        }
    }
}

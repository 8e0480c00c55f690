use crate::types::{Task, TaskPriority};
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use uuid::Uuid;

/// A ready task as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEntry {
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub task_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub agent: String,
}

impl ReadyEntry {
    pub fn from_task(task: &Task) -> Self {
        Self {
            priority: task.priority,
            created_at: task.created_at,
            task_id: task.id,
            workflow_id: task.workflow_id,
            agent: task.agent.clone(),
        }
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What the dispatcher wants done with a popped entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Dispatch it.
    Take,
    /// Not now (agent or workflow at capacity); keep it queued.
    Defer,
    /// Stale entry; drop it.
    Discard,
}

/// Priority queue of tasks whose dependencies are satisfied.
///
/// Ordered by (priority, creation time, id) so dispatch is deterministic.
/// A task id is held at most once.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<Reverse<ReadyEntry>>,
    queued: HashSet<Uuid>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a ready task. Returns `false` if it is already queued.
    pub fn push(&mut self, task: &Task) -> bool {
        if !self.queued.insert(task.id) {
            return false;
        }
        self.heap.push(Reverse(ReadyEntry::from_task(task)));
        true
    }

    /// Pop the most urgent entry the `verdict` accepts.
    ///
    /// Deferred entries are put back afterwards; discarded ones are dropped.
    pub fn pop_dispatchable(&mut self, mut verdict: impl FnMut(&ReadyEntry) -> Verdict) -> Option<ReadyEntry> {
        let mut deferred = Vec::new();
        let mut taken = None;
        while let Some(Reverse(entry)) = self.heap.pop() {
            match verdict(&entry) {
                Verdict::Take => {
                    self.queued.remove(&entry.task_id);
                    taken = Some(entry);
                    break;
                }
                Verdict::Defer => deferred.push(entry),
                Verdict::Discard => {
                    self.queued.remove(&entry.task_id);
                }
            }
        }
        self.heap.extend(deferred.into_iter().map(Reverse));
        taken
    }

    /// Drop every entry for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&ReadyEntry) -> bool) {
        let queued = &mut self.queued;
        self.heap.retain(|Reverse(entry)| {
            let kept = keep(entry);
            if !kept {
                queued.remove(&entry.task_id);
            }
            kept
        });
    }

    pub fn contains(&self, task_id: &Uuid) -> bool {
        self.queued.contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Entries in dispatch order.
    pub fn snapshot(&self) -> Vec<ReadyEntry> {
        let mut entries: Vec<ReadyEntry> = self.heap.iter().map(|Reverse(e)| e.clone()).collect();
        entries.sort();
        entries
    }
}

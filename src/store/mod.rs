// src/store/mod.rs

//! Durable store collaborator.
//!
//! The scheduler persists every task and job transition through a
//! [`TaskStore`] before treating it as effective. The store is the only
//! durability mechanism: a live graph can be rebuilt from it after a restart
//! (see [`crate::engine::recovery`]).
//!
//! - [`memory`] keeps records in process memory.
//! - [`file`] keeps them in a JSON document written through the
//!   [`crate::fs::FileSystem`] seam.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{FailurePolicy, Job, JobState, Task, TaskGuard, TaskGraph, TaskState, TaskStatus};
use crate::errors::Result;
use crate::types::{JobId, LockObject, TaskId};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Persisted form of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub job_id: JobId,
    pub name: String,
    /// Work kind, resolved through the work registry on restart.
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub state: TaskState,
    pub status: TaskStatus,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dependency_order: u32,
    pub predecessor_ids: Vec<TaskId>,
    /// Dependency orders of the predecessors, aligned with `predecessor_ids`.
    pub predecessor_orders: Vec<u32>,
    pub guard: TaskGuard,
    pub objects: BTreeSet<LockObject>,
    pub fail_reason: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub children: Vec<TaskId>,
    #[serde(default)]
    pub parent_task: Option<TaskId>,
    /// Position in the graph's insertion order.
    pub sequence: usize,
}

impl TaskRecord {
    pub fn from_task(job_id: JobId, task: &Task, graph: &TaskGraph, sequence: usize) -> Self {
        let predecessor_orders = task
            .predecessors()
            .iter()
            .map(|p| graph.get(*p).map_or(0, |t| t.dependency_order()))
            .collect();

        Self {
            id: task.id(),
            job_id,
            name: task.name().to_string(),
            kind: task.kind().kind().to_string(),
            params: task.kind().params(),
            state: task.state(),
            status: task.status(),
            queued_at: task.queued_at(),
            started_at: task.started_at(),
            completed_at: task.completed_at(),
            dependency_order: task.dependency_order(),
            predecessor_ids: task.predecessors().to_vec(),
            predecessor_orders,
            guard: task.guard(),
            objects: task.objects().clone(),
            fail_reason: task.fail_reason().map(str::to_string),
            failure_policy: task.failure_policy(),
            children: task.children().to_vec(),
            parent_task: task.parent_task(),
            sequence,
        }
    }
}

/// Persisted form of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reasons: Vec<String>,
}

impl JobRecord {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id(),
            name: job.name().to_string(),
            state: job.state(),
            queued_at: job.queued_at(),
            started_at: job.started_at(),
            completed_at: job.completed_at(),
            failure_reasons: job.failure_reasons().to_vec(),
        }
    }
}

/// One row of the failure histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailureRecord {
    pub reason: String,
    pub count: u64,
}

/// Durable store for task and job records.
///
/// Every successful write must be visible to the next read.
pub trait TaskStore: Send + Sync {
    fn save_task(&self, record: &TaskRecord) -> Result<()>;

    fn save_job(&self, record: &JobRecord) -> Result<()>;

    fn find_job(&self, id: JobId) -> Result<Option<JobRecord>>;

    fn find_jobs(&self) -> Result<Vec<JobRecord>>;

    /// Tasks of a job ordered by dependency order, then insertion order.
    fn find_tasks_by_job_id(&self, id: JobId) -> Result<Vec<TaskRecord>>;

    /// Every task whose state is not `Completed`.
    fn find_uncompleted_tasks(&self) -> Result<Vec<TaskRecord>>;

    /// Distinct fail reasons with their occurrence count, for tasks that
    /// finished after `since` (all time if `None`).
    fn find_failures_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<TaskFailureRecord>>;
}

/// Tasks written by an expansion whose parent record never listed them.
///
/// Children are persisted before their parent, so a crash or a failed write
/// in between leaves such records behind. They are not part of the job.
pub fn unacknowledged_tasks(records: &[TaskRecord]) -> HashSet<TaskId> {
    let by_id: HashMap<TaskId, &TaskRecord> = records.iter().map(|r| (r.id, r)).collect();
    let mut ordered: Vec<&TaskRecord> = records.iter().collect();
    // Parents precede their children in insertion order.
    ordered.sort_by_key(|r| r.sequence);

    let mut dropped = HashSet::new();
    for rec in ordered {
        let Some(parent) = rec.parent_task else {
            continue;
        };
        let acknowledged = by_id
            .get(&parent)
            .is_some_and(|p| p.children.contains(&rec.id));
        if !acknowledged || dropped.contains(&parent) {
            dropped.insert(rec.id);
        }
    }
    dropped
}

/// Record set shared by the store implementations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    jobs: BTreeMap<JobId, JobRecord>,
    #[serde(default)]
    tasks: HashMap<TaskId, TaskRecord>,
}

impl StoreState {
    pub(crate) fn put_task(&mut self, record: &TaskRecord) -> Option<TaskRecord> {
        self.tasks.insert(record.id, record.clone())
    }

    pub(crate) fn put_job(&mut self, record: &JobRecord) -> Option<JobRecord> {
        self.jobs.insert(record.id, record.clone())
    }

    /// Undo a `put_task`, given what it returned.
    pub(crate) fn restore_task(&mut self, id: TaskId, previous: Option<TaskRecord>) {
        match previous {
            Some(prev) => {
                self.tasks.insert(id, prev);
            }
            None => {
                self.tasks.remove(&id);
            }
        }
    }

    pub(crate) fn restore_job(&mut self, id: JobId, previous: Option<JobRecord>) {
        match previous {
            Some(prev) => {
                self.jobs.insert(id, prev);
            }
            None => {
                self.jobs.remove(&id);
            }
        }
    }

    pub(crate) fn job(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.get(&id).cloned()
    }

    pub(crate) fn jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.queued_at);
        jobs
    }

    pub(crate) fn tasks_by_job(&self, id: JobId) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .values()
            .filter(|t| t.job_id == id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.dependency_order, t.sequence));
        tasks
    }

    pub(crate) fn uncompleted_tasks(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .values()
            .filter(|t| t.state != TaskState::Completed)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.job_id, t.dependency_order, t.sequence));
        tasks
    }

    pub(crate) fn failures_since(&self, since: Option<DateTime<Utc>>) -> Vec<TaskFailureRecord> {
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for task in self.tasks.values() {
            let Some(reason) = task.fail_reason.as_deref() else {
                continue;
            };
            let recent = match (since, task.completed_at) {
                (None, _) => true,
                (Some(from), Some(done)) => done > from,
                (Some(_), None) => false,
            };
            if recent {
                *counts.entry(reason).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .map(|(reason, count)| TaskFailureRecord {
                reason: reason.to_string(),
                count,
            })
            .collect()
    }
}

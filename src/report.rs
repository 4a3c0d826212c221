// src/report.rs

//! Serializable projection of jobs and their task trees.
//!
//! Built from store records only, so it shows exactly what is durable.
//! Spliced tasks are nested under the meta-task that produced them.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dag::{JobState, TaskGuard, TaskState, TaskStatus};
use crate::errors::{JobgraphError, Result};
use crate::store::{unacknowledged_tasks, JobRecord, TaskRecord, TaskStore};
use crate::types::{JobId, LockObject, TaskId};

#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub parent_job_id: JobId,
    pub name: String,
    pub kind: String,
    pub status: TaskStatus,
    pub state: TaskState,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dependency_order: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    /// Dependency orders of the predecessors.
    pub predecessors: Vec<u32>,
    pub predecessor_ids: Vec<TaskId>,
    pub guard: TaskGuard,
    pub objects: Vec<LockObject>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reasons: Vec<String>,
    /// Tasks of the submitted graph; expansion output is under `children`.
    pub tasks: Vec<TaskView>,
}

impl JobView {
    /// Number of tasks including every nested child.
    pub fn task_count(&self) -> usize {
        fn count(views: &[TaskView]) -> usize {
            views.iter().map(|v| 1 + count(&v.children)).sum()
        }
        count(&self.tasks)
    }

    /// Depth-first search for a task by name.
    pub fn find(&self, name: &str) -> Option<&TaskView> {
        fn walk<'a>(views: &'a [TaskView], name: &str) -> Option<&'a TaskView> {
            views.iter().find_map(|v| {
                if v.name == name {
                    Some(v)
                } else {
                    walk(&v.children, name)
                }
            })
        }
        walk(&self.tasks, name)
    }
}

pub fn project_job(store: &dyn TaskStore, id: JobId) -> Result<JobView> {
    let record = store
        .find_job(id)?
        .ok_or_else(|| JobgraphError::JobNotFound(id.to_string()))?;
    let tasks = store.find_tasks_by_job_id(id)?;
    Ok(build_view(record, tasks))
}

/// Every job in the store, oldest first.
pub fn project_jobs(store: &dyn TaskStore) -> Result<Vec<JobView>> {
    store
        .find_jobs()?
        .into_iter()
        .map(|record| {
            let tasks = store.find_tasks_by_job_id(record.id)?;
            Ok(build_view(record, tasks))
        })
        .collect()
}

fn build_view(job: JobRecord, records: Vec<TaskRecord>) -> JobView {
    let dropped = unacknowledged_tasks(&records);
    let top_level: Vec<TaskId> = records
        .iter()
        .filter(|r| r.parent_task.is_none())
        .map(|r| r.id)
        .collect();
    let mut by_id: HashMap<TaskId, TaskRecord> = records
        .into_iter()
        .filter(|r| !dropped.contains(&r.id))
        .map(|r| (r.id, r))
        .collect();

    let mut visited = HashSet::new();
    let tasks = top_level
        .into_iter()
        .filter_map(|id| task_view(id, &mut by_id, &mut visited))
        .collect();

    JobView {
        id: job.id,
        name: job.name,
        state: job.state,
        queued_at: job.queued_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        failure_reasons: job.failure_reasons,
        tasks,
    }
}

fn task_view(
    id: TaskId,
    records: &mut HashMap<TaskId, TaskRecord>,
    visited: &mut HashSet<TaskId>,
) -> Option<TaskView> {
    if !visited.insert(id) {
        return None;
    }
    let rec = records.remove(&id)?;
    let children = rec
        .children
        .iter()
        .filter_map(|c| task_view(*c, records, visited))
        .collect();

    Some(TaskView {
        id: rec.id,
        parent_job_id: rec.job_id,
        name: rec.name,
        kind: rec.kind,
        status: rec.status,
        state: rec.state,
        queued_at: rec.queued_at,
        started_at: rec.started_at,
        completed_at: rec.completed_at,
        dependency_order: rec.dependency_order,
        fail_reason: rec.fail_reason,
        predecessors: rec.predecessor_orders,
        predecessor_ids: rec.predecessor_ids,
        guard: rec.guard,
        objects: rec.objects.into_iter().collect(),
        children,
    })
}

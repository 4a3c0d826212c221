// src/engine/recovery.rs

//! Rebuild live jobs from the store after a restart.
//!
//! - Jobs are discovered from the uncompleted task records, plus any
//!   non-terminal job whose tasks all completed before its own record was
//!   updated.
//! - Work functions are rebuilt through the [`WorkRegistry`].
//! - Tasks found `Running` are put back in the queue: their work may or may
//!   not have happened, so work functions must be safe to re-run.
//! - `Completed` tasks are restored as such and never run again.
//! - Children written by an expansion whose parent record was never updated
//!   are dropped; the parent re-expands when it runs again.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::dag::{Job, Task, TaskGraph, TaskState};
use crate::engine::core::persist_task;
use crate::errors::Result;
use crate::registry::WorkRegistry;
use crate::store::{unacknowledged_tasks, JobRecord, TaskRecord, TaskStore};
use crate::types::{JobId, TaskId};

/// Rebuild every non-terminal job in the store, oldest first.
pub fn recover(store: &dyn TaskStore, registry: &WorkRegistry) -> Result<Vec<Job>> {
    let mut job_ids: BTreeSet<JobId> = store
        .find_uncompleted_tasks()?
        .into_iter()
        .map(|t| t.job_id)
        .collect();
    job_ids.extend(
        store
            .find_jobs()?
            .into_iter()
            .filter(|j| !j.state.is_terminal())
            .map(|j| j.id),
    );

    let mut jobs = Vec::new();
    for id in job_ids {
        let Some(record) = store.find_job(id)? else {
            warn!(job = %id, "task records reference a job that was never persisted; skipping");
            continue;
        };
        if record.state.is_terminal() {
            debug!(job = %id, state = %record.state, "job already terminal; skipping");
            continue;
        }
        jobs.push(rebuild_job(store, registry, &record)?);
    }

    jobs.sort_by_key(Job::queued_at);
    info!(jobs = jobs.len(), "recovered unfinished jobs");
    Ok(jobs)
}

fn rebuild_job(store: &dyn TaskStore, registry: &WorkRegistry, record: &JobRecord) -> Result<Job> {
    let mut records = store.find_tasks_by_job_id(record.id)?;
    records.sort_by_key(|t| t.sequence);

    let orphans = unacknowledged_tasks(&records);
    if !orphans.is_empty() {
        warn!(job = %record.id, dropped = orphans.len(), "dropping unacknowledged expansion output");
    }
    let parent_of: HashMap<TaskId, TaskId> = records
        .iter()
        .filter(|r| orphans.contains(&r.id))
        .filter_map(|r| r.parent_task.map(|p| (r.id, p)))
        .collect();

    let mut graph = TaskGraph::new();
    let mut requeued = Vec::new();

    for rec in records.iter().filter(|r| !orphans.contains(&r.id)) {
        let mut task = rebuild_task(registry, rec, &parent_of)?;
        if task.state() == TaskState::Running {
            debug!(job = %record.id, task = task.name(), "requeueing task found running");
            task.requeue();
            requeued.push(task.id());
        }
        graph.insert_restored(task);
    }
    graph.finish_restore()?;

    let mut job = Job::new(record.name.clone(), graph).with_id(record.id);
    job.restore(record.queued_at, record.started_at, record.failure_reasons.clone());

    for id in requeued {
        persist_task(store, &job, id)?;
    }

    info!(
        job = %job.id(),
        name = job.name(),
        tasks = job.graph().len(),
        "rebuilt job from store"
    );
    Ok(job)
}

fn rebuild_task(
    registry: &WorkRegistry,
    rec: &TaskRecord,
    parent_of: &HashMap<TaskId, TaskId>,
) -> Result<Task> {
    let kind = registry.build(&rec.kind, &rec.params)?;
    let mut task = Task::new(rec.name.clone(), kind)
        .with_id(rec.id)
        .with_guard(rec.guard)
        .with_objects(rec.objects.iter().cloned())
        .with_failure_policy(rec.failure_policy);

    let mut predecessors: Vec<TaskId> = Vec::with_capacity(rec.predecessor_ids.len());
    for pred in &rec.predecessor_ids {
        let resolved = resolve_orphan(*pred, parent_of);
        if !predecessors.contains(&resolved) {
            predecessors.push(resolved);
        }
    }

    task.predecessors = predecessors;
    task.dependency_order = rec.dependency_order;
    task.children = rec.children.clone();
    task.parent_task = rec.parent_task;
    task.restore(
        rec.state,
        rec.status,
        [rec.queued_at, rec.started_at, rec.completed_at],
        rec.fail_reason.clone(),
    );
    Ok(task)
}

/// Map a dropped task to its nearest surviving ancestor.
fn resolve_orphan(mut id: TaskId, parent_of: &HashMap<TaskId, TaskId>) -> TaskId {
    while let Some(parent) = parent_of.get(&id) {
        id = *parent;
    }
    id
}

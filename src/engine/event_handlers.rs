// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.
//!
//! Every handler ends with the same scheduling pass (see [`finish_step`]):
//! settle expanding meta-tasks, release locks nobody needs any more,
//! dispatch admissible tasks, resolve terminal jobs.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::dag::{FailurePolicy, Job, JobState, Task, TaskContext, TaskGraph, TaskState};
use crate::engine::core::{persist_job, persist_task, EngineState};
use crate::engine::{ScheduledTask, TaskOutcome};
use crate::lock::LockOutcome;
use crate::store::JobRecord;
use crate::types::{JobId, LockObject, TaskId};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Send these tasks to the executor.
    DispatchTasks(Vec<ScheduledTask>),
    /// A job reached a terminal state.
    JobFinished { job: JobId, state: JobState },
    /// A submitted job could not be persisted and was dropped.
    JobRejected { job: JobId, reason: String },
    /// Deliver a `Tick` after the given delay to re-attempt rolled back
    /// transitions.
    ScheduleRetry(Duration),
    /// Request that the process exits (every job terminal, nothing running).
    RequestExit,
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

/// Handle a newly submitted (or recovered) job.
///
/// The job and all of its tasks are persisted before anything runs. A job
/// that cannot be persisted is rejected and never scheduled.
pub fn handle_job_submitted(state: &mut EngineState, mut job: Job) -> CoreStep {
    let mut commands = Vec::new();

    if state.job_index(job.id()).is_some() {
        warn!(job = %job.id(), "job already submitted; ignoring duplicate");
        return finish_step(state, commands);
    }

    let now = Utc::now();
    let ids = job.graph().ids().to_vec();
    for id in &ids {
        if let Some(task) = job.graph_mut().get_mut(*id) {
            task.mark_queued(now);
        }
    }

    let persisted = persist_job(state.store.as_ref(), &job).and_then(|()| {
        ids.iter()
            .try_for_each(|id| persist_task(state.store.as_ref(), &job, *id))
    });
    if let Err(err) = persisted {
        error!(job = %job.id(), name = job.name(), error = %err, "failed to persist submitted job");
        commands.push(CoreCommand::JobRejected {
            job: job.id(),
            reason: err.to_string(),
        });
        return finish_step(state, commands);
    }

    info!(
        job = %job.id(),
        name = job.name(),
        tasks = job.graph().len(),
        "job submitted"
    );
    state.jobs.push(job);

    finish_step(state, commands)
}

/// Handle a worker report for one task.
pub fn handle_task_finished(
    state: &mut EngineState,
    job_id: JobId,
    task_id: TaskId,
    outcome: TaskOutcome,
) -> CoreStep {
    let commands = Vec::new();

    if !state.in_flight.remove(&(job_id, task_id)) {
        debug!(job = %job_id, task = %task_id, "report for a task that was not in flight");
    }

    let Some(idx) = state.job_index(job_id) else {
        warn!(job = %job_id, task = %task_id, "report for unknown job; ignoring");
        return finish_step(state, commands);
    };

    let running = state.jobs[idx]
        .graph()
        .get(task_id)
        .is_some_and(|t| t.state() == TaskState::Running);
    if state.jobs[idx].is_terminal() || !running {
        debug!(
            job = %job_id,
            task = %task_id,
            "late report for a task that is no longer running; ignoring"
        );
        return finish_step(state, commands);
    }

    apply_outcome(state, idx, task_id, outcome);
    finish_step(state, commands)
}

/// Handle an explicit cancellation request.
pub fn handle_cancel_job(state: &mut EngineState, job_id: JobId, reason: &str) -> CoreStep {
    match state.job_index(job_id) {
        Some(idx) if !state.jobs[idx].is_terminal() => {
            info!(job = %job_id, reason, "cancelling job");
            state.jobs[idx].request_cancel(reason);
        }
        Some(_) => debug!(job = %job_id, "job already terminal; nothing to cancel"),
        None => warn!(job = %job_id, "cancel requested for unknown job"),
    }
    finish_step(state, Vec::new())
}

/// Re-apply outcomes the store rejected, then run the scheduling pass.
pub fn handle_tick(state: &mut EngineState) -> CoreStep {
    for (job_id, task_id, outcome) in std::mem::take(&mut state.pending_outcomes) {
        state.in_flight.remove(&(job_id, task_id));
        let Some(idx) = state.job_index(job_id) else {
            continue;
        };
        let running = state.jobs[idx]
            .graph()
            .get(task_id)
            .is_some_and(|t| t.state() == TaskState::Running);
        if state.jobs[idx].is_terminal() || !running {
            debug!(job = %job_id, task = %task_id, "dropping pending outcome of a settled task");
            continue;
        }
        apply_outcome(state, idx, task_id, outcome);
    }
    finish_step(state, Vec::new())
}

/// Stop the loop. In-flight work is signalled to stop, but nothing is marked
/// failed: the durable `Running` records are requeued on the next start.
pub fn handle_shutdown(state: &mut EngineState) -> CoreStep {
    for job in state.jobs.iter().filter(|j| !j.is_terminal()) {
        job.cancel_token().cancel();
    }
    info!(in_flight = state.in_flight.len(), "shutdown requested");
    CoreStep {
        commands: Vec::new(),
        keep_running: false,
    }
}

/// Apply a worker outcome and persist everything it touched.
///
/// If any write fails, the job's graph is restored to its state before the
/// report. The task stays `Running` and in flight, and the outcome is kept to
/// be re-applied on the next `Tick`: its work is never run a second time.
fn apply_outcome(state: &mut EngineState, idx: usize, task_id: TaskId, outcome: TaskOutcome) {
    let store = state.store.clone();
    let job = &mut state.jobs[idx];
    let snapshot = job.graph().clone();
    let retained = outcome.clone();
    let now = Utc::now();

    let touched = match outcome {
        TaskOutcome::Completed => {
            if let Some(task) = job.graph_mut().get_mut(task_id) {
                task.mark_completed(now);
            }
            vec![task_id]
        }
        TaskOutcome::Failed(reason) => {
            if let Some(task) = job.graph_mut().get_mut(task_id) {
                task.mark_failed(now, reason);
            }
            vec![task_id]
        }
        TaskOutcome::Expanded(subgraph) => expand(job, task_id, subgraph),
    };

    let persisted = touched
        .iter()
        .try_for_each(|id| persist_task(store.as_ref(), job, *id));

    if let Err(err) = persisted {
        error!(
            job = %job.id(),
            task = %task_id,
            error = %err,
            "failed to persist task outcome; keeping it for retry"
        );
        *job.graph_mut() = snapshot;
        let job_id = job.id();
        state.in_flight.insert((job_id, task_id));
        state.pending_outcomes.push((job_id, task_id, retained));
        state.retry_pending = true;
        return;
    }

    let Some(task) = job.graph().get(task_id) else {
        return;
    };
    match task.state() {
        TaskState::Completed => {
            info!(job = %job.id(), task = task.name(), "task completed");
        }
        TaskState::Expanding => {
            info!(
                job = %job.id(),
                task = task.name(),
                children = task.children().len(),
                "task expanded"
            );
        }
        TaskState::Failed => {
            let reason = task.fail_reason().unwrap_or_default().to_string();
            let name = task.name().to_string();
            let abort = task.failure_policy() == FailurePolicy::AbortJob;
            warn!(job = %job.id(), task = %name, reason = %reason, "task failed");
            job.record_failure(&reason);
            if abort {
                job.request_cancel(&format!("task '{name}' failed: {reason}"));
            }
            if let Err(err) = persist_job(store.as_ref(), job) {
                warn!(job = %job.id(), error = %err, "failed to persist job failure reasons");
            }
        }
        TaskState::Queued | TaskState::Running => {}
    }
}

/// Move a meta-task to `Expanding` and splice its subgraph in.
///
/// Returns the ids to persist: children first, then the redirected
/// successors and any task whose dependency order (or a predecessor's)
/// moved, then the meta-task itself, so a durable parent never lists a child
/// that was not written.
fn expand(job: &mut Job, task_id: TaskId, subgraph: TaskGraph) -> Vec<TaskId> {
    let now = Utc::now();
    let graph = job.graph_mut();

    if subgraph.is_empty() {
        if let Some(task) = graph.get_mut(task_id) {
            task.mark_completed(now);
        }
        return vec![task_id];
    }

    if let Some(task) = graph.get_mut(task_id) {
        task.mark_expanding();
    }
    let redirected = graph.dependents_of(task_id).to_vec();

    match graph.splice(task_id, subgraph) {
        Ok(splice) => {
            for child in &splice.children {
                if let Some(task) = graph.get_mut(*child) {
                    task.mark_queued(now);
                }
            }
            // Records also carry their predecessors' orders.
            let reordered_dependents: Vec<TaskId> = splice
                .reordered
                .iter()
                .flat_map(|id| graph.dependents_of(*id).iter().copied())
                .collect();
            let mut touched = splice.children;
            for id in redirected
                .into_iter()
                .chain(splice.reordered)
                .chain(reordered_dependents)
            {
                if id != task_id && !touched.contains(&id) {
                    touched.push(id);
                }
            }
            touched.push(task_id);
            touched
        }
        Err(err) => {
            if let Some(task) = graph.get_mut(task_id) {
                task.mark_failed(now, format!("expansion rejected: {err}"));
            }
            vec![task_id]
        }
    }
}

/// The scheduling pass every handler ends with.
///
/// A job that turns terminal releases all of its locks, which may unblock a
/// job that was skipped earlier in the pass, so the pass repeats until no
/// further job finishes.
fn finish_step(state: &mut EngineState, mut commands: Vec<CoreCommand>) -> CoreStep {
    let mut scheduled = Vec::new();
    loop {
        apply_cancellations(state);
        settle_expanding(state);
        release_unneeded_locks(state);
        scheduled.extend(dispatch_ready(state));

        if !resolve_finished_jobs(state, &mut commands) {
            break;
        }
    }
    if !scheduled.is_empty() {
        commands.push(CoreCommand::DispatchTasks(scheduled));
    }

    if std::mem::take(&mut state.retry_pending) {
        commands.push(CoreCommand::ScheduleRetry(state.options.retry_delay));
    }

    let mut keep_running = true;
    if state.options.exit_when_idle && state.is_idle() {
        keep_running = false;
        commands.push(CoreCommand::RequestExit);
    }

    CoreStep {
        commands,
        keep_running,
    }
}

/// Fail every non-terminal task of cancelled jobs. Re-applied on every pass
/// until all the writes went through.
fn apply_cancellations(state: &mut EngineState) {
    let store = state.store.clone();
    let now = Utc::now();

    for job in state.jobs.iter_mut().filter(|j| !j.is_terminal()) {
        let Some(reason) = job.cancel_reason().map(str::to_string) else {
            continue;
        };
        let pending: Vec<TaskId> = job
            .graph()
            .iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id())
            .collect();

        for id in pending {
            let Some(before) = job.graph().get(id).cloned() else {
                continue;
            };
            if let Some(task) = job.graph_mut().get_mut(id) {
                task.mark_aborted(now, reason.clone());
            }
            if let Err(err) = persist_task(store.as_ref(), job, id) {
                warn!(job = %job.id(), task = %id, error = %err, "failed to persist cancellation");
                if let Some(task) = job.graph_mut().get_mut(id) {
                    *task = before;
                }
                state.retry_pending = true;
            }
        }
        job.record_failure(&reason);
    }
}

/// Complete or fail expanding meta-tasks from their children's outcomes.
///
/// A meta-task fails as soon as one child fails, and completes once every
/// child completed. Nested expansions settle bottom-up within one pass.
fn settle_expanding(state: &mut EngineState) {
    let store = state.store.clone();

    for job in state.jobs.iter_mut().filter(|j| !j.is_terminal()) {
        loop {
            let mut changed = false;
            let expanding: Vec<TaskId> = job
                .graph()
                .iter()
                .filter(|t| t.state() == TaskState::Expanding)
                .map(|t| t.id())
                .collect();

            for id in expanding {
                let Some(verdict) = expansion_verdict(job.graph(), id) else {
                    continue;
                };
                let Some(before) = job.graph().get(id).cloned() else {
                    continue;
                };
                let now = Utc::now();
                let task = match job.graph_mut().get_mut(id) {
                    Some(task) => task,
                    None => continue,
                };
                match &verdict {
                    Ok(()) => task.mark_completed(now),
                    Err(reason) => task.mark_failed(now, reason.clone()),
                }

                if let Err(err) = persist_task(store.as_ref(), job, id) {
                    warn!(job = %job.id(), task = %id, error = %err, "failed to persist expansion outcome");
                    if let Some(task) = job.graph_mut().get_mut(id) {
                        *task = before;
                    }
                    state.retry_pending = true;
                    continue;
                }

                changed = true;
                match verdict {
                    Ok(()) => debug!(job = %job.id(), task = %id, "expansion completed"),
                    Err(reason) => {
                        warn!(job = %job.id(), task = %id, reason = %reason, "expansion failed");
                        job.record_failure(&reason);
                    }
                }
            }

            if !changed {
                break;
            }
        }
    }
}

/// `Some(Ok)` when every child completed, `Some(Err(reason))` when one
/// failed, `None` while children are still pending.
fn expansion_verdict(graph: &TaskGraph, id: TaskId) -> Option<Result<(), String>> {
    let task = graph.get(id)?;
    let mut all_completed = true;
    for child in task.children().iter().filter_map(|c| graph.get(*c)) {
        match child.state() {
            TaskState::Completed => {}
            TaskState::Failed => {
                let reason = child.fail_reason().unwrap_or("unknown failure");
                return Some(Err(format!("child task '{}' failed: {reason}", child.name())));
            }
            _ => all_completed = false,
        }
    }
    all_completed.then_some(Ok(()))
}

/// Release objects that no live task of the holding job touches any more.
///
/// A task counts as live while it is pending or while its work is still in
/// flight, even if the task was already aborted. A terminal job with nothing
/// in flight gives up all of its locks.
fn release_unneeded_locks(state: &mut EngineState) {
    let in_flight = &state.in_flight;

    for job in state.jobs.iter() {
        if state.locks.held_by(job.id()) == 0 {
            continue;
        }

        let (live, done): (Vec<&Task>, Vec<&Task>) = job.graph().iter().partition(|t| {
            (!job.is_terminal() && !t.is_terminal()) || in_flight.contains(&(job.id(), t.id()))
        });

        if job.is_terminal() && live.is_empty() {
            state.locks.release_all(job.id());
            continue;
        }

        let still_needed: HashSet<&LockObject> =
            live.iter().flat_map(|t| t.objects().iter()).collect();
        let unneeded: Vec<&LockObject> = done
            .iter()
            .flat_map(|t| t.objects().iter())
            .filter(|o| !still_needed.contains(o))
            .collect();
        if !unneeded.is_empty() {
            state.locks.release(job.id(), unneeded);
        }
    }
}

/// Dispatch admissible tasks, job by job in submission order, while worker
/// capacity remains.
///
/// A job runs its frontier only if it can take every object that frontier
/// touches; otherwise it waits for the holder to release them.
fn dispatch_ready(state: &mut EngineState) -> Vec<ScheduledTask> {
    let store = state.store.clone();
    let mut capacity = state
        .options
        .worker_count
        .saturating_sub(state.in_flight.len());
    let mut scheduled = Vec::new();

    for job in state.jobs.iter_mut().filter(|j| !j.is_terminal()) {
        if capacity == 0 {
            break;
        }

        let ready: Vec<TaskId> = job.graph().ready_frontier().map(|t| t.id()).collect();
        if ready.is_empty() {
            continue;
        }

        let objects: Vec<LockObject> = ready
            .iter()
            .filter_map(|id| job.graph().get(*id))
            .flat_map(|t| t.objects().iter().cloned())
            .collect();
        if let LockOutcome::Conflict(holder) = state.locks.try_acquire(job.id(), &objects) {
            debug!(job = %job.id(), holder = %holder, "waiting for object locks");
            continue;
        }

        for id in ready.into_iter().take(capacity) {
            let Some(before) = job.graph().get(id).cloned() else {
                continue;
            };
            let now = Utc::now();
            if let Some(task) = job.graph_mut().get_mut(id) {
                task.mark_running(now);
            }
            if let Err(err) = persist_task(store.as_ref(), job, id) {
                warn!(job = %job.id(), task = %id, error = %err, "failed to persist task start");
                if let Some(task) = job.graph_mut().get_mut(id) {
                    *task = before;
                }
                state.retry_pending = true;
                continue;
            }

            if job.started_at().is_none() {
                job.mark_started(now);
                if let Err(err) = persist_job(store.as_ref(), job) {
                    warn!(job = %job.id(), error = %err, "failed to persist job start");
                }
            }

            let Some(task) = job.graph().get(id) else {
                continue;
            };
            debug!(job = %job.id(), task = task.name(), "dispatching task");
            scheduled.push(ScheduledTask {
                job_id: job.id(),
                task_id: id,
                name: task.name().to_string(),
                kind: task.kind().clone(),
                context: TaskContext {
                    job_id: job.id(),
                    task_id: id,
                    task_name: task.name().to_string(),
                    cancel: job.cancel_token().child_token(),
                },
            });
            state.in_flight.insert((job.id(), id));
            capacity -= 1;
        }
    }

    scheduled
}

/// Move jobs that can make no further progress to their terminal state.
/// Returns whether any job finished, so its locks can be released.
fn resolve_finished_jobs(state: &mut EngineState, commands: &mut Vec<CoreCommand>) -> bool {
    let store = state.store.clone();
    let mut finished = false;

    for job in state.jobs.iter_mut().filter(|j| !j.is_terminal()) {
        let next = job.evaluate_state();
        if !next.is_terminal() {
            continue;
        }

        let now = Utc::now();
        let mut record = JobRecord::from_job(job);
        record.state = next;
        record.completed_at = Some(now.max(job.started_at().unwrap_or(job.queued_at())));
        if let Err(err) = store.save_job(&record) {
            warn!(job = %job.id(), error = %err, "failed to persist job outcome");
            state.retry_pending = true;
            continue;
        }

        job.set_state(next, now);
        info!(
            job = %job.id(),
            name = job.name(),
            state = %next,
            failures = job.failure_reasons().len(),
            "job finished"
        );
        commands.push(CoreCommand::JobFinished {
            job: job.id(),
            state: next,
        });
        finished = true;
    }
    finished
}

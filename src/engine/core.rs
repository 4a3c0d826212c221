// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous "core runtime" that consumes
//! [`RuntimeEvent`]s and produces:
//! - an updated core state (jobs, task graphs, object locks)
//! - a list of "commands" describing what the IO shell should do next
//!
//! Every transition is written to the [`TaskStore`] before it is treated as
//! effective. The store is the only collaborator the core talks to; it has no
//! channels, no Tokio runtime, and never runs work functions itself.
//!
//! The async shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - sending `ScheduledTask`s to the executor backend
//! - turning retry requests into delayed `Tick` events

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::dag::Job;
use crate::engine::event_handlers::{
    handle_cancel_job, handle_job_submitted, handle_shutdown, handle_task_finished, handle_tick,
    CoreStep,
};
use crate::engine::{RuntimeEvent, RuntimeOptions, TaskOutcome};
use crate::errors::Result;
use crate::lock::ObjectLockRegistry;
use crate::store::{JobRecord, TaskRecord, TaskStore};
use crate::types::{JobId, TaskId};

/// State shared by the event handlers.
pub(crate) struct EngineState {
    /// Jobs in submission order; terminal jobs are kept for inspection.
    pub(crate) jobs: Vec<Job>,
    pub(crate) locks: ObjectLockRegistry,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) options: RuntimeOptions,
    /// Tasks handed to a worker whose report has not been processed yet.
    pub(crate) in_flight: HashSet<(JobId, TaskId)>,
    /// Worker reports whose writes the store rejected. The work already ran
    /// and is not dispatched again; only the outcome is re-applied.
    pub(crate) pending_outcomes: Vec<(JobId, TaskId, TaskOutcome)>,
    /// Set when a transition was rolled back and must be re-attempted.
    pub(crate) retry_pending: bool,
}

impl EngineState {
    pub(crate) fn job_index(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|j| j.id() == id)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.jobs.iter().all(Job::is_terminal)
    }
}

/// Write the current form of one task of `job`.
pub(crate) fn persist_task(store: &dyn TaskStore, job: &Job, id: TaskId) -> Result<()> {
    let graph = job.graph();
    let Some(task) = graph.get(id) else {
        return Ok(());
    };
    let sequence = graph.ids().iter().position(|t| *t == id).unwrap_or_default();
    store.save_task(&TaskRecord::from_task(job.id(), task, graph, sequence))
}

pub(crate) fn persist_job(store: &dyn TaskStore, job: &Job) -> Result<()> {
    store.save_job(&JobRecord::from_job(job))
}

/// Pure core runtime.
///
/// This owns:
/// - every submitted job with its live task graph
/// - the cross-job object lock registry
/// - runtime options (worker count, `exit_when_idle`, retry delay)
pub struct CoreRuntime {
    state: EngineState,
}

impl fmt::Debug for CoreRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreRuntime")
            .field("jobs", &self.state.jobs.len())
            .field("in_flight", &self.state.in_flight.len())
            .field("locks", &self.state.locks)
            .field("options", &self.state.options)
            .finish_non_exhaustive()
    }
}

impl CoreRuntime {
    pub fn new(store: Arc<dyn TaskStore>, options: RuntimeOptions) -> Self {
        Self {
            state: EngineState {
                jobs: Vec::new(),
                locks: ObjectLockRegistry::new(),
                store,
                options,
                in_flight: HashSet::new(),
                pending_outcomes: Vec::new(),
                retry_pending: false,
            },
        }
    }

    /// True once every job is terminal and no work is in flight.
    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.len()
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.state.jobs.iter().find(|j| j.id() == id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> + '_ {
        self.state.jobs.iter()
    }

    pub fn locks(&self) -> &ObjectLockRegistry {
        &self.state.locks
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.state.options
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        match event {
            RuntimeEvent::JobSubmitted(job) => handle_job_submitted(&mut self.state, job),
            RuntimeEvent::TaskFinished { job, task, outcome } => {
                handle_task_finished(&mut self.state, job, task, outcome)
            }
            RuntimeEvent::CancelJob { job, reason } => {
                handle_cancel_job(&mut self.state, job, &reason)
            }
            RuntimeEvent::Tick => handle_tick(&mut self.state),
            RuntimeEvent::ShutdownRequested => handle_shutdown(&mut self.state),
        }
    }
}

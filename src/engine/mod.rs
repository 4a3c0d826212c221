// src/engine/mod.rs

//! Scheduling engine.
//!
//! This module ties together:
//! - the jobs and their task graphs
//! - the object lock registry that serializes conflicting jobs
//! - the persistence store every transition goes through
//! - the main runtime event loop that reacts to:
//!   - job submissions and cancellations
//!   - task completion / failure / expansion reports from the workers
//!   - retry ticks after a persistence failure
//!   - shutdown signals
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`]. Restart handling lives in [`recovery`].

use std::time::Duration;

use crate::dag::{Job, TaskContext, TaskGraph, TaskKind};
use crate::types::{JobId, TaskId};

/// What a work function reported for one task instance.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Plain work finished successfully.
    Completed,
    /// A meta-task produced the graph of steps it expands into.
    Expanded(TaskGraph),
    /// The work function reported a failure.
    Failed(String),
}

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Maximum number of tasks running at once across all jobs.
    pub worker_count: usize,
    /// If true, exit the runtime once every job is terminal and no work is
    /// in flight.
    pub exit_when_idle: bool,
    /// Delay before re-attempting transitions the store rejected.
    pub retry_delay: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            exit_when_idle: true,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Events flowing into the runtime from callers, workers and timers.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A caller submitted a job (or recovery re-submitted one).
    JobSubmitted(Job),
    /// A worker finished running a task's work function.
    TaskFinished {
        job: JobId,
        task: TaskId,
        outcome: TaskOutcome,
    },
    /// Cancel a job: every non-terminal task fails with `reason`.
    CancelJob { job: JobId, reason: String },
    /// Re-evaluate everything (scheduled after a persistence failure).
    Tick,
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

/// Description of a task that the core wants a worker to run now.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub context: TaskContext,
}

pub mod core;
pub mod event_handlers;
pub mod recovery;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep};
pub use runtime::Runtime;

// src/dag/job.rs

//! Root container binding one task graph to a persisted job record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::dag::graph::TaskGraph;
use crate::dag::task::TaskState;
use crate::types::{JobId, TaskId};

/// Aggregate state of a job, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A submitted task graph plus its aggregate progress.
///
/// Mutated only by the scheduler once submitted, and never after it reaches
/// a terminal state.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    name: String,
    graph: TaskGraph,
    state: JobState,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failure_reasons: Vec<String>,
    cancel: CancellationToken,
    cancel_reason: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, graph: TaskGraph) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            graph,
            state: JobState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure_reasons: Vec::new(),
            cancel: CancellationToken::new(),
            cancel_reason: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut TaskGraph {
        &mut self.graph
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn queued_at(&self) -> DateTime<Utc> {
        self.queued_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Distinct fail reasons collected from the job's tasks, in the order
    /// they were first seen.
    pub fn failure_reasons(&self) -> &[String] {
        &self.failure_reasons
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reason given when the job was cancelled, if it was.
    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    /// Flag the job as cancelled and signal its in-flight work to stop.
    pub(crate) fn request_cancel(&mut self, reason: &str) {
        if self.cancel_reason.is_none() {
            self.cancel_reason = Some(reason.to_string());
        }
        self.cancel.cancel();
    }

    pub(crate) fn record_failure(&mut self, reason: &str) {
        if !self.failure_reasons.iter().any(|r| r == reason) {
            self.failure_reasons.push(reason.to_string());
        }
    }

    /// Derive the aggregate state from the current task states.
    ///
    /// - `Completed` once every task is completed.
    /// - `Failed` once nothing is running, nothing is admissible, and the
    ///   graph is not complete: no further progress is possible.
    /// - `Running` while anything is in flight or admissible, `Queued` before
    ///   the first task started.
    pub fn evaluate_state(&self) -> JobState {
        let graph = &self.graph;

        if graph.iter().all(|t| t.state() == TaskState::Completed) {
            return JobState::Completed;
        }

        let in_flight = graph.iter().any(|t| t.state() == TaskState::Running);
        let admissible = graph.ids().iter().any(|id| graph.is_admissible(*id));

        if in_flight || admissible {
            if self.started_at.is_some() || in_flight {
                JobState::Running
            } else {
                JobState::Queued
            }
        } else {
            JobState::Failed
        }
    }

    /// Queued tasks that can never be admitted given the current outcomes.
    pub fn blocked_tasks(&self) -> Vec<TaskId> {
        self.graph
            .iter()
            .filter(|t| t.state() == TaskState::Queued && !self.graph.can_become_admissible(t.id()))
            .map(|t| t.id())
            .collect()
    }

    pub(crate) fn mark_started(&mut self, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now.max(self.queued_at));
        }
        if self.state == JobState::Queued {
            self.state = JobState::Running;
        }
    }

    pub(crate) fn set_state(&mut self, state: JobState, now: DateTime<Utc>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
        if state.is_terminal() && self.completed_at.is_none() {
            let floor = self.started_at.unwrap_or(self.queued_at);
            self.completed_at = Some(now.max(floor));
        }
    }

    /// Restore persisted job-level fields after a restart.
    pub(crate) fn restore(
        &mut self,
        queued_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        failure_reasons: Vec<String>,
    ) {
        self.queued_at = queued_at;
        self.started_at = started_at;
        self.failure_reasons = failure_reasons;
        self.state = if started_at.is_some() {
            JobState::Running
        } else {
            JobState::Queued
        };
    }
}

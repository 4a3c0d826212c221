// src/dag/task.rs

//! Tasks, their work functions and their lifecycle state machine.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::dag::graph::TaskGraph;
use crate::dag::guard::TaskGuard;
use crate::types::{JobId, LockObject, TaskId};

/// Lifecycle state of a task.
///
/// `Queued -> Running -> {Completed | Failed}`. Meta-tasks pass through
/// `Expanding` between `Running` and their terminal state while the tasks
/// they produced are still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Running,
    Expanding,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Expanding => "EXPANDING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Last-known outcome classifier, reported next to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Passed,
    Failed,
    /// The task was failed by a job cancellation rather than by its own work.
    Aborted,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Passed => "PASSED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// What a task failure does to the rest of its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Only the guard semantics propagate the failure; siblings keep running.
    #[default]
    Continue,
    /// Cancel the whole job as soon as this task fails.
    AbortJob,
}

/// Runtime context handed to a work function.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub task_name: String,
    /// Cancelled when the owning job is cancelled. Work functions are expected
    /// to observe it; they are never force-terminated.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub type WorkFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Work function of an ordinary task.
pub trait TaskWork: Send + Sync {
    /// Stable identifier used to rebuild the work after a restart.
    fn kind(&self) -> &'static str;

    /// Arguments needed to rebuild the work after a restart.
    fn params(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> WorkFuture<'a, ()>;
}

/// Work function of a meta-task: it produces the graph of finer-grained
/// steps that are actually required, given live data.
///
/// An empty graph is equivalent to an ordinary successful completion.
pub trait MetaTaskWork: Send + Sync {
    fn kind(&self) -> &'static str;

    fn params(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn expand<'a>(&'a self, ctx: &'a TaskContext) -> WorkFuture<'a, TaskGraph>;
}

/// Polymorphic work carried by a task.
#[derive(Clone)]
pub enum TaskKind {
    Work(Arc<dyn TaskWork>),
    Meta(Arc<dyn MetaTaskWork>),
}

impl TaskKind {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskKind::Work(w) => w.kind(),
            TaskKind::Meta(m) => m.kind(),
        }
    }

    pub fn params(&self) -> serde_json::Value {
        match self {
            TaskKind::Work(w) => w.params(),
            TaskKind::Meta(m) => m.params(),
        }
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, TaskKind::Meta(_))
    }
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Work(w) => f.debug_tuple("Work").field(&w.kind()).finish(),
            TaskKind::Meta(m) => f.debug_tuple("Meta").field(&m.kind()).finish(),
        }
    }
}

/// Atomic unit of schedulable work.
///
/// A task is owned by the [`TaskGraph`] it was added to. Predecessors and the
/// dependency order are assigned by the graph; everything else is set when
/// the task is built.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    name: String,
    kind: TaskKind,
    state: TaskState,
    status: TaskStatus,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    pub(crate) dependency_order: u32,
    pub(crate) predecessors: Vec<TaskId>,
    pub(crate) guard: TaskGuard,
    objects: BTreeSet<LockObject>,
    fail_reason: Option<String>,
    failure_policy: FailurePolicy,
    /// Tasks spliced in by this task's own expansion (reporting tree).
    pub(crate) children: Vec<TaskId>,
    /// The meta-task whose expansion produced this task, if any.
    pub(crate) parent_task: Option<TaskId>,
}

impl Task {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            kind,
            state: TaskState::Queued,
            status: TaskStatus::Pending,
            queued_at: None,
            started_at: None,
            completed_at: None,
            dependency_order: 0,
            predecessors: Vec::new(),
            guard: TaskGuard::default(),
            objects: BTreeSet::new(),
            fail_reason: None,
            failure_policy: FailurePolicy::default(),
            children: Vec::new(),
            parent_task: None,
        }
    }

    /// Build an ordinary task.
    pub fn work<W: TaskWork + 'static>(name: impl Into<String>, work: W) -> Self {
        Self::new(name, TaskKind::Work(Arc::new(work)))
    }

    /// Build a meta-task.
    pub fn meta<M: MetaTaskWork + 'static>(name: impl Into<String>, meta: M) -> Self {
        Self::new(name, TaskKind::Meta(Arc::new(meta)))
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_guard(mut self, guard: TaskGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_object(mut self, object: LockObject) -> Self {
        self.objects.insert(object);
        self
    }

    pub fn with_objects(mut self, objects: impl IntoIterator<Item = LockObject>) -> Self {
        self.objects.extend(objects);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn queued_at(&self) -> Option<DateTime<Utc>> {
        self.queued_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn dependency_order(&self) -> u32 {
        self.dependency_order
    }

    pub fn predecessors(&self) -> &[TaskId] {
        &self.predecessors
    }

    pub fn guard(&self) -> TaskGuard {
        self.guard
    }

    pub fn objects(&self) -> &BTreeSet<LockObject> {
        &self.objects
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.fail_reason.as_deref()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn children(&self) -> &[TaskId] {
        &self.children
    }

    pub fn parent_task(&self) -> Option<TaskId> {
        self.parent_task
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn mark_queued(&mut self, now: DateTime<Utc>) {
        self.queued_at.get_or_insert(now);
    }

    pub(crate) fn mark_running(&mut self, now: DateTime<Utc>) {
        debug_assert_eq!(self.state, TaskState::Queued);
        self.state = TaskState::Running;
        let floor = self.queued_at.map_or(now, |q| q.max(now));
        self.started_at.get_or_insert(floor);
    }

    pub(crate) fn mark_expanding(&mut self) {
        debug_assert_eq!(self.state, TaskState::Running);
        self.state = TaskState::Expanding;
    }

    pub(crate) fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Completed;
        self.status = TaskStatus::Passed;
        self.fail_reason = None;
        self.stamp_completed(now);
    }

    pub(crate) fn mark_failed(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        self.state = TaskState::Failed;
        self.status = TaskStatus::Failed;
        self.fail_reason = Some(reason.into());
        self.stamp_completed(now);
    }

    pub(crate) fn mark_aborted(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        self.mark_failed(now, reason);
        self.status = TaskStatus::Aborted;
    }

    /// Put a task that was found `Running` after a restart back in the queue.
    pub(crate) fn requeue(&mut self) {
        self.state = TaskState::Queued;
        self.status = TaskStatus::Pending;
        self.started_at = None;
    }

    /// Restore persisted lifecycle fields onto a freshly rebuilt task.
    pub(crate) fn restore(
        &mut self,
        state: TaskState,
        status: TaskStatus,
        timestamps: [Option<DateTime<Utc>>; 3],
        fail_reason: Option<String>,
    ) {
        let [queued, started, completed] = timestamps;
        self.state = state;
        self.status = status;
        self.queued_at = queued;
        self.started_at = started;
        self.completed_at = completed;
        self.fail_reason = fail_reason;
    }

    fn stamp_completed(&mut self, now: DateTime<Utc>) {
        let floor = self
            .started_at
            .or(self.queued_at)
            .map_or(now, |t| t.max(now));
        self.completed_at.get_or_insert(floor);
    }
}

// src/dag/mod.rs

//! Graph model of a job.
//!
//! - [`guard`] holds the admission rules evaluated over predecessor states.
//! - [`task`] defines tasks, their lifecycle, and the work traits.
//! - [`graph`] holds the directed acyclic graph of tasks and the splice
//!   operation used by meta-task expansion.
//! - [`job`] binds one graph to its aggregate progress.

pub mod graph;
pub mod guard;
pub mod job;
pub mod task;

pub use graph::{Splice, TaskGraph};
pub use guard::TaskGuard;
pub use job::{Job, JobState};
pub use task::{
    FailurePolicy, MetaTaskWork, Task, TaskContext, TaskKind, TaskState, TaskStatus, TaskWork,
    WorkFuture,
};

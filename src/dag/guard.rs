// src/dag/guard.rs

//! Admission policies evaluated against a task's predecessors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dag::task::TaskState;

/// Decides whether a queued task may start, given the states of its
/// predecessors.
///
/// Evaluation is a pure function of those states. A task without
/// predecessors is always admissible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskGuard {
    /// Admit only once every predecessor is `Completed`. A single `Failed`
    /// predecessor blocks the task for good.
    #[default]
    AllPredecessorsCompleted,
    /// Admit as soon as one predecessor is `Completed`, whatever the others do.
    AnyPredecessorCompleted,
}

impl TaskGuard {
    pub fn admits<I>(self, predecessor_states: I) -> bool
    where
        I: IntoIterator<Item = TaskState>,
    {
        let mut states = predecessor_states.into_iter().peekable();
        if states.peek().is_none() {
            return true;
        }

        match self {
            TaskGuard::AllPredecessorsCompleted => states.all(|s| s == TaskState::Completed),
            TaskGuard::AnyPredecessorCompleted => states.any(|s| s == TaskState::Completed),
        }
    }

    /// Whether the guard can still admit at some point in the future.
    ///
    /// Used for deadlock-by-failure detection: once this returns `false` the
    /// task stays `Queued` forever.
    pub fn can_still_admit<I>(self, predecessor_states: I) -> bool
    where
        I: IntoIterator<Item = TaskState>,
    {
        let mut states = predecessor_states.into_iter().peekable();
        if states.peek().is_none() {
            return true;
        }

        match self {
            TaskGuard::AllPredecessorsCompleted => states.all(|s| s != TaskState::Failed),
            TaskGuard::AnyPredecessorCompleted => states.any(|s| s != TaskState::Failed),
        }
    }
}

impl fmt::Display for TaskGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskGuard::AllPredecessorsCompleted => f.write_str("ALL_PREDECESSORS_COMPLETED"),
            TaskGuard::AnyPredecessorCompleted => f.write_str("ANY_PREDECESSOR_COMPLETED"),
        }
    }
}

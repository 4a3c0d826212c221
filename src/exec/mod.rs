// src/exec/mod.rs

//! Work execution layer.
//!
//! This module actually runs the work functions of scheduled tasks and
//! reports their outcome back to the runtime via `RuntimeEvent`s.
//!
//! - [`executor_loop`] owns the background loop that receives scheduled
//!   tasks and spawns one Tokio task per work invocation.
//! - [`task_runner`] runs a single work function and turns its result (or
//!   panic) into a `TaskOutcome`.
//! - [`backend`] provides the `ExecutorBackend` trait and the concrete
//!   `WorkerPoolBackend` the runtime uses in production, which tests can
//!   replace with a fake implementation.

pub mod backend;
pub mod executor_loop;
pub mod task_runner;

pub use backend::{ExecutorBackend, WorkerPoolBackend};
pub use executor_loop::spawn_executor;

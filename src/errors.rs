// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobgraphError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Adding a task or edge would close a cycle. The graph is unchanged.
    #[error("Cycle detected in task graph: {0}")]
    Cycle(String),

    /// Splicing a meta-task's subgraph would close a cycle. Nothing was spliced.
    #[error("Splice would create a cycle: {0}")]
    SpliceCycle(String),

    #[error("Task '{task}' references unknown predecessor '{predecessor}'")]
    UnknownPredecessor { task: String, predecessor: String },

    #[error("Task already present in graph: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The store collaborator rejected a write or read.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("No work registered for task kind '{0}'")]
    UnknownTaskKind(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, JobgraphError>;

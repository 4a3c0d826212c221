// src/registry.rs

//! Rebuilds work functions from their persisted `(kind, params)` pair.
//!
//! Work functions are code, so the store only keeps a kind identifier and
//! the parameters needed to reconstruct them. Restart recovery resolves each
//! record through this registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::dag::{MetaTaskWork, TaskKind, TaskWork};
use crate::errors::{JobgraphError, Result};

type Factory = Box<dyn Fn(&Value) -> anyhow::Result<TaskKind> + Send + Sync>;

#[derive(Default)]
pub struct WorkRegistry {
    factories: HashMap<String, Factory>,
}

impl fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("WorkRegistry").field("kinds", &kinds).finish()
    }
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an ordinary work kind.
    pub fn register_work<W, F>(&mut self, kind: &str, build: F)
    where
        W: TaskWork + 'static,
        F: Fn(&Value) -> anyhow::Result<W> + Send + Sync + 'static,
    {
        self.factories.insert(
            kind.to_string(),
            Box::new(move |params| Ok(TaskKind::Work(Arc::new(build(params)?)))),
        );
    }

    /// Register a meta-task kind.
    pub fn register_meta<M, F>(&mut self, kind: &str, build: F)
    where
        M: MetaTaskWork + 'static,
        F: Fn(&Value) -> anyhow::Result<M> + Send + Sync + 'static,
    {
        self.factories.insert(
            kind.to_string(),
            Box::new(move |params| Ok(TaskKind::Meta(Arc::new(build(params)?)))),
        );
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn build(&self, kind: &str, params: &Value) -> Result<TaskKind> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| JobgraphError::UnknownTaskKind(kind.to_string()))?;
        Ok(factory(params)?)
    }
}

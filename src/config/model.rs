// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::RuntimeOptions;
use crate::types::StoreMode;

/// Top-level configuration as read from a TOML file, before validation.
///
/// ```toml
/// [engine]
/// worker_count = 4
/// event_buffer = 64
/// exit_when_idle = true
///
/// [store]
/// mode = "file"
/// path = ".jobgraph/store.json"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub store: StoreSection,
}

/// Validated configuration. Built through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub engine: EngineSection,
    pub store: StoreSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(engine: EngineSection, store: StoreSection) -> Self {
        Self { engine, store }
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            worker_count: self.engine.worker_count,
            exit_when_idle: self.engine.exit_when_idle,
            retry_delay: Duration::from_millis(self.engine.retry_delay_ms),
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Maximum number of tasks running at once, across all jobs.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Capacity of the runtime event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Stop the runtime once every job is terminal.
    #[serde(default = "default_exit_when_idle")]
    pub exit_when_idle: bool,

    /// Delay before re-attempting a transition the store rejected.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_worker_count() -> usize {
    4
}

fn default_event_buffer() -> usize {
    64
}

fn default_exit_when_idle() -> bool {
    true
}

fn default_retry_delay_ms() -> u64 {
    200
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            event_buffer: default_event_buffer(),
            exit_when_idle: default_exit_when_idle(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    #[serde(default)]
    pub mode: StoreMode,

    /// JSON document used in `file` mode.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".jobgraph/store.json")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            path: default_store_path(),
        }
    }
}

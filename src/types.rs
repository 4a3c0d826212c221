use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identity of a task, stable across persistence and restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        TaskId(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TaskId)
    }
}

/// Opaque identity of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// Kind of domain entity a task touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    VirtualizationConnector,
    SecurityGroup,
    SecurityGroupMember,
    SecurityGroupInterface,
    Label,
    Pod,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectType::VirtualizationConnector => "Virtualization Connector",
            ObjectType::SecurityGroup => "Security Group",
            ObjectType::SecurityGroupMember => "Security Group Member",
            ObjectType::SecurityGroupInterface => "Security Group Interface",
            ObjectType::Label => "Label",
            ObjectType::Pod => "Pod",
        };
        f.write_str(s)
    }
}

/// A domain entity a task reads or mutates.
///
/// Equality and hashing cover all three fields; the lock registry keys on
/// `(object_id, object_type)` only via [`LockObject::key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockObject {
    pub object_id: String,
    pub name: String,
    pub object_type: ObjectType,
}

impl LockObject {
    pub fn new(object_id: impl Into<String>, name: impl Into<String>, object_type: ObjectType) -> Self {
        Self {
            object_id: object_id.into(),
            name: name.into(),
            object_type,
        }
    }

    pub fn key(&self) -> (String, ObjectType) {
        (self.object_id.clone(), self.object_type)
    }
}

/// Where the store keeps its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Records live in a JSON document on disk and survive restarts.
    File,
    /// Records are kept in memory only (lost on restart).
    Memory,
}

impl Default for StoreMode {
    fn default() -> Self {
        StoreMode::Memory
    }
}

impl FromStr for StoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(StoreMode::File),
            "memory" => Ok(StoreMode::Memory),
            other => Err(format!(
                "invalid store mode: {other} (expected \"file\" or \"memory\")"
            )),
        }
    }
}

// src/conformance/model.rs

//! Domain records read from the inventory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{LockObject, ObjectType};

/// Label selector of a security-group member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key).is_some_and(|v| *v == self.value)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupMember {
    pub id: String,
    pub label: Label,
}

/// Binding of a security group to an inspection policy on one manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupInterface {
    pub id: String,
    pub name: String,
    pub policy_id: String,
    #[serde(default)]
    pub marked_for_deletion: bool,
}

impl SecurityGroupInterface {
    pub fn lock_object(&self) -> LockObject {
        LockObject::new(&self.id, &self.name, ObjectType::SecurityGroupInterface)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub connector_id: String,
    pub members: Vec<SecurityGroupMember>,
    pub interfaces: Vec<SecurityGroupInterface>,
    #[serde(default)]
    pub marked_for_deletion: bool,
}

impl SecurityGroup {
    pub fn lock_object(&self) -> LockObject {
        LockObject::new(&self.id, &self.name, ObjectType::SecurityGroup)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodPort {
    pub id: String,
    pub mac_address: String,
    /// Network domain the port lives in; the port group is created there.
    pub domain_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PodPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGroup {
    pub id: String,
    pub domain_id: String,
}

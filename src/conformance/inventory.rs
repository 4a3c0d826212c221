// src/conformance/inventory.rs

//! Live inventory collaborator.
//!
//! Meta-tasks read it to decide which fine-grained steps are needed; plain
//! tasks apply their change through it. Every mutation is idempotent so a
//! task requeued after a restart can safely run again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::conformance::model::{Label, Pod, PortGroup, SecurityGroup};

pub trait Inventory: Send + Sync {
    fn security_group(&self, sg_id: &str) -> Result<SecurityGroup>;

    /// Pods carrying `label`, in id order.
    fn pods_with_label(&self, label: &Label) -> Result<Vec<Pod>>;

    /// Ports currently bound into the group's port group.
    fn bound_ports(&self, sg_id: &str) -> Result<BTreeSet<String>>;

    fn bind_port(&self, sg_id: &str, port_id: &str) -> Result<()>;

    fn unbind_port(&self, sg_id: &str, port_id: &str) -> Result<()>;

    fn port_group(&self, sg_id: &str) -> Result<Option<PortGroup>>;

    fn create_port_group(&self, sg_id: &str, domain_id: &str) -> Result<PortGroup>;

    fn delete_port_group(&self, sg_id: &str) -> Result<()>;

    /// Member map last published to the manager of `interface_id`.
    fn published_members(&self, interface_id: &str) -> Result<Option<BTreeSet<String>>>;

    fn publish_members(&self, interface_id: &str, ports: &BTreeSet<String>) -> Result<()>;

    fn has_hook(&self, interface_id: &str) -> Result<bool>;

    fn install_hook(&self, interface_id: &str, port_group_id: &str) -> Result<()>;

    fn remove_hook(&self, interface_id: &str) -> Result<()>;

    fn mark_interface_for_deletion(&self, sg_id: &str, interface_id: &str) -> Result<()>;

    fn delete_interface(&self, sg_id: &str, interface_id: &str) -> Result<()>;

    fn delete_security_group(&self, sg_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct InventoryState {
    groups: BTreeMap<String, SecurityGroup>,
    pods: BTreeMap<String, Pod>,
    bindings: BTreeMap<String, BTreeSet<String>>,
    port_groups: BTreeMap<String, PortGroup>,
    published: BTreeMap<String, BTreeSet<String>>,
    hooks: BTreeMap<String, String>,
    failing: BTreeSet<String>,
    operations: Vec<String>,
}

/// Inventory kept in process memory, with an operation log for inspection.
#[derive(Debug, Default)]
pub struct InMemoryInventory {
    state: Mutex<InventoryState>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_security_group(&self, sg: SecurityGroup) {
        self.lock().groups.insert(sg.id.clone(), sg);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.lock().pods.insert(pod.id.clone(), pod);
    }

    pub fn mark_security_group_for_deletion(&self, sg_id: &str) {
        if let Some(sg) = self.lock().groups.get_mut(sg_id) {
            sg.marked_for_deletion = true;
        }
    }

    /// Make every operation whose log line starts with `prefix` fail.
    pub fn fail_operations(&self, prefix: &str) {
        self.lock().failing.insert(prefix.to_string());
    }

    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    pub fn contains_security_group(&self, sg_id: &str) -> bool {
        self.lock().groups.contains_key(sg_id)
    }

    fn lock(&self) -> MutexGuard<'_, InventoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a mutation, or fail it if a matching failure was injected.
    fn record(state: &mut InventoryState, op: String) -> Result<()> {
        if state.failing.iter().any(|prefix| op.starts_with(prefix.as_str())) {
            return Err(anyhow!("inventory rejected '{op}'"));
        }
        debug!(op = %op, "inventory mutation");
        state.operations.push(op);
        Ok(())
    }
}

impl Inventory for InMemoryInventory {
    fn security_group(&self, sg_id: &str) -> Result<SecurityGroup> {
        self.lock()
            .groups
            .get(sg_id)
            .cloned()
            .ok_or_else(|| anyhow!("security group '{sg_id}' not found"))
    }

    fn pods_with_label(&self, label: &Label) -> Result<Vec<Pod>> {
        Ok(self
            .lock()
            .pods
            .values()
            .filter(|p| label.matches(&p.labels))
            .cloned()
            .collect())
    }

    fn bound_ports(&self, sg_id: &str) -> Result<BTreeSet<String>> {
        Ok(self.lock().bindings.get(sg_id).cloned().unwrap_or_default())
    }

    fn bind_port(&self, sg_id: &str, port_id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("bind {sg_id} {port_id}"))?;
        state
            .bindings
            .entry(sg_id.to_string())
            .or_default()
            .insert(port_id.to_string());
        Ok(())
    }

    fn unbind_port(&self, sg_id: &str, port_id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("unbind {sg_id} {port_id}"))?;
        if let Some(ports) = state.bindings.get_mut(sg_id) {
            ports.remove(port_id);
        }
        Ok(())
    }

    fn port_group(&self, sg_id: &str) -> Result<Option<PortGroup>> {
        Ok(self.lock().port_groups.get(sg_id).cloned())
    }

    fn create_port_group(&self, sg_id: &str, domain_id: &str) -> Result<PortGroup> {
        let mut state = self.lock();
        if let Some(existing) = state.port_groups.get(sg_id) {
            return Ok(existing.clone());
        }
        Self::record(&mut state, format!("create-port-group {sg_id} {domain_id}"))?;
        let group = PortGroup {
            id: format!("pg-{sg_id}"),
            domain_id: domain_id.to_string(),
        };
        state.port_groups.insert(sg_id.to_string(), group.clone());
        Ok(group)
    }

    fn delete_port_group(&self, sg_id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("delete-port-group {sg_id}"))?;
        state.port_groups.remove(sg_id);
        Ok(())
    }

    fn published_members(&self, interface_id: &str) -> Result<Option<BTreeSet<String>>> {
        Ok(self.lock().published.get(interface_id).cloned())
    }

    fn publish_members(&self, interface_id: &str, ports: &BTreeSet<String>) -> Result<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("publish {interface_id} {}", ports.len()))?;
        state.published.insert(interface_id.to_string(), ports.clone());
        Ok(())
    }

    fn has_hook(&self, interface_id: &str) -> Result<bool> {
        Ok(self.lock().hooks.contains_key(interface_id))
    }

    fn install_hook(&self, interface_id: &str, port_group_id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("install-hook {interface_id}"))?;
        state
            .hooks
            .insert(interface_id.to_string(), port_group_id.to_string());
        Ok(())
    }

    fn remove_hook(&self, interface_id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("remove-hook {interface_id}"))?;
        state.hooks.remove(interface_id);
        Ok(())
    }

    fn mark_interface_for_deletion(&self, sg_id: &str, interface_id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("mark-interface {interface_id}"))?;
        let sgi = state
            .groups
            .get_mut(sg_id)
            .and_then(|sg| sg.interfaces.iter_mut().find(|i| i.id == interface_id));
        if let Some(sgi) = sgi {
            sgi.marked_for_deletion = true;
        }
        Ok(())
    }

    fn delete_interface(&self, sg_id: &str, interface_id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("delete-interface {interface_id}"))?;
        if let Some(sg) = state.groups.get_mut(sg_id) {
            sg.interfaces.retain(|i| i.id != interface_id);
        }
        state.published.remove(interface_id);
        Ok(())
    }

    fn delete_security_group(&self, sg_id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("delete-security-group {sg_id}"))?;
        state.groups.remove(sg_id);
        state.bindings.remove(sg_id);
        Ok(())
    }
}

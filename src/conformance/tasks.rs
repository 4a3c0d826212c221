// src/conformance/tasks.rs

//! Concrete tasks and meta-tasks of security-group reconciliation.
//!
//! Each step is a plain serde struct implementing [`Step`] (plain work) or
//! [`Expansion`] (meta work). [`InventoryStep`] / [`InventoryMeta`] adapt
//! them to the task traits, which keeps `(kind, params)` persistence and the
//! registry factories uniform.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::conformance::assembly::{build_delete_graph, build_update_graph};
use crate::conformance::inventory::Inventory;
use crate::conformance::model::{SecurityGroup, SecurityGroupInterface, SecurityGroupMember};
use crate::dag::{MetaTaskWork, Task, TaskContext, TaskGraph, TaskWork, WorkFuture};
use crate::types::LockObject;

/// Plain work applied through the inventory.
pub trait Step: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn run(&self, inventory: &dyn Inventory) -> Result<()>;
}

/// Meta work: reads the inventory and returns the steps actually needed.
pub trait Expansion: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn expand(&self, inventory: &Arc<dyn Inventory>) -> Result<TaskGraph>;
}

pub struct InventoryStep<S> {
    step: S,
    inventory: Arc<dyn Inventory>,
}

impl<S: Step> InventoryStep<S> {
    pub fn new(step: S, inventory: Arc<dyn Inventory>) -> Self {
        Self { step, inventory }
    }

    pub fn from_params(params: &Value, inventory: Arc<dyn Inventory>) -> Result<Self> {
        let step = serde_json::from_value(params.clone())
            .with_context(|| format!("decoding params of '{}'", S::KIND))?;
        Ok(Self::new(step, inventory))
    }
}

impl<S: Step> TaskWork for InventoryStep<S> {
    fn kind(&self) -> &'static str {
        S::KIND
    }

    fn params(&self) -> Value {
        serde_json::to_value(&self.step).unwrap_or(Value::Null)
    }

    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> WorkFuture<'a, ()> {
        Box::pin(async move {
            if ctx.is_cancelled() {
                bail!("cancelled before '{}' started", ctx.task_name);
            }
            self.step.run(self.inventory.as_ref())
        })
    }
}

pub struct InventoryMeta<E> {
    expansion: E,
    inventory: Arc<dyn Inventory>,
}

impl<E: Expansion> InventoryMeta<E> {
    pub fn new(expansion: E, inventory: Arc<dyn Inventory>) -> Self {
        Self {
            expansion,
            inventory,
        }
    }

    pub fn from_params(params: &Value, inventory: Arc<dyn Inventory>) -> Result<Self> {
        let expansion = serde_json::from_value(params.clone())
            .with_context(|| format!("decoding params of '{}'", E::KIND))?;
        Ok(Self::new(expansion, inventory))
    }
}

impl<E: Expansion> MetaTaskWork for InventoryMeta<E> {
    fn kind(&self) -> &'static str {
        E::KIND
    }

    fn params(&self) -> Value {
        serde_json::to_value(&self.expansion).unwrap_or(Value::Null)
    }

    fn expand<'a>(&'a self, ctx: &'a TaskContext) -> WorkFuture<'a, TaskGraph> {
        Box::pin(async move {
            if ctx.is_cancelled() {
                bail!("cancelled before '{}' expanded", ctx.task_name);
            }
            self.expansion.expand(&self.inventory)
        })
    }
}

fn step_task<S: Step>(
    name: String,
    step: S,
    inventory: &Arc<dyn Inventory>,
    objects: impl IntoIterator<Item = LockObject>,
) -> Task {
    Task::work(name, InventoryStep::new(step, inventory.clone())).with_objects(objects)
}

fn meta_task<E: Expansion>(
    name: String,
    expansion: E,
    inventory: &Arc<dyn Inventory>,
    objects: impl IntoIterator<Item = LockObject>,
) -> Task {
    Task::meta(name, InventoryMeta::new(expansion, inventory.clone())).with_objects(objects)
}

fn interface<'a>(sg: &'a SecurityGroup, interface_id: &str) -> Result<&'a SecurityGroupInterface> {
    sg.interfaces
        .iter()
        .find(|i| i.id == interface_id)
        .ok_or_else(|| anyhow!("interface '{interface_id}' not found in '{}'", sg.name))
}

// ---------------------------------------------------------------------------
// Plain steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindPort {
    pub sg_id: String,
    pub port_id: String,
}

impl Step for BindPort {
    const KIND: &'static str = "sg.bind_port";

    fn run(&self, inventory: &dyn Inventory) -> Result<()> {
        inventory.bind_port(&self.sg_id, &self.port_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnbindPort {
    pub sg_id: String,
    pub port_id: String,
}

impl Step for UnbindPort {
    const KIND: &'static str = "sg.unbind_port";

    fn run(&self, inventory: &dyn Inventory) -> Result<()> {
        inventory.unbind_port(&self.sg_id, &self.port_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePortGroup {
    pub sg_id: String,
    pub domain_id: String,
}

impl Step for CreatePortGroup {
    const KIND: &'static str = "sg.create_port_group";

    fn run(&self, inventory: &dyn Inventory) -> Result<()> {
        inventory.create_port_group(&self.sg_id, &self.domain_id)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePortGroup {
    pub sg_id: String,
}

impl Step for DeletePortGroup {
    const KIND: &'static str = "sg.delete_port_group";

    fn run(&self, inventory: &dyn Inventory) -> Result<()> {
        inventory.delete_port_group(&self.sg_id)
    }
}

/// Publish the group's current port membership (empty when clearing) to the
/// manager behind one interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishMembers {
    pub sg_id: String,
    pub interface_id: String,
    pub clear: bool,
}

impl Step for PublishMembers {
    const KIND: &'static str = "sg.publish_members";

    fn run(&self, inventory: &dyn Inventory) -> Result<()> {
        let ports = if self.clear {
            BTreeSet::new()
        } else {
            inventory.bound_ports(&self.sg_id)?
        };
        inventory.publish_members(&self.interface_id, &ports)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallHook {
    pub sg_id: String,
    pub interface_id: String,
}

impl Step for InstallHook {
    const KIND: &'static str = "sg.install_hook";

    fn run(&self, inventory: &dyn Inventory) -> Result<()> {
        let group = inventory
            .port_group(&self.sg_id)?
            .ok_or_else(|| anyhow!("no port group for security group '{}'", self.sg_id))?;
        inventory.install_hook(&self.interface_id, &group.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveHook {
    pub interface_id: String,
}

impl Step for RemoveHook {
    const KIND: &'static str = "sg.remove_hook";

    fn run(&self, inventory: &dyn Inventory) -> Result<()> {
        inventory.remove_hook(&self.interface_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkInterfaceForDeletion {
    pub sg_id: String,
    pub interface_id: String,
}

impl Step for MarkInterfaceForDeletion {
    const KIND: &'static str = "sg.mark_interface_for_deletion";

    fn run(&self, inventory: &dyn Inventory) -> Result<()> {
        inventory.mark_interface_for_deletion(&self.sg_id, &self.interface_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteInterface {
    pub sg_id: String,
    pub interface_id: String,
}

impl Step for DeleteInterface {
    const KIND: &'static str = "sg.delete_interface";

    fn run(&self, inventory: &dyn Inventory) -> Result<()> {
        inventory.delete_interface(&self.sg_id, &self.interface_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSecurityGroup {
    pub sg_id: String,
}

impl Step for DeleteSecurityGroup {
    const KIND: &'static str = "sg.delete_security_group";

    fn run(&self, inventory: &dyn Inventory) -> Result<()> {
        inventory.delete_security_group(&self.sg_id)
    }
}

// ---------------------------------------------------------------------------
// Meta steps
// ---------------------------------------------------------------------------

/// Bind (or, when deleting, unbind) the ports of every pod carrying the
/// member's label. Pods already in the wanted state produce no step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckLabel {
    pub sg_id: String,
    pub member: SecurityGroupMember,
    pub is_delete: bool,
}

impl Expansion for CheckLabel {
    const KIND: &'static str = "sg.check_label";

    fn expand(&self, inventory: &Arc<dyn Inventory>) -> Result<TaskGraph> {
        let sg = inventory.security_group(&self.sg_id)?;
        let bound = inventory.bound_ports(&self.sg_id)?;
        let mut graph = TaskGraph::new();

        for pod in inventory.pods_with_label(&self.member.label)? {
            for port in &pod.ports {
                let task = match (self.is_delete, bound.contains(&port.id)) {
                    (false, false) => step_task(
                        format!("Bind port '{}' of pod '{}'", port.id, pod.name),
                        BindPort {
                            sg_id: sg.id.clone(),
                            port_id: port.id.clone(),
                        },
                        inventory,
                        [sg.lock_object()],
                    ),
                    (true, true) => step_task(
                        format!("Unbind port '{}' of pod '{}'", port.id, pod.name),
                        UnbindPort {
                            sg_id: sg.id.clone(),
                            port_id: port.id.clone(),
                        },
                        inventory,
                        [sg.lock_object()],
                    ),
                    _ => continue,
                };
                graph.add_task(task, &[])?;
            }
        }

        debug!(member = %self.member.id, label = %self.member.label, steps = graph.len(), "label check expanded");
        Ok(graph)
    }
}

/// Create the group's port group if missing, or delete it when deleting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortGroupCheck {
    pub sg_id: String,
    pub is_delete: bool,
    /// Domain to create the port group in; resolved from the members' pods
    /// when absent.
    pub domain_id: Option<String>,
}

impl Expansion for PortGroupCheck {
    const KIND: &'static str = "sg.port_group_check";

    fn expand(&self, inventory: &Arc<dyn Inventory>) -> Result<TaskGraph> {
        let sg = inventory.security_group(&self.sg_id)?;
        let existing = inventory.port_group(&sg.id)?;
        let mut graph = TaskGraph::new();

        if self.is_delete {
            if existing.is_some() {
                graph.add_task(
                    step_task(
                        format!("Delete port group of '{}'", sg.name),
                        DeletePortGroup { sg_id: sg.id.clone() },
                        inventory,
                        [sg.lock_object()],
                    ),
                    &[],
                )?;
            }
            return Ok(graph);
        }

        if existing.is_some() {
            return Ok(graph);
        }
        let domain_id = match &self.domain_id {
            Some(domain) => Some(domain.clone()),
            None => first_member_domain(inventory.as_ref(), &sg)?,
        };
        let Some(domain_id) = domain_id else {
            debug!(sg = %sg.name, "no member port to derive a domain from; nothing to create");
            return Ok(graph);
        };
        graph.add_task(
            step_task(
                format!("Create port group of '{}'", sg.name),
                CreatePortGroup {
                    sg_id: sg.id.clone(),
                    domain_id,
                },
                inventory,
                [sg.lock_object()],
            ),
            &[],
        )?;
        Ok(graph)
    }
}

/// Domain of the first port of the first pod matching the first member.
pub fn first_member_domain(inventory: &dyn Inventory, sg: &SecurityGroup) -> Result<Option<String>> {
    let Some(member) = sg.members.first() else {
        return Ok(None);
    };
    Ok(inventory
        .pods_with_label(&member.label)?
        .into_iter()
        .find_map(|pod| pod.ports.into_iter().next())
        .map(|port| port.domain_id))
}

/// Publish the member map to every manager whose copy is stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberMapPropagate {
    pub sg_id: String,
    pub is_delete: bool,
}

impl Expansion for MemberMapPropagate {
    const KIND: &'static str = "sg.member_map_propagate";

    fn expand(&self, inventory: &Arc<dyn Inventory>) -> Result<TaskGraph> {
        let sg = inventory.security_group(&self.sg_id)?;
        let wanted = if self.is_delete {
            BTreeSet::new()
        } else {
            inventory.bound_ports(&sg.id)?
        };
        let mut graph = TaskGraph::new();

        for sgi in &sg.interfaces {
            if inventory.published_members(&sgi.id)?.as_ref() == Some(&wanted) {
                continue;
            }
            graph.add_task(
                step_task(
                    format!("Publish members of '{}' to '{}'", sg.name, sgi.name),
                    PublishMembers {
                        sg_id: sg.id.clone(),
                        interface_id: sgi.id.clone(),
                        clear: self.is_delete,
                    },
                    inventory,
                    [sg.lock_object(), sgi.lock_object()],
                ),
                &[],
            )?;
        }
        Ok(graph)
    }
}

/// Install (or remove) the inspection hook of one interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortGroupHookCheck {
    pub sg_id: String,
    pub interface_id: String,
    pub is_delete: bool,
}

impl Expansion for PortGroupHookCheck {
    const KIND: &'static str = "sg.port_group_hook_check";

    fn expand(&self, inventory: &Arc<dyn Inventory>) -> Result<TaskGraph> {
        let sg = inventory.security_group(&self.sg_id)?;
        let sgi = interface(&sg, &self.interface_id)?;
        let installed = inventory.has_hook(&sgi.id)?;
        let mut graph = TaskGraph::new();
        let objects = [sg.lock_object(), sgi.lock_object()];

        let task = match (self.is_delete, installed) {
            (false, false) => step_task(
                format!("Install hook of '{}'", sgi.name),
                InstallHook {
                    sg_id: sg.id.clone(),
                    interface_id: sgi.id.clone(),
                },
                inventory,
                objects,
            ),
            (true, true) => step_task(
                format!("Remove hook of '{}'", sgi.name),
                RemoveHook {
                    interface_id: sgi.id.clone(),
                },
                inventory,
                objects,
            ),
            _ => return Ok(graph),
        };
        graph.add_task(task, &[])?;
        Ok(graph)
    }
}

/// Seed of a reconciliation job: decides from live data whether the group
/// is being updated or torn down, and returns the matching graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOrDeleteSecurityGroup {
    pub sg_id: String,
}

impl Expansion for UpdateOrDeleteSecurityGroup {
    const KIND: &'static str = "sg.update_or_delete";

    fn expand(&self, inventory: &Arc<dyn Inventory>) -> Result<TaskGraph> {
        let sg = inventory.security_group(&self.sg_id)?;
        let graph = if sg.marked_for_deletion {
            build_delete_graph(&sg, inventory)?
        } else {
            build_update_graph(&sg, inventory)?
        };
        Ok(graph)
    }
}

// ---------------------------------------------------------------------------
// Task constructors used by the graph assembly
// ---------------------------------------------------------------------------

pub fn check_label_task(
    sg: &SecurityGroup,
    member: &SecurityGroupMember,
    is_delete: bool,
    inventory: &Arc<dyn Inventory>,
) -> Task {
    meta_task(
        format!("Check label '{}' of member '{}'", member.label, member.id),
        CheckLabel {
            sg_id: sg.id.clone(),
            member: member.clone(),
            is_delete,
        },
        inventory,
        [sg.lock_object()],
    )
}

pub fn port_group_check_task(
    sg: &SecurityGroup,
    is_delete: bool,
    domain_id: Option<String>,
    inventory: &Arc<dyn Inventory>,
) -> Task {
    meta_task(
        format!("Check port group of '{}'", sg.name),
        PortGroupCheck {
            sg_id: sg.id.clone(),
            is_delete,
            domain_id,
        },
        inventory,
        [sg.lock_object()],
    )
}

pub fn member_map_propagate_task(
    sg: &SecurityGroup,
    is_delete: bool,
    inventory: &Arc<dyn Inventory>,
) -> Task {
    meta_task(
        format!("Propagate member map of '{}'", sg.name),
        MemberMapPropagate {
            sg_id: sg.id.clone(),
            is_delete,
        },
        inventory,
        [sg.lock_object()],
    )
}

pub fn port_group_hook_task(
    sg: &SecurityGroup,
    sgi: &SecurityGroupInterface,
    is_delete: bool,
    inventory: &Arc<dyn Inventory>,
) -> Task {
    meta_task(
        format!("Check hook of '{}'", sgi.name),
        PortGroupHookCheck {
            sg_id: sg.id.clone(),
            interface_id: sgi.id.clone(),
            is_delete,
        },
        inventory,
        [sg.lock_object(), sgi.lock_object()],
    )
}

pub fn mark_interface_task(
    sg: &SecurityGroup,
    sgi: &SecurityGroupInterface,
    inventory: &Arc<dyn Inventory>,
) -> Task {
    step_task(
        format!("Mark '{}' for deletion", sgi.name),
        MarkInterfaceForDeletion {
            sg_id: sg.id.clone(),
            interface_id: sgi.id.clone(),
        },
        inventory,
        [sg.lock_object(), sgi.lock_object()],
    )
}

pub fn delete_interface_task(
    sg: &SecurityGroup,
    sgi: &SecurityGroupInterface,
    inventory: &Arc<dyn Inventory>,
) -> Task {
    step_task(
        format!("Delete interface '{}'", sgi.name),
        DeleteInterface {
            sg_id: sg.id.clone(),
            interface_id: sgi.id.clone(),
        },
        inventory,
        [sg.lock_object(), sgi.lock_object()],
    )
}

pub fn delete_group_task(sg: &SecurityGroup, inventory: &Arc<dyn Inventory>) -> Task {
    step_task(
        format!("Delete security group '{}'", sg.name),
        DeleteSecurityGroup { sg_id: sg.id.clone() },
        inventory,
        [sg.lock_object()],
    )
}

/// The single task a reconciliation job is submitted with.
pub fn update_or_delete_task(sg: &SecurityGroup, inventory: &Arc<dyn Inventory>) -> Task {
    meta_task(
        format!("Update or delete security group '{}'", sg.name),
        UpdateOrDeleteSecurityGroup { sg_id: sg.id.clone() },
        inventory,
        [sg.lock_object()],
    )
}

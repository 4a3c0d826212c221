// src/conformance/mod.rs

//! Security-group reconciliation built on the scheduler.
//!
//! - [`model`] holds the domain records.
//! - [`inventory`] is the live-data collaborator plus an in-memory version.
//! - [`tasks`] holds the concrete tasks and meta-tasks.
//! - [`assembly`] builds the update and delete graphs.

pub mod assembly;
pub mod inventory;
pub mod model;
pub mod tasks;

use std::sync::Arc;

pub use assembly::{build_delete_graph, build_update_graph};
pub use inventory::{InMemoryInventory, Inventory};
pub use model::{Label, Pod, PodPort, PortGroup, SecurityGroup, SecurityGroupInterface, SecurityGroupMember};
pub use tasks::update_or_delete_task;

use crate::registry::WorkRegistry;
use tasks::{
    BindPort, CheckLabel, CreatePortGroup, DeleteInterface, DeletePortGroup, DeleteSecurityGroup,
    Expansion, InstallHook, InventoryMeta, InventoryStep, MarkInterfaceForDeletion,
    MemberMapPropagate, PortGroupCheck, PortGroupHookCheck, PublishMembers, RemoveHook, Step,
    UnbindPort, UpdateOrDeleteSecurityGroup,
};

fn register_step<S: Step>(registry: &mut WorkRegistry, inventory: &Arc<dyn Inventory>) {
    let inventory = inventory.clone();
    registry.register_work(S::KIND, move |params| {
        InventoryStep::<S>::from_params(params, inventory.clone())
    });
}

fn register_expansion<E: Expansion>(registry: &mut WorkRegistry, inventory: &Arc<dyn Inventory>) {
    let inventory = inventory.clone();
    registry.register_meta(E::KIND, move |params| {
        InventoryMeta::<E>::from_params(params, inventory.clone())
    });
}

/// Register every reconciliation task kind so recovery can rebuild them.
pub fn register_work(registry: &mut WorkRegistry, inventory: Arc<dyn Inventory>) {
    register_step::<BindPort>(registry, &inventory);
    register_step::<UnbindPort>(registry, &inventory);
    register_step::<CreatePortGroup>(registry, &inventory);
    register_step::<DeletePortGroup>(registry, &inventory);
    register_step::<PublishMembers>(registry, &inventory);
    register_step::<InstallHook>(registry, &inventory);
    register_step::<RemoveHook>(registry, &inventory);
    register_step::<MarkInterfaceForDeletion>(registry, &inventory);
    register_step::<DeleteInterface>(registry, &inventory);
    register_step::<DeleteSecurityGroup>(registry, &inventory);

    register_expansion::<CheckLabel>(registry, &inventory);
    register_expansion::<PortGroupCheck>(registry, &inventory);
    register_expansion::<MemberMapPropagate>(registry, &inventory);
    register_expansion::<PortGroupHookCheck>(registry, &inventory);
    register_expansion::<UpdateOrDeleteSecurityGroup>(registry, &inventory);
}

/// Demo inventory: one security group with `members` label selectors (one
/// pod each) and `interfaces` policy bindings.
pub fn demo_inventory(members: usize, interfaces: usize, delete: bool) -> (Arc<InMemoryInventory>, SecurityGroup) {
    let inventory = Arc::new(InMemoryInventory::new());

    let members: Vec<SecurityGroupMember> = (1..=members)
        .map(|i| SecurityGroupMember {
            id: format!("member-{i}"),
            label: Label::new("app", format!("web-{i}")),
        })
        .collect();
    for (i, member) in members.iter().enumerate() {
        inventory.add_pod(Pod {
            id: format!("pod-{}", i + 1),
            name: format!("web-{}-pod", i + 1),
            namespace: "default".to_string(),
            labels: [(member.label.key.clone(), member.label.value.clone())]
                .into_iter()
                .collect(),
            ports: vec![PodPort {
                id: format!("port-{}", i + 1),
                mac_address: format!("02:00:00:00:00:{:02x}", i + 1),
                domain_id: "domain-1".to_string(),
            }],
        });
    }

    let sg = SecurityGroup {
        id: "sg-1".to_string(),
        name: "web".to_string(),
        connector_id: "vc-1".to_string(),
        members,
        interfaces: (1..=interfaces)
            .map(|i| SecurityGroupInterface {
                id: format!("sgi-{i}"),
                name: format!("web-policy-{i}"),
                policy_id: format!("policy-{i}"),
                marked_for_deletion: false,
            })
            .collect(),
        marked_for_deletion: delete,
    };
    inventory.add_security_group(sg.clone());
    (inventory, sg)
}

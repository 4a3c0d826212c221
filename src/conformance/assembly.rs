// src/conformance/assembly.rs

//! Update and delete graphs of a security group.
//!
//! Both are assembled from the same meta-tasks; which one runs is decided by
//! `UpdateOrDeleteSecurityGroup` from the group's live deletion flag.

use std::sync::Arc;

use crate::conformance::inventory::Inventory;
use crate::conformance::model::SecurityGroup;
use crate::conformance::tasks::{
    check_label_task, delete_group_task, delete_interface_task, first_member_domain,
    mark_interface_task, member_map_propagate_task, port_group_check_task, port_group_hook_task,
};
use crate::dag::{TaskGraph, TaskGuard};
use crate::errors::Result;

/// Label checks per member, then the port-group check gated on all of
/// them, then membership propagation, then one hook check per interface.
pub fn build_update_graph(sg: &SecurityGroup, inventory: &Arc<dyn Inventory>) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();

    for member in &sg.members {
        graph.add_task(check_label_task(sg, member, false, inventory), &[])?;
    }
    graph.append_task(
        port_group_check_task(sg, false, None, inventory),
        TaskGuard::AllPredecessorsCompleted,
    )?;
    graph.append_task(
        member_map_propagate_task(sg, false, inventory),
        TaskGuard::AllPredecessorsCompleted,
    )?;
    for sgi in &sg.interfaces {
        graph.append_task(
            port_group_hook_task(sg, sgi, false, inventory),
            TaskGuard::AllPredecessorsCompleted,
        )?;
    }

    Ok(graph)
}

/// Teardown: label checks and the port-group check, interfaces marked for
/// deletion in parallel, membership propagation once both are done, hook
/// removal per interface, then each interface deleted after propagation and
/// its own hook, and finally the group itself.
pub fn build_delete_graph(sg: &SecurityGroup, inventory: &Arc<dyn Inventory>) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();

    for member in &sg.members {
        graph.add_task(check_label_task(sg, member, true, inventory), &[])?;
    }

    let domain_id = first_member_domain(inventory.as_ref(), sg)?;
    graph.append_task(
        port_group_check_task(sg, true, domain_id, inventory),
        TaskGuard::AllPredecessorsCompleted,
    )?;

    for sgi in &sg.interfaces {
        graph.add_task(mark_interface_task(sg, sgi, inventory), &[])?;
    }

    let propagate = graph.append_task(
        member_map_propagate_task(sg, true, inventory),
        TaskGuard::AllPredecessorsCompleted,
    )?;

    let mut hooks = Vec::with_capacity(sg.interfaces.len());
    for sgi in &sg.interfaces {
        let hook = graph.append_task(
            port_group_hook_task(sg, sgi, true, inventory),
            TaskGuard::AllPredecessorsCompleted,
        )?;
        hooks.push(hook);
    }

    for (sgi, hook) in sg.interfaces.iter().zip(hooks) {
        graph.add_task_with_guard(
            delete_interface_task(sg, sgi, inventory),
            TaskGuard::AllPredecessorsCompleted,
            &[propagate, hook],
        )?;
    }

    graph.append_task(delete_group_task(sg, inventory), TaskGuard::AllPredecessorsCompleted)?;

    Ok(graph)
}

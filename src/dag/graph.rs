// src/dag/graph.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::dag::guard::TaskGuard;
use crate::dag::task::{Task, TaskState};
use crate::errors::{JobgraphError, Result};
use crate::types::TaskId;

/// Directed acyclic graph of tasks.
///
/// Edges are implied by each task's predecessor list. Insertion order is
/// kept so that frontier ties break deterministically.
///
/// A graph built with [`TaskGraph::detached`] may name predecessors that do
/// not exist in it yet; those must exist in the graph it is later spliced
/// into. This is how a meta-task's expansion hangs steps off tasks of the
/// running job.
/// What a successful [`TaskGraph::splice`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Splice {
    /// Spliced task ids in insertion order.
    pub children: Vec<TaskId>,
    /// Pre-existing tasks whose dependency order moved.
    pub reordered: Vec<TaskId>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    order: Vec<TaskId>,
    tasks: HashMap<TaskId, Task>,
    successors: HashMap<TaskId, Vec<TaskId>>,
    detached: bool,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// A graph whose tasks may reference predecessors outside of it.
    pub fn detached() -> Self {
        Self {
            detached: true,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Tasks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> + '_ {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn ids(&self) -> &[TaskId] {
        &self.order
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Task> {
        self.iter().find(|t| t.name() == name)
    }

    pub fn dependencies_of(&self, id: TaskId) -> &[TaskId] {
        self.tasks
            .get(&id)
            .map(|t| t.predecessors.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: TaskId) -> &[TaskId] {
        self.successors
            .get(&id)
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    /// Insert `task` after `predecessors`, keeping the task's own guard
    /// (`AllPredecessorsCompleted` unless it was built with another one).
    pub fn add_task(&mut self, task: Task, predecessors: &[TaskId]) -> Result<TaskId> {
        let guard = task.guard;
        self.add_task_with_guard(task, guard, predecessors)
    }

    pub fn add_task_with_guard(
        &mut self,
        mut task: Task,
        guard: TaskGuard,
        predecessors: &[TaskId],
    ) -> Result<TaskId> {
        let id = task.id();

        if self.tasks.contains_key(&id) {
            return Err(JobgraphError::DuplicateTask(task.name().to_string()));
        }

        let mut preds: Vec<TaskId> = Vec::with_capacity(predecessors.len());
        for &pred in predecessors {
            if pred == id {
                return Err(JobgraphError::Cycle(format!(
                    "task '{}' cannot depend on itself",
                    task.name()
                )));
            }
            if !self.tasks.contains_key(&pred) && !self.detached {
                return Err(JobgraphError::UnknownPredecessor {
                    task: task.name().to_string(),
                    predecessor: pred.to_string(),
                });
            }
            if !preds.contains(&pred) {
                preds.push(pred);
            }
        }

        task.guard = guard;
        task.dependency_order = self.order_after(&preds);
        task.predecessors = preds;

        for pred in &task.predecessors {
            if self.tasks.contains_key(pred) {
                self.successors.entry(*pred).or_default().push(id);
            }
        }

        debug!(
            task = %task.name(),
            dependency_order = task.dependency_order,
            predecessors = task.predecessors.len(),
            guard = %guard,
            "added task to graph"
        );

        self.order.push(id);
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Sequence `task` after every current leaf of the graph.
    pub fn append_task(&mut self, task: Task, guard: TaskGuard) -> Result<TaskId> {
        let leaves = self.terminal_frontier();
        self.add_task_with_guard(task, guard, &leaves)
    }

    /// Add an edge `predecessor -> task` between two tasks already in the
    /// graph. Rejected atomically if it would close a cycle.
    pub fn add_dependency(&mut self, task: TaskId, predecessor: TaskId) -> Result<()> {
        let task_name = self.name_of(task)?;
        let pred_name = self.name_of(predecessor)?;

        if self.dependencies_of(task).contains(&predecessor) {
            return Ok(());
        }

        if task == predecessor || has_path_connecting(&self.to_digraph(), task, predecessor, None) {
            return Err(JobgraphError::Cycle(format!(
                "edge '{pred_name}' -> '{task_name}' would close a cycle"
            )));
        }

        if let Some(t) = self.tasks.get_mut(&task) {
            t.predecessors.push(predecessor);
        }
        self.successors.entry(predecessor).or_default().push(task);
        self.recompute_dependency_orders();
        Ok(())
    }

    /// Tasks that currently have no successors, in insertion order.
    pub fn terminal_frontier(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.dependents_of(*id).is_empty())
            .collect()
    }

    /// Queued tasks whose guard admits them right now, ordered by ascending
    /// dependency order then insertion order.
    ///
    /// The iterator borrows the graph, so it cannot outlive a mutation.
    pub fn ready_frontier(&self) -> impl Iterator<Item = &Task> + '_ {
        let mut ready: Vec<(u32, usize, TaskId)> = self
            .order
            .iter()
            .enumerate()
            .filter(|(_, id)| self.is_admissible(**id))
            .map(|(idx, id)| (self.tasks[id].dependency_order, idx, *id))
            .collect();
        ready.sort_unstable();
        ready.into_iter().filter_map(move |(_, _, id)| self.tasks.get(&id))
    }

    /// Whether the task is `Queued` and its guard currently admits it.
    pub fn is_admissible(&self, id: TaskId) -> bool {
        match self.tasks.get(&id) {
            Some(task) if task.state() == TaskState::Queued => {
                task.guard.admits(self.predecessor_states(task))
            }
            _ => false,
        }
    }

    /// Whether a queued task could still be admitted once in-flight
    /// predecessors settle.
    pub fn can_become_admissible(&self, id: TaskId) -> bool {
        match self.tasks.get(&id) {
            Some(task) if task.state() == TaskState::Queued => {
                task.guard.can_still_admit(self.predecessor_states(task))
            }
            _ => false,
        }
    }

    fn predecessor_states<'a>(&'a self, task: &'a Task) -> impl Iterator<Item = TaskState> + 'a {
        task.predecessors.iter().map(|p| {
            self.tasks
                .get(p)
                .map(|t| t.state())
                .unwrap_or(TaskState::Queued)
        })
    }

    /// Integrate the graph produced by the expansion of `expanding`.
    ///
    /// The successors of `expanding` are redirected to depend on the sinks of
    /// `subgraph` (its tasks without successors), so nothing downstream runs
    /// before the expansion has been carried out. Sources of `subgraph` are
    /// admissible immediately. On error the graph is left untouched.
    pub fn splice(&mut self, expanding: TaskId, subgraph: TaskGraph) -> Result<Splice> {
        let meta_name = self.name_of(expanding)?;

        if subgraph.is_empty() {
            return Ok(Splice::default());
        }

        for task in subgraph.iter() {
            if self.tasks.contains_key(&task.id()) {
                return Err(JobgraphError::DuplicateTask(task.name().to_string()));
            }
            for pred in &task.predecessors {
                if !subgraph.contains(*pred) && !self.tasks.contains_key(pred) {
                    return Err(JobgraphError::UnknownPredecessor {
                        task: task.name().to_string(),
                        predecessor: pred.to_string(),
                    });
                }
            }
        }

        let sinks: Vec<TaskId> = subgraph
            .order
            .iter()
            .copied()
            .filter(|id| subgraph.dependents_of(*id).is_empty())
            .collect();
        let redirected: Vec<TaskId> = self.dependents_of(expanding).to_vec();

        // Validate the union before touching anything.
        let mut union = self.to_digraph();
        for succ in &redirected {
            union.remove_edge(expanding, *succ);
            for sink in &sinks {
                union.add_edge(*sink, *succ, ());
            }
        }
        for task in subgraph.iter() {
            union.add_node(task.id());
            union.add_edge(expanding, task.id(), ());
            for pred in &task.predecessors {
                union.add_edge(*pred, task.id(), ());
            }
        }
        if let Err(cycle) = toposort(&union, None) {
            let culprit = self
                .tasks
                .get(&cycle.node_id())
                .or_else(|| subgraph.get(cycle.node_id()))
                .map(|t| t.name().to_string())
                .unwrap_or_else(|| cycle.node_id().to_string());
            return Err(JobgraphError::SpliceCycle(format!(
                "expanding '{meta_name}' would create a cycle involving task '{culprit}'"
            )));
        }

        // Apply.
        let TaskGraph {
            order: sub_order,
            tasks: mut sub_tasks,
            successors: sub_successors,
            ..
        } = subgraph;

        for succ in &redirected {
            if let Some(task) = self.tasks.get_mut(succ) {
                let mut preds = Vec::with_capacity(task.predecessors.len() + sinks.len());
                for pred in task.predecessors.drain(..) {
                    if pred == expanding {
                        preds.extend(sinks.iter().copied());
                    } else {
                        preds.push(pred);
                    }
                }
                preds.dedup();
                task.predecessors = preds;
            }
            for sink in &sinks {
                self.successors.entry(*sink).or_default().push(*succ);
            }
        }
        self.successors.remove(&expanding);

        for (id, succs) in sub_successors {
            self.successors.entry(id).or_default().extend(succs);
        }

        for id in &sub_order {
            if let Some(mut task) = sub_tasks.remove(id) {
                task.parent_task = Some(expanding);
                for pred in &task.predecessors {
                    if !sub_order.contains(pred) {
                        self.successors.entry(*pred).or_default().push(*id);
                    }
                }
                self.order.push(*id);
                self.tasks.insert(*id, task);
            }
        }

        if let Some(meta) = self.tasks.get_mut(&expanding) {
            meta.children.extend(sub_order.iter().copied());
        }

        let reordered: Vec<TaskId> = self
            .recompute_dependency_orders()
            .into_iter()
            .filter(|id| !sub_order.contains(id))
            .collect();

        debug!(
            task = %meta_name,
            spliced = sub_order.len(),
            redirected = redirected.len(),
            reordered = reordered.len(),
            "spliced meta-task expansion into graph"
        );

        Ok(Splice {
            children: sub_order,
            reordered,
        })
    }

    /// Insert a task exactly as persisted, bypassing predecessor checks.
    ///
    /// Used when rebuilding a graph from the store; the caller must call
    /// [`TaskGraph::finish_restore`] once all tasks are in.
    pub(crate) fn insert_restored(&mut self, task: Task) {
        let id = task.id();
        self.order.push(id);
        self.tasks.insert(id, task);
    }

    pub(crate) fn finish_restore(&mut self) -> Result<()> {
        self.successors.clear();
        for id in &self.order {
            let task = &self.tasks[id];
            for pred in &task.predecessors {
                if !self.tasks.contains_key(pred) {
                    return Err(JobgraphError::UnknownPredecessor {
                        task: task.name().to_string(),
                        predecessor: pred.to_string(),
                    });
                }
                self.successors.entry(*pred).or_default().push(*id);
            }
        }
        if let Err(cycle) = toposort(&self.to_digraph(), None) {
            return Err(JobgraphError::Cycle(format!(
                "restored graph has a cycle through '{}'",
                cycle.node_id()
            )));
        }
        Ok(())
    }

    fn name_of(&self, id: TaskId) -> Result<String> {
        self.tasks
            .get(&id)
            .map(|t| t.name().to_string())
            .ok_or_else(|| JobgraphError::TaskNotFound(id.to_string()))
    }

    fn order_after(&self, preds: &[TaskId]) -> u32 {
        preds
            .iter()
            .filter_map(|p| self.tasks.get(p))
            .map(|t| t.dependency_order + 1)
            .max()
            .unwrap_or(0)
    }

    /// Execution edges plus `parent -> child` expansion edges.
    fn to_digraph(&self) -> DiGraphMap<TaskId, ()> {
        let mut graph: DiGraphMap<TaskId, ()> = DiGraphMap::new();
        for id in &self.order {
            graph.add_node(*id);
        }
        for (id, task) in &self.tasks {
            for pred in &task.predecessors {
                if self.tasks.contains_key(pred) {
                    graph.add_edge(*pred, *id, ());
                }
            }
            if let Some(parent) = task.parent_task {
                if self.tasks.contains_key(&parent) {
                    graph.add_edge(parent, *id, ());
                }
            }
        }
        graph
    }

    /// Dependency order is one more than the highest predecessor (or
    /// expanding parent), so it strictly increases along every chain.
    /// Returns the ids whose order changed, in insertion order.
    fn recompute_dependency_orders(&mut self) -> Vec<TaskId> {
        let Ok(sorted) = toposort(&self.to_digraph(), None) else {
            return Vec::new();
        };

        let mut computed: HashMap<TaskId, u32> = HashMap::with_capacity(sorted.len());
        for id in sorted {
            let task = &self.tasks[&id];
            let upstream = task
                .predecessors
                .iter()
                .copied()
                .chain(task.parent_task)
                .filter_map(|p| computed.get(&p))
                .map(|o| o + 1)
                .max()
                .unwrap_or(0);
            computed.insert(id, upstream);
        }

        let mut changed = Vec::new();
        for id in &self.order {
            let (Some(task), Some(order)) = (self.tasks.get_mut(id), computed.get(id)) else {
                continue;
            };
            if task.dependency_order != *order {
                task.dependency_order = *order;
                changed.push(*id);
            }
        }
        changed
    }

    /// Ids of every task transitively produced by expanding `id`.
    pub fn descendants_of(&self, id: TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut stack: Vec<TaskId> = self.tasks.get(&id).map(|t| t.children.clone()).unwrap_or_default();
        let mut seen = HashSet::new();
        while let Some(child) = stack.pop() {
            if !seen.insert(child) {
                continue;
            }
            out.push(child);
            if let Some(task) = self.tasks.get(&child) {
                stack.extend(task.children.iter().copied());
            }
        }
        out
    }
}

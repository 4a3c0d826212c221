use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use proptest::prelude::*;

use jobgraph::dag::{Job, JobState, TaskGraph, TaskGuard, TaskState, TaskStatus};
use jobgraph::engine::recovery::recover;
use jobgraph::errors::JobgraphError;
use jobgraph::store::{JobRecord, MemoryStore, TaskRecord, TaskStore};
use jobgraph::types::TaskId;
use jobgraph_test_utils::builders::{scripted_registry, work_log, GraphBuilder};

/// Random DAG: task `i` may only depend on tasks `0..i`.
#[derive(Debug, Clone)]
pub struct DagShape {
    pub deps: Vec<Vec<usize>>,
    pub any: Vec<bool>,
}

pub fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = DagShape> {
    (1..=max_tasks).prop_flat_map(|n| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), n),
            proptest::collection::vec(any::<bool>(), n),
        )
            .prop_map(|(raw, any)| {
                let deps = raw
                    .into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        let mut deps: Vec<usize> = if i == 0 {
                            Vec::new()
                        } else {
                            picks.into_iter().map(|p| p % i).collect()
                        };
                        deps.sort_unstable();
                        deps.dedup();
                        deps
                    })
                    .collect();
                DagShape { deps, any }
            })
    })
}

pub fn task_name(i: usize) -> String {
    format!("t{i}")
}

pub fn build_graph(shape: &DagShape, failing: &HashSet<usize>) -> (TaskGraph, HashMap<String, TaskId>) {
    let log = work_log();
    let mut builder = GraphBuilder::new(&log);
    for (i, deps) in shape.deps.iter().enumerate() {
        let name = task_name(i);
        let after: Vec<String> = deps.iter().map(|d| task_name(*d)).collect();
        let after: Vec<&str> = after.iter().map(String::as_str).collect();
        builder = if failing.contains(&i) {
            builder.failing(&name, "scripted failure", &after)
        } else if shape.any[i] {
            builder.any_of(&name, &after)
        } else {
            builder.task(&name, &after)
        };
    }
    builder.build()
}

fn state_from(code: u8) -> (TaskState, TaskStatus) {
    match code {
        0 => (TaskState::Queued, TaskStatus::Pending),
        1 => (TaskState::Running, TaskStatus::Pending),
        2 => (TaskState::Completed, TaskStatus::Passed),
        _ => (TaskState::Failed, TaskStatus::Failed),
    }
}

/// Persist `graph` with the given task states and rebuild it through
/// recovery, which is how a graph with arbitrary states is obtained.
fn restore_with_states(graph: TaskGraph, codes: &[u8]) -> Job {
    let log = work_log();
    let store = Arc::new(MemoryStore::new());
    let job = Job::new("property", graph);

    let mut job_record = JobRecord::from_job(&job);
    job_record.state = JobState::Running;
    store.save_job(&job_record).unwrap();

    for (seq, task) in job.graph().iter().enumerate() {
        let mut record = TaskRecord::from_task(job.id(), task, job.graph(), seq);
        let (state, status) = state_from(codes[seq]);
        record.state = state;
        record.status = status;
        if state == TaskState::Failed {
            record.fail_reason = Some("scripted failure".to_string());
        }
        store.save_task(&record).unwrap();
    }

    let mut jobs = recover(store.as_ref(), &scripted_registry(&log)).unwrap();
    assert_eq!(jobs.len(), 1);
    jobs.remove(0)
}

fn reaches(graph: &TaskGraph, from: TaskId, to: TaskId) -> bool {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([from]);
    while let Some(id) = queue.pop_front() {
        if id == to {
            return true;
        }
        if seen.insert(id) {
            queue.extend(graph.dependents_of(id).iter().copied());
        }
    }
    false
}

fn assert_orders_consistent(graph: &TaskGraph) -> Result<(), TestCaseError> {
    for task in graph.iter() {
        let expected = task
            .predecessors()
            .iter()
            .filter_map(|p| graph.get(*p))
            .map(|p| p.dependency_order() + 1)
            .max()
            .unwrap_or(0);
        prop_assert_eq!(task.dependency_order(), expected, "order of {}", task.name());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn frontier_matches_guard_semantics(
        (shape, codes) in dag_strategy(12).prop_flat_map(|shape| {
            let n = shape.deps.len();
            (Just(shape), proptest::collection::vec(0u8..4, n))
        })
    ) {
        let (graph, _) = build_graph(&shape, &HashSet::new());
        let job = restore_with_states(graph, &codes);
        let graph = job.graph();

        // Running tasks come back queued after a restart.
        let effective: Vec<TaskState> = codes
            .iter()
            .map(|c| match state_from(*c).0 {
                TaskState::Running => TaskState::Queued,
                s => s,
            })
            .collect();

        let mut expected: Vec<(u32, usize)> = Vec::new();
        for (i, deps) in shape.deps.iter().enumerate() {
            if effective[i] != TaskState::Queued {
                continue;
            }
            let completed = deps.iter().filter(|d| effective[**d] == TaskState::Completed).count();
            let admitted = deps.is_empty()
                || if shape.any[i] { completed > 0 } else { completed == deps.len() };
            if admitted {
                let order = graph
                    .find_by_name(&task_name(i))
                    .map(|t| t.dependency_order())
                    .unwrap_or_default();
                expected.push((order, i));
            }
        }
        expected.sort_unstable();
        let expected: Vec<String> = expected.into_iter().map(|(_, i)| task_name(i)).collect();

        let frontier: Vec<String> = graph.ready_frontier().map(|t| t.name().to_string()).collect();
        prop_assert_eq!(frontier, expected);

        for (i, state) in effective.iter().enumerate() {
            let task = graph.find_by_name(&task_name(i)).unwrap();
            prop_assert_eq!(task.state(), *state);
            let guard = if shape.any[i] {
                TaskGuard::AnyPredecessorCompleted
            } else {
                TaskGuard::AllPredecessorsCompleted
            };
            prop_assert_eq!(task.guard(), guard);
        }
    }

    #[test]
    fn dependency_order_increases_along_edges(shape in dag_strategy(16)) {
        let (graph, _) = build_graph(&shape, &HashSet::new());
        assert_orders_consistent(&graph)?;
        prop_assert_eq!(graph.len(), shape.deps.len());
    }

    #[test]
    fn added_dependencies_never_close_a_cycle(
        shape in dag_strategy(10),
        edges in proptest::collection::vec((any::<usize>(), any::<usize>()), 1..12),
    ) {
        let (mut graph, ids) = build_graph(&shape, &HashSet::new());
        let n = shape.deps.len();

        for (x, y) in edges {
            let task = ids[&task_name(x % n)];
            let pred = ids[&task_name(y % n)];
            let before = graph.dependencies_of(task).to_vec();
            let closes_cycle = reaches(&graph, task, pred);

            match graph.add_dependency(task, pred) {
                Ok(()) => {
                    prop_assert!(!closes_cycle || before.contains(&pred));
                    prop_assert!(graph.dependencies_of(task).contains(&pred));
                }
                Err(JobgraphError::Cycle(_)) => {
                    prop_assert!(closes_cycle);
                    prop_assert_eq!(graph.dependencies_of(task), before.as_slice());
                }
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
            assert_orders_consistent(&graph)?;
        }
    }
}

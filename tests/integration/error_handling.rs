// tests/integration/error_handling.rs

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;

use jobgraph::config::{load_and_validate, load_or_default};
use jobgraph::dag::{Job, JobState, Task, TaskGraph, TaskState};
use jobgraph::engine::{CoreRuntime, RuntimeEvent, TaskOutcome};
use jobgraph::errors::JobgraphError;
use jobgraph::registry::WorkRegistry;
use jobgraph::store::MemoryStore;
use jobgraph::types::TaskId;
use jobgraph_test_utils::builders::{work_log, GraphBuilder, ScriptedWork};

use crate::common::{dispatched, names, options};

fn scripted(label: &str) -> Task {
    Task::work(
        label,
        ScriptedWork {
            label: label.to_string(),
            fail_with: None,
            log: work_log(),
        },
    )
}

#[test]
fn closing_edge_is_rejected_and_graph_unchanged() {
    let log = work_log();
    let (mut graph, ids) = GraphBuilder::new(&log)
        .task("a", &[])
        .task("b", &["a"])
        .task("c", &["b"])
        .build();

    match graph.add_dependency(ids["a"], ids["c"]) {
        Err(JobgraphError::Cycle(msg)) => {
            assert!(msg.contains("'c' -> 'a'"), "unexpected message: {msg}");
        }
        other => panic!("expected Cycle error, got: {other:?}"),
    }
    assert!(graph.dependencies_of(ids["a"]).is_empty());
    assert!(graph.dependents_of(ids["c"]).is_empty());

    assert!(matches!(
        graph.add_dependency(ids["b"], ids["b"]),
        Err(JobgraphError::Cycle(_))
    ));

    // A forward edge is fine and lifts the dependency order.
    graph.add_dependency(ids["c"], ids["a"]).expect("forward edge");
    assert_eq!(graph.dependencies_of(ids["c"]), [ids["b"], ids["a"]]);
    assert_eq!(graph.get(ids["c"]).map(|t| t.dependency_order()), Some(2));
}

#[test]
fn unknown_predecessor_is_rejected() {
    let mut graph = TaskGraph::new();
    let missing = TaskId::new();

    match graph.add_task(scripted("orphan"), &[missing]) {
        Err(JobgraphError::UnknownPredecessor { task, predecessor }) => {
            assert_eq!(task, "orphan");
            assert_eq!(predecessor, missing.to_string());
        }
        other => panic!("expected UnknownPredecessor, got: {other:?}"),
    }
    assert!(graph.is_empty());
}

#[test]
fn splice_closing_a_cycle_fails_the_meta_task() {
    let log = work_log();
    let (graph, ids) = GraphBuilder::new(&log)
        .meta("m", &[], &[])
        .task("z", &["m"])
        .build();
    let job = Job::new("bad expansion", graph);
    let job_id = job.id();

    let mut core = CoreRuntime::new(Arc::new(MemoryStore::new()), options(4));
    let step = core.step(RuntimeEvent::JobSubmitted(job));
    assert_eq!(dispatched(&step), names(&["m"]));

    // The expansion hangs a step off `z`, which itself waits for the
    // expansion.
    let mut subgraph = TaskGraph::detached();
    subgraph
        .add_task(scripted("loop"), &[ids["z"]])
        .expect("detached graph accepts outside predecessors");

    let step = core.step(RuntimeEvent::TaskFinished {
        job: job_id,
        task: ids["m"],
        outcome: TaskOutcome::Expanded(subgraph),
    });
    assert!(dispatched(&step).is_empty());

    let job = core.job(job_id).expect("job");
    assert_eq!(job.graph().len(), 2);
    let m = job.graph().get(ids["m"]).expect("m");
    assert_eq!(m.state(), TaskState::Failed);
    assert!(m.children().is_empty());
    let reason = m.fail_reason().unwrap_or_default();
    assert!(reason.starts_with("expansion rejected: Splice would create a cycle"), "{reason}");
    assert_eq!(job.state(), JobState::Failed);
}

#[test]
fn empty_expansion_completes_the_meta_task() {
    let log = work_log();
    let (graph, ids) = GraphBuilder::new(&log)
        .meta("m", &[], &[])
        .task("z", &["m"])
        .build();
    let job = Job::new("noop expansion", graph);
    let job_id = job.id();

    let mut core = CoreRuntime::new(Arc::new(MemoryStore::new()), options(4));
    core.step(RuntimeEvent::JobSubmitted(job));
    let step = core.step(RuntimeEvent::TaskFinished {
        job: job_id,
        task: ids["m"],
        outcome: TaskOutcome::Expanded(TaskGraph::new()),
    });

    assert_eq!(dispatched(&step), names(&["z"]));
    let m = core.job(job_id).and_then(|j| j.graph().get(ids["m"])).expect("m");
    assert_eq!(m.state(), TaskState::Completed);
}

#[test]
fn unknown_task_kind_is_reported() {
    let registry = WorkRegistry::new();
    match registry.build("sg.unheard_of", &serde_json::Value::Null) {
        Err(JobgraphError::UnknownTaskKind(kind)) => assert_eq!(kind, "sg.unheard_of"),
        Err(e) => panic!("expected UnknownTaskKind, got: {e:?}"),
        Ok(_) => panic!("expected error, got Ok"),
    }
}

#[test]
fn explicit_missing_config_path_is_an_io_error() {
    let result = load_or_default("definitely/not/here/Jobgraph.toml");
    assert!(matches!(result, Err(JobgraphError::IoError(_))));
}

#[test]
fn zero_workers_is_a_config_error() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[engine]
worker_count = 0
"#
    )
    .unwrap();

    match load_and_validate(file.path()) {
        Err(JobgraphError::ConfigError(msg)) => assert!(msg.contains("worker_count")),
        Err(e) => panic!("expected ConfigError, got: {e:?}"),
        Ok(_) => panic!("expected error, got Ok"),
    }
}

#[test]
fn unknown_config_key_is_a_toml_error() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[engine]
workers = 2
"#
    )
    .unwrap();

    assert!(matches!(
        load_and_validate(file.path()),
        Err(JobgraphError::TomlError(_))
    ));
}

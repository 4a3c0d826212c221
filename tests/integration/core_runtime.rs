// tests/integration/core_runtime.rs
//
// Drives the pure core one event at a time.

use std::sync::Arc;

use jobgraph::dag::{Job, JobState, TaskState, TaskStatus};
use jobgraph::engine::{CoreCommand, CoreRuntime, CoreStep, RuntimeEvent, TaskOutcome};
use jobgraph::store::{MemoryStore, TaskStore};
use jobgraph::types::{JobId, TaskId};
use jobgraph_test_utils::builders::{object, work_log, GraphBuilder};
use jobgraph_test_utils::init_tracing;

use crate::common::{dispatched, names, options};

fn finished(job: JobId, task: TaskId, outcome: TaskOutcome) -> RuntimeEvent {
    RuntimeEvent::TaskFinished { job, task, outcome }
}

fn retry_scheduled(step: &CoreStep) -> bool {
    step.commands
        .iter()
        .any(|c| matches!(c, CoreCommand::ScheduleRetry(_)))
}

#[test]
fn rejected_outcome_is_kept_until_it_persists() {
    init_tracing();
    let log = work_log();
    let (graph, ids) = GraphBuilder::new(&log).task("a", &[]).task("b", &["a"]).build();
    let job = Job::new("retry", graph);
    let job_id = job.id();

    let store = Arc::new(MemoryStore::new());
    let mut core = CoreRuntime::new(store.clone(), options(4));

    let step = core.step(RuntimeEvent::JobSubmitted(job));
    assert_eq!(dispatched(&step), names(&["a"]));

    store.set_fail_writes(true);
    let step = core.step(finished(job_id, ids["a"], TaskOutcome::Completed));

    assert!(step.keep_running);
    assert!(dispatched(&step).is_empty());
    assert!(retry_scheduled(&step));

    // The work already ran: the task stays running and occupies its worker.
    let a = core.job(job_id).and_then(|j| j.graph().get(ids["a"])).expect("a");
    assert_eq!(a.state(), TaskState::Running);
    assert_eq!(a.status(), TaskStatus::Pending);
    assert_eq!(core.in_flight(), 1);

    // The durable record still shows the last write that went through.
    let records = store.find_tasks_by_job_id(job_id).expect("records");
    let durable_a = records.iter().find(|r| r.name == "a").expect("record for a");
    assert_eq!(durable_a.state, TaskState::Running);

    // Still failing: the outcome is kept for the next attempt.
    let step = core.step(RuntimeEvent::Tick);
    assert!(dispatched(&step).is_empty());
    assert!(retry_scheduled(&step));

    store.set_fail_writes(false);
    let step = core.step(RuntimeEvent::Tick);
    assert_eq!(dispatched(&step), names(&["b"]));
    assert!(!retry_scheduled(&step));

    let a = core.job(job_id).and_then(|j| j.graph().get(ids["a"])).expect("a");
    assert_eq!(a.state(), TaskState::Completed);
    let records = store.find_tasks_by_job_id(job_id).expect("records");
    let durable_a = records.iter().find(|r| r.name == "a").expect("record for a");
    assert_eq!(durable_a.state, TaskState::Completed);

    let step = core.step(finished(job_id, ids["b"], TaskOutcome::Completed));
    assert!(!step.keep_running);
    assert_eq!(core.job(job_id).map(Job::state), Some(JobState::Completed));
}

#[test]
fn failed_lock_holder_releases_to_waiting_job() {
    init_tracing();
    let log = work_log();
    let (first, first_ids) = GraphBuilder::new(&log)
        .with_objects("a1", &[], &["sg"])
        .with_objects("a2", &["a1"], &["sg"])
        .build();
    let (second, second_ids) = GraphBuilder::new(&log).with_objects("b1", &[], &["sg"]).build();
    let first = Job::new("first", first);
    let second = Job::new("second", second);
    let (first_id, second_id) = (first.id(), second.id());

    let mut core = CoreRuntime::new(Arc::new(MemoryStore::new()), options(4));
    let step = core.step(RuntimeEvent::JobSubmitted(first));
    assert_eq!(dispatched(&step), names(&["a1"]));
    let step = core.step(RuntimeEvent::JobSubmitted(second));
    assert!(dispatched(&step).is_empty());
    assert_eq!(core.locks().holder_of(&object("sg")), Some(first_id));

    // a2 is still queued but can never run, so the first job fails and the
    // object goes to the second job within the same step.
    let step = core.step(finished(
        first_id,
        first_ids["a1"],
        TaskOutcome::Failed("quota exceeded".to_string()),
    ));
    assert_eq!(dispatched(&step), names(&["b1"]));
    assert!(step.keep_running);
    assert_eq!(core.job(first_id).map(Job::state), Some(JobState::Failed));
    assert_eq!(core.locks().holder_of(&object("sg")), Some(second_id));

    let step = core.step(finished(second_id, second_ids["b1"], TaskOutcome::Completed));
    assert!(!step.keep_running);
    assert_eq!(core.job(second_id).map(Job::state), Some(JobState::Completed));
    assert!(core.locks().is_empty());
}

#[test]
fn cancelled_job_hands_its_locks_over_once_its_work_returns() {
    init_tracing();
    let log = work_log();
    let (first, first_ids) = GraphBuilder::new(&log)
        .with_objects("a1", &[], &["sg"])
        .with_objects("a2", &["a1"], &["sg"])
        .build();
    let (second, _) = GraphBuilder::new(&log).with_objects("b1", &[], &["sg"]).build();
    let first = Job::new("first", first);
    let second = Job::new("second", second);
    let (first_id, second_id) = (first.id(), second.id());

    let mut core = CoreRuntime::new(Arc::new(MemoryStore::new()), options(4));
    core.step(RuntimeEvent::JobSubmitted(first));
    core.step(RuntimeEvent::JobSubmitted(second));

    let step = core.step(RuntimeEvent::CancelJob {
        job: first_id,
        reason: "operator request".to_string(),
    });
    assert_eq!(core.job(first_id).map(Job::state), Some(JobState::Failed));
    // a1's work has not returned yet, so the object stays taken.
    assert!(dispatched(&step).is_empty());
    assert_eq!(core.locks().holder_of(&object("sg")), Some(first_id));

    let step = core.step(finished(first_id, first_ids["a1"], TaskOutcome::Completed));
    assert_eq!(dispatched(&step), names(&["b1"]));
    assert_eq!(core.locks().holder_of(&object("sg")), Some(second_id));

    let a1 = core.job(first_id).and_then(|j| j.graph().get(first_ids["a1"])).expect("a1");
    assert_eq!(a1.status(), TaskStatus::Aborted);
}

#[test]
fn unpersistable_submission_is_rejected() {
    init_tracing();
    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log).task("a", &[]).build();
    let job = Job::new("rejected", graph);
    let job_id = job.id();

    let store = Arc::new(MemoryStore::new());
    store.set_fail_writes(true);
    let mut core = CoreRuntime::new(store.clone(), options(4));

    let step = core.step(RuntimeEvent::JobSubmitted(job));

    assert!(step
        .commands
        .iter()
        .any(|c| matches!(c, CoreCommand::JobRejected { job, .. } if *job == job_id)));
    assert!(dispatched(&step).is_empty());
    assert!(core.job(job_id).is_none());
    assert!(core.is_idle());
    assert!(!step.keep_running);
    assert!(store.find_job(job_id).expect("read").is_none());
}

#[test]
fn worker_count_caps_tasks_in_flight() {
    init_tracing();
    let log = work_log();
    let (graph, ids) = GraphBuilder::new(&log)
        .task("t0", &[])
        .task("t1", &[])
        .task("t2", &[])
        .task("t3", &[])
        .task("t4", &[])
        .build();
    let job = Job::new("capped", graph);
    let job_id = job.id();

    let mut core = CoreRuntime::new(Arc::new(MemoryStore::new()), options(2));

    let step = core.step(RuntimeEvent::JobSubmitted(job));
    assert_eq!(dispatched(&step), names(&["t0", "t1"]));
    assert_eq!(core.in_flight(), 2);

    let step = core.step(finished(job_id, ids["t0"], TaskOutcome::Completed));
    assert_eq!(dispatched(&step), names(&["t2"]));
    assert_eq!(core.in_flight(), 2);

    let step = core.step(finished(job_id, ids["t1"], TaskOutcome::Completed));
    assert_eq!(dispatched(&step), names(&["t3"]));
    let step = core.step(finished(job_id, ids["t2"], TaskOutcome::Completed));
    assert_eq!(dispatched(&step), names(&["t4"]));
    core.step(finished(job_id, ids["t3"], TaskOutcome::Completed));
    let step = core.step(finished(job_id, ids["t4"], TaskOutcome::Completed));

    assert!(step.commands.iter().any(|c| matches!(
        c,
        CoreCommand::JobFinished { state: JobState::Completed, .. }
    )));
    assert!(step.commands.iter().any(|c| matches!(c, CoreCommand::RequestExit)));
    assert!(!step.keep_running);
}

#[test]
fn cancellation_aborts_tasks_and_ignores_late_reports() {
    init_tracing();
    let log = work_log();
    let (graph, ids) = GraphBuilder::new(&log)
        .task("a", &[])
        .task("b", &[])
        .task("c", &["a", "b"])
        .build();
    let job = Job::new("cancelled", graph);
    let job_id = job.id();

    let mut core = CoreRuntime::new(Arc::new(MemoryStore::new()), options(4));

    let step = core.step(RuntimeEvent::JobSubmitted(job));
    let contexts: Vec<_> = step
        .commands
        .iter()
        .filter_map(|c| match c {
            CoreCommand::DispatchTasks(tasks) => Some(tasks.clone()),
            _ => None,
        })
        .flatten()
        .map(|t| t.context)
        .collect();
    assert_eq!(contexts.len(), 2);
    assert!(contexts.iter().all(|ctx| !ctx.is_cancelled()));

    let step = core.step(RuntimeEvent::CancelJob {
        job: job_id,
        reason: "operator request".to_string(),
    });

    assert!(step.commands.iter().any(|c| matches!(
        c,
        CoreCommand::JobFinished { state: JobState::Failed, .. }
    )));
    // Two reports are still outstanding.
    assert!(step.keep_running);
    assert!(contexts.iter().all(|ctx| ctx.is_cancelled()));

    let job = core.job(job_id).expect("job");
    for task in job.graph().iter() {
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.status(), TaskStatus::Aborted);
        assert_eq!(task.fail_reason(), Some("operator request"));
    }

    core.step(finished(job_id, ids["a"], TaskOutcome::Completed));
    let a = core.job(job_id).and_then(|j| j.graph().get(ids["a"])).expect("a");
    assert_eq!(a.status(), TaskStatus::Aborted);

    let step = core.step(finished(job_id, ids["b"], TaskOutcome::Completed));
    assert!(dispatched(&step).is_empty());
    assert!(!step.keep_running);
    assert_eq!(core.job(job_id).map(Job::state), Some(JobState::Failed));
}

#[test]
fn duplicate_submission_is_ignored() {
    init_tracing();
    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log).task("a", &[]).build();
    let job = Job::new("once", graph);
    let job_id = job.id();
    let (other_graph, _) = GraphBuilder::new(&log).task("x", &[]).build();
    let duplicate = Job::new("twice", other_graph).with_id(job_id);

    let mut core = CoreRuntime::new(Arc::new(MemoryStore::new()), options(4));
    core.step(RuntimeEvent::JobSubmitted(job));
    let step = core.step(RuntimeEvent::JobSubmitted(duplicate));

    assert!(dispatched(&step).is_empty());
    assert_eq!(core.jobs().count(), 1);
    assert_eq!(core.job(job_id).map(Job::name), Some("once"));
}

#[test]
fn shutdown_stops_without_failing_running_tasks() {
    init_tracing();
    let log = work_log();
    let (graph, ids) = GraphBuilder::new(&log).task("a", &[]).build();
    let job = Job::new("interrupted", graph);
    let job_id = job.id();

    let store = Arc::new(MemoryStore::new());
    let mut core = CoreRuntime::new(store.clone(), options(4));
    core.step(RuntimeEvent::JobSubmitted(job));

    let step = core.step(RuntimeEvent::ShutdownRequested);

    assert!(!step.keep_running);
    let a = core.job(job_id).and_then(|j| j.graph().get(ids["a"])).expect("a");
    assert_eq!(a.state(), TaskState::Running);
    let durable = store.find_uncompleted_tasks().expect("records");
    assert_eq!(durable.len(), 1);
    assert_eq!(durable[0].state, TaskState::Running);
}

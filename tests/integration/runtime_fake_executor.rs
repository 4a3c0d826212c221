// tests/integration/runtime_fake_executor.rs

use std::sync::Arc;

use jobgraph::dag::{Job, JobState, TaskState, TaskStatus};
use jobgraph::report::project_job;
use jobgraph::store::{MemoryStore, TaskStore};
use jobgraph_test_utils::builders::{logged, object, work_log, GraphBuilder};
use jobgraph_test_utils::init_tracing;

use crate::common::{names, options, run_with_fake, TestResult};

#[tokio::test]
async fn diamond_runs_in_dependency_order() -> TestResult {
    init_tracing();
    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log)
        .task("a", &[])
        .task("b", &["a"])
        .task("c", &["a"])
        .task("d", &["b", "c"])
        .build();
    let job = Job::new("diamond", graph);
    let job_id = job.id();

    let store = Arc::new(MemoryStore::new());
    let outcome = run_with_fake(store.clone(), options(4), vec![job], |e| e).await?;

    assert_eq!(outcome.dispatched, names(&["a", "b", "c", "d"]));
    assert_eq!(logged(&log), names(&["a", "b", "c", "d"]));

    let job = outcome.core.job(job_id).expect("job kept after finishing");
    assert_eq!(job.state(), JobState::Completed);
    assert!(job.completed_at() >= job.started_at());

    let report = project_job(store.as_ref(), job_id)?;
    assert_eq!(report.state, JobState::Completed);
    assert!(report.tasks.iter().all(|t| t.state == TaskState::Completed));
    assert_eq!(report.find("d").map(|t| t.dependency_order), Some(2));
    assert_eq!(report.find("d").map(|t| t.predecessors.clone()), Some(vec![1, 1]));
    Ok(())
}

#[tokio::test]
async fn failed_predecessor_blocks_all_guard_and_fails_job() -> TestResult {
    init_tracing();
    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log)
        .task("a", &[])
        .failing("b", "boom", &["a"])
        .task("c", &["a"])
        .task("d", &["b", "c"])
        .build();
    let job = Job::new("blocked", graph);
    let job_id = job.id();

    let store = Arc::new(MemoryStore::new());
    let outcome = run_with_fake(store.clone(), options(4), vec![job], |e| e).await?;

    assert_eq!(outcome.dispatched, names(&["a", "b", "c"]));

    let job = outcome.core.job(job_id).expect("job");
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.failure_reasons(), ["boom".to_string()]);

    let d = job.graph().find_by_name("d").expect("d");
    assert_eq!(d.state(), TaskState::Queued);
    assert_eq!(job.blocked_tasks(), vec![d.id()]);

    let b = job.graph().find_by_name("b").expect("b");
    assert_eq!(b.status(), TaskStatus::Failed);
    assert_eq!(b.fail_reason(), Some("boom"));

    let failures = store.find_failures_since(None)?;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, "boom");
    assert_eq!(failures[0].count, 1);
    Ok(())
}

#[tokio::test]
async fn any_guard_runs_after_one_predecessor_completes() -> TestResult {
    init_tracing();
    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log)
        .failing("primary", "primary down", &[])
        .task("fallback", &[])
        .any_of("publish", &["primary", "fallback"])
        .build();
    let job = Job::new("any", graph);
    let job_id = job.id();

    let outcome = run_with_fake(Arc::new(MemoryStore::new()), options(4), vec![job], |e| e).await?;

    assert_eq!(outcome.dispatched, names(&["primary", "fallback", "publish"]));

    let job = outcome.core.job(job_id).expect("job");
    let publish = job.graph().find_by_name("publish").expect("publish");
    assert_eq!(publish.state(), TaskState::Completed);
    // One task failed, so the job as a whole did not complete.
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.failure_reasons(), ["primary down".to_string()]);
    Ok(())
}

#[tokio::test]
async fn meta_task_expansion_runs_before_successors() -> TestResult {
    init_tracing();
    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log)
        .meta("m", &["s1", "s2"], &[])
        .task("after", &["m"])
        .build();
    let job = Job::new("expand", graph);
    let job_id = job.id();

    let store = Arc::new(MemoryStore::new());
    let outcome = run_with_fake(store.clone(), options(4), vec![job], |e| e).await?;

    assert_eq!(logged(&log), names(&["m", "s1", "s2", "after"]));

    let job = outcome.core.job(job_id).expect("job");
    assert_eq!(job.state(), JobState::Completed);
    assert_eq!(job.graph().len(), 4);

    let m = job.graph().find_by_name("m").expect("m");
    assert_eq!(m.state(), TaskState::Completed);
    assert_eq!(m.children().len(), 2);

    let after = job.graph().find_by_name("after").expect("after");
    assert_eq!(after.predecessors(), m.children());
    assert_eq!(after.dependency_order(), 2);

    let report = project_job(store.as_ref(), job_id)?;
    assert_eq!(report.tasks.len(), 2);
    assert_eq!(report.task_count(), 4);
    let children: Vec<&str> = report
        .find("m")
        .map(|m| m.children.iter().map(|c| c.name.as_str()).collect())
        .unwrap_or_default();
    assert_eq!(children, vec!["s1", "s2"]);
    Ok(())
}

#[tokio::test]
async fn failing_expansion_child_fails_meta_task() -> TestResult {
    init_tracing();
    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log)
        .meta("m", &["s1", "s2"], &[])
        .task("after", &["m"])
        .build();
    let job = Job::new("expand", graph);
    let job_id = job.id();

    let outcome = run_with_fake(Arc::new(MemoryStore::new()), options(4), vec![job], |e| {
        e.fail("s2", "no capacity")
    })
    .await?;

    let job = outcome.core.job(job_id).expect("job");
    assert_eq!(job.state(), JobState::Failed);

    let m = job.graph().find_by_name("m").expect("m");
    assert_eq!(m.state(), TaskState::Failed);
    assert_eq!(m.fail_reason(), Some("child task 's2' failed: no capacity"));

    let after = job.graph().find_by_name("after").expect("after");
    assert_eq!(after.state(), TaskState::Queued);
    assert!(!outcome.dispatched.contains(&"after".to_string()));
    Ok(())
}

#[tokio::test]
async fn abort_policy_cancels_remaining_tasks() -> TestResult {
    init_tracing();
    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log)
        .aborting("a", "fatal", &[])
        .task("b", &[])
        .task("c", &["b"])
        .build();
    let job = Job::new("abort", graph);
    let job_id = job.id();

    let outcome = run_with_fake(Arc::new(MemoryStore::new()), options(1), vec![job], |e| e).await?;

    assert_eq!(outcome.dispatched, names(&["a"]));

    let job = outcome.core.job(job_id).expect("job");
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.cancel_reason(), Some("task 'a' failed: fatal"));
    for name in ["b", "c"] {
        let task = job.graph().find_by_name(name).expect("task");
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.status(), TaskStatus::Aborted);
        assert_eq!(task.fail_reason(), Some("task 'a' failed: fatal"));
    }
    Ok(())
}

#[tokio::test]
async fn jobs_sharing_an_object_are_serialized() -> TestResult {
    init_tracing();
    let log = work_log();
    let (first, _) = GraphBuilder::new(&log)
        .with_objects("a1", &[], &["sg"])
        .with_objects("a2", &["a1"], &["sg"])
        .build();
    let (second, _) = GraphBuilder::new(&log)
        .with_objects("b1", &[], &["sg"])
        .build();
    let (unrelated, _) = GraphBuilder::new(&log)
        .with_objects("c1", &[], &["other"])
        .build();

    let jobs = vec![
        Job::new("first", first),
        Job::new("second", second),
        Job::new("unrelated", unrelated),
    ];
    let ids: Vec<_> = jobs.iter().map(Job::id).collect();

    let outcome = run_with_fake(Arc::new(MemoryStore::new()), options(4), jobs, |e| e).await?;

    let position = |name: &str| outcome.dispatched.iter().position(|n| n == name);
    assert!(position("a2") < position("b1"));
    assert!(position("c1") < position("b1"));
    assert_eq!(outcome.dispatched.len(), 4);

    for id in ids {
        assert_eq!(outcome.core.job(id).map(Job::state), Some(JobState::Completed));
    }
    assert!(outcome.core.locks().is_empty());
    assert!(outcome.core.locks().holder_of(&object("sg")).is_none());
    Ok(())
}

#[tokio::test]
async fn failed_lock_holder_does_not_stall_waiting_job() -> TestResult {
    init_tracing();
    let log = work_log();
    let (first, _) = GraphBuilder::new(&log)
        .with_objects("a1", &[], &["sg"])
        .with_objects("a2", &["a1"], &["sg"])
        .build();
    let (second, _) = GraphBuilder::new(&log)
        .with_objects("b1", &[], &["sg"])
        .build();
    let first = Job::new("first", first);
    let second = Job::new("second", second);
    let (first_id, second_id) = (first.id(), second.id());

    let outcome = run_with_fake(
        Arc::new(MemoryStore::new()),
        options(4),
        vec![first, second],
        |e| e.fail("a1", "quota exceeded"),
    )
    .await?;

    assert_eq!(outcome.dispatched, names(&["a1", "b1"]));

    let first = outcome.core.job(first_id).expect("first job");
    assert_eq!(first.state(), JobState::Failed);
    let a2 = first.graph().find_by_name("a2").expect("a2");
    assert_eq!(a2.state(), TaskState::Queued);

    assert_eq!(outcome.core.job(second_id).map(Job::state), Some(JobState::Completed));
    assert!(outcome.core.locks().is_empty());
    Ok(())
}

#[tokio::test]
async fn expansion_persists_shifted_dependency_orders() -> TestResult {
    init_tracing();
    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log)
        .meta("m", &["s1"], &[])
        .task("after", &["m"])
        .task("tail", &["after"])
        .build();
    let job = Job::new("reordered", graph);
    let job_id = job.id();

    let store = Arc::new(MemoryStore::new());
    let outcome = run_with_fake(store.clone(), options(4), vec![job], |e| {
        e.fail("s1", "no capacity")
    })
    .await?;

    // The job fails with "tail" never run; its record must still match the
    // graph it ended with.
    let job = outcome.core.job(job_id).expect("job");
    assert_eq!(job.state(), JobState::Failed);
    let tail = job.graph().find_by_name("tail").expect("tail");
    assert_eq!(tail.state(), TaskState::Queued);
    assert_eq!(tail.dependency_order(), 3);

    let records = store.find_tasks_by_job_id(job_id)?;
    let record = |name: &str| {
        records
            .iter()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("no record for '{name}'"))
    };
    assert_eq!(record("after").dependency_order, 2);
    assert_eq!(record("tail").dependency_order, 3);
    assert_eq!(record("tail").predecessor_orders, vec![2]);

    let orders: Vec<u32> = records.iter().map(|r| r.dependency_order).collect();
    let mut sorted = orders.clone();
    sorted.sort_unstable();
    assert_eq!(orders, sorted);
    Ok(())
}

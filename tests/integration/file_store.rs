// tests/integration/file_store.rs

use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::tempdir;

use jobgraph::dag::{Job, JobState, TaskState};
use jobgraph::fs::mock::MockFileSystem;
use jobgraph::report::{project_job, project_jobs};
use jobgraph::store::{FileStore, TaskStore};
use jobgraph::types::StoreMode;
use jobgraph_test_utils::builders::{work_log, ConfigFileBuilder, GraphBuilder};
use jobgraph_test_utils::init_tracing;

use crate::common::{options, run_with_fake, TestResult};

#[tokio::test]
async fn outcomes_survive_reopening_the_store() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("state").join("store.json");
    let log = work_log();

    let (ok_graph, _) = GraphBuilder::new(&log).task("a", &[]).task("b", &["a"]).build();
    let (bad_graph, _) = GraphBuilder::new(&log)
        .failing("x", "disk full", &[])
        .failing("y", "disk full", &[])
        .build();
    let ok = Job::new("ok", ok_graph);
    let bad = Job::new("bad", bad_graph);
    let (ok_id, bad_id) = (ok.id(), bad.id());

    let started = Utc::now() - Duration::seconds(1);
    {
        let store = Arc::new(FileStore::open(&path)?);
        run_with_fake(store, options(4), vec![ok, bad], |e| e).await?;
    }
    assert!(path.exists());

    let reopened = FileStore::open(&path)?;

    let report = project_job(&reopened, ok_id)?;
    assert_eq!(report.state, JobState::Completed);
    assert!(report.tasks.iter().all(|t| t.state == TaskState::Completed));
    assert!(report.completed_at.is_some());

    let report = project_job(&reopened, bad_id)?;
    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.failure_reasons, vec!["disk full".to_string()]);

    let all = project_jobs(&reopened)?;
    assert_eq!(all.len(), 2);

    let failures = reopened.find_failures_since(Some(started))?;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, "disk full");
    assert_eq!(failures[0].count, 2);

    let later = Utc::now() + Duration::hours(1);
    assert!(reopened.find_failures_since(Some(later))?.is_empty());
    assert!(reopened.find_uncompleted_tasks()?.iter().all(|t| t.state == TaskState::Failed));
    Ok(())
}

#[tokio::test]
async fn store_runs_against_a_mock_filesystem() -> TestResult {
    init_tracing();
    let fs = MockFileSystem::new();
    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log).task("a", &[]).build();
    let job = Job::new("mocked", graph);
    let job_id = job.id();

    let store = Arc::new(FileStore::open_with(fs.clone(), "store.json")?);
    run_with_fake(store, options(1), vec![job], |e| e).await?;

    let reopened = FileStore::open_with(fs, "store.json")?;
    let record = reopened.find_job(job_id)?.expect("job record");
    assert_eq!(record.state, JobState::Completed);
    Ok(())
}

#[tokio::test]
async fn configured_file_store_drives_a_run() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("store.json");
    let cfg = ConfigFileBuilder::new()
        .worker_count(1)
        .exit_when_idle(true)
        .file_store(path.to_str().expect("utf-8 temp path"))
        .build();
    assert_eq!(cfg.store.mode, StoreMode::File);

    let log = work_log();
    let (graph, _) = GraphBuilder::new(&log).task("a", &[]).task("b", &[]).build();
    let job = Job::new("configured", graph);
    let job_id = job.id();

    let store = Arc::new(FileStore::open(&cfg.store.path)?);
    let outcome = run_with_fake(store, cfg.runtime_options(), vec![job], |e| e).await?;
    assert_eq!(outcome.core.options().worker_count, 1);
    assert_eq!(outcome.core.job(job_id).map(Job::state), Some(JobState::Completed));

    let reopened = FileStore::open(&path)?;
    assert_eq!(reopened.find_tasks_by_job_id(job_id)?.len(), 2);
    Ok(())
}

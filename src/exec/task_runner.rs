// src/exec/task_runner.rs

//! Runs a single work function and reports its outcome.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dag::TaskKind;
use crate::engine::{RuntimeEvent, ScheduledTask, TaskOutcome};

/// Run the work of one scheduled task and send exactly one `TaskFinished`
/// event for it.
///
/// The work runs in its own Tokio task so a panicking work function is
/// reported as a failure instead of taking the executor down. Cancellation is
/// cooperative: the work sees `ctx.cancel` and decides how to stop.
pub async fn run_task(task: ScheduledTask, runtime_tx: mpsc::Sender<RuntimeEvent>) {
    let ScheduledTask {
        job_id,
        task_id,
        name,
        kind,
        context,
    } = task;

    info!(job = %job_id, task = %name, kind = kind.kind(), "starting task");

    let handle = tokio::spawn(async move {
        match kind {
            TaskKind::Work(work) => match work.execute(&context).await {
                Ok(()) => TaskOutcome::Completed,
                Err(err) => TaskOutcome::Failed(format!("{err:#}")),
            },
            TaskKind::Meta(meta) => match meta.expand(&context).await {
                Ok(graph) => TaskOutcome::Expanded(graph),
                Err(err) => TaskOutcome::Failed(format!("{err:#}")),
            },
        }
    });

    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(join_err) if join_err.is_panic() => {
            error!(job = %job_id, task = %name, "task work panicked");
            TaskOutcome::Failed(format!("task '{name}' panicked"))
        }
        Err(join_err) => {
            warn!(job = %job_id, task = %name, error = %join_err, "task work aborted");
            TaskOutcome::Failed(format!("task '{name}' aborted"))
        }
    };

    match &outcome {
        TaskOutcome::Completed => info!(job = %job_id, task = %name, "task work finished"),
        TaskOutcome::Expanded(graph) => {
            info!(job = %job_id, task = %name, steps = graph.len(), "meta-task produced expansion")
        }
        TaskOutcome::Failed(reason) => {
            warn!(job = %job_id, task = %name, reason = %reason, "task work failed")
        }
    }

    if runtime_tx
        .send(RuntimeEvent::TaskFinished {
            job: job_id,
            task: task_id,
            outcome,
        })
        .await
        .is_err()
    {
        debug!(job = %job_id, task = %name, "runtime gone; dropping task report");
    }
}

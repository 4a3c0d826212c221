// src/exec/executor_loop.rs

//! Background executor loop that spawns work functions.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{RuntimeEvent, ScheduledTask};
use crate::exec::task_runner::run_task;
use crate::types::{JobId, TaskId};

/// Spawn the background executor loop.
///
/// The returned `mpsc::Sender<ScheduledTask>` is what `WorkerPoolBackend`
/// uses to hand over work. Each scheduled task runs in its own Tokio task,
/// and a task instance that is still running is never started twice.
pub fn spawn_executor(runtime_tx: mpsc::Sender<RuntimeEvent>) -> mpsc::Sender<ScheduledTask> {
    let (tx, mut rx) = mpsc::channel::<ScheduledTask>(32);

    tokio::spawn(async move {
        info!("executor loop started");

        let mut active: HashMap<(JobId, TaskId), JoinHandle<()>> = HashMap::new();

        while let Some(task) = rx.recv().await {
            handle_scheduled_task(task, &mut active, &runtime_tx);
        }

        info!(still_running = active.len(), "executor loop finished (channel closed)");
    });

    tx
}

fn handle_scheduled_task(
    task: ScheduledTask,
    active: &mut HashMap<(JobId, TaskId), JoinHandle<()>>,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
) {
    active.retain(|_, handle| !handle.is_finished());

    let key = (task.job_id, task.task_id);
    if active.contains_key(&key) {
        warn!(
            job = %task.job_id,
            task = %task.name,
            "task instance already running; ignoring duplicate dispatch"
        );
        return;
    }

    let rt_tx = runtime_tx.clone();
    let name = task.name.clone();
    let handle = tokio::spawn(async move {
        run_task(task, rt_tx).await;
        debug!(task = %name, "task runner future finished");
    });
    active.insert(key, handle);
}

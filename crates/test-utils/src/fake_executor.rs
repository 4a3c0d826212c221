use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use jobgraph::dag::TaskKind;
use jobgraph::engine::{RuntimeEvent, ScheduledTask, TaskOutcome};
use jobgraph::errors::Result;
use jobgraph::exec::ExecutorBackend;
use tokio::sync::mpsc;

/// A fake executor that:
/// - records which tasks were dispatched, in order
/// - runs the work inline (no spawning), unless an outcome was scripted for
///   the task name
/// - immediately reports `TaskFinished` for each scheduled task.
pub struct FakeExecutor {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    dispatched: Arc<Mutex<Vec<String>>>,
    scripted_failures: HashMap<String, String>,
}

impl FakeExecutor {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>, dispatched: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            runtime_tx,
            dispatched,
            scripted_failures: HashMap::new(),
        }
    }

    /// Report `name` as failed without running its work.
    pub fn fail(mut self, name: &str, reason: &str) -> Self {
        self.scripted_failures
            .insert(name.to_string(), reason.to_string());
        self
    }
}

impl ExecutorBackend for FakeExecutor {
    fn spawn_ready_tasks(
        &mut self,
        tasks: Vec<ScheduledTask>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.runtime_tx.clone();
        let dispatched = Arc::clone(&self.dispatched);
        let failures = self.scripted_failures.clone();

        Box::pin(async move {
            for t in tasks {
                dispatched.lock().unwrap().push(t.name.clone());

                let outcome = match failures.get(&t.name) {
                    Some(reason) => TaskOutcome::Failed(reason.clone()),
                    None => match &t.kind {
                        TaskKind::Work(work) => match work.execute(&t.context).await {
                            Ok(()) => TaskOutcome::Completed,
                            Err(err) => TaskOutcome::Failed(err.to_string()),
                        },
                        TaskKind::Meta(meta) => match meta.expand(&t.context).await {
                            Ok(graph) => TaskOutcome::Expanded(graph),
                            Err(err) => TaskOutcome::Failed(err.to_string()),
                        },
                    },
                };

                // The runtime loop is the only receiver and it is blocked on
                // this future; send from a detached task so a full channel
                // cannot deadlock it.
                let tx = tx.clone();
                let event = RuntimeEvent::TaskFinished {
                    job: t.job_id,
                    task: t.task_id,
                    outcome,
                };
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
            Ok(())
        })
    }
}

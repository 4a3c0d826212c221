// src/engine/runtime.rs

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::exec::ExecutorBackend;

use super::core::CoreRuntime;
use super::{CoreCommand, RuntimeEvent, ScheduledTask};

/// Drives the scheduling core in response to `RuntimeEvent`s, and delegates
/// running work functions to an `ExecutorBackend`.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// scheduling semantics. This struct handles async IO: reading events from
/// channels, dispatching tasks to the executor, and arming retry timers.
pub struct Runtime<E: ExecutorBackend> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    executor: E,
    /// Used to deliver delayed `Tick`s. Weak so the runtime never keeps its
    /// own channel open.
    retry_tx: Option<mpsc::WeakSender<RuntimeEvent>>,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorBackend> Runtime<E> {
    pub fn new(core: CoreRuntime, event_rx: mpsc::Receiver<RuntimeEvent>, executor: E) -> Self {
        Self {
            core,
            event_rx,
            executor,
            retry_tx: None,
        }
    }

    /// Enable retry timers by giving the runtime a handle on its own event
    /// channel.
    pub fn with_retry_sender(mut self, tx: mpsc::WeakSender<RuntimeEvent>) -> Self {
        self.retry_tx = Some(tx);
        self
    }

    /// Main event loop.
    ///
    /// - Consumes `RuntimeEvent`s from `event_rx`.
    /// - Feeds them into the core runtime.
    /// - Executes commands returned by the core (dispatch tasks, retry, exit).
    ///
    /// Returns the core so callers can inspect the final job states.
    pub async fn run(mut self) -> Result<CoreRuntime> {
        info!("jobgraph runtime started");

        loop {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    info!("runtime event channel closed; exiting");
                    break;
                }
            };

            debug!(?event, "runtime received event");

            let step = self.core.step(event);

            for command in step.commands {
                self.execute_command(command).await?;
            }

            if !step.keep_running {
                info!("core requested exit; stopping runtime");
                break;
            }
        }

        info!("runtime exiting");
        Ok(self.core)
    }

    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        match command {
            CoreCommand::DispatchTasks(tasks) => {
                self.spawn_ready(tasks).await?;
            }
            CoreCommand::JobFinished { job, state } => {
                info!(job = %job, state = %state, "job reached terminal state");
            }
            CoreCommand::JobRejected { job, reason } => {
                error!(job = %job, reason = %reason, "job rejected");
            }
            CoreCommand::ScheduleRetry(delay) => self.schedule_tick(delay),
            CoreCommand::RequestExit => {
                // keep_running is already false in this case; just log it.
                info!("core issued RequestExit command");
            }
        }
        Ok(())
    }

    fn schedule_tick(&self, delay: Duration) {
        let Some(tx) = self.retry_tx.clone() else {
            warn!("retry requested but no retry sender configured");
            return;
        };
        debug!(?delay, "arming retry tick");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(RuntimeEvent::Tick).await;
            }
        });
    }

    async fn spawn_ready(&mut self, tasks: Vec<ScheduledTask>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let names: Vec<_> = tasks.iter().map(|t| t.name.as_str()).collect();
        debug!(?names, "spawning ready tasks");

        self.executor.spawn_ready_tasks(tasks).await
    }
}

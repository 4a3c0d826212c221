// src/lib.rs

pub mod cli;
pub mod config;
pub mod conformance;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod lock;
pub mod logging;
pub mod registry;
pub mod report;
pub mod store;
pub mod types;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::{load_or_default, ConfigFile};
use crate::conformance::{build_delete_graph, build_update_graph, demo_inventory, Inventory};
use crate::dag::{Job, TaskGraph};
use crate::engine::recovery::recover;
use crate::engine::{CoreRuntime, Runtime, RuntimeEvent};
use crate::exec::WorkerPoolBackend;
use crate::registry::WorkRegistry;
use crate::store::{FileStore, MemoryStore, TaskStore};
use crate::types::{JobId, StoreMode};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and the store
/// - the work registry and the demo inventory
/// - restart recovery (`--resume`)
/// - core / runtime / executor
/// - Ctrl-C handling
/// - the JSON report printed once the runtime stops
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_or_default(&args.config)?;
    let store = open_store(&cfg)?;

    if let Some(window) = args.failures_since {
        let failures = store.find_failures_since(window.start())?;
        println!("{}", serde_json::to_string_pretty(&failures)?);
        return Ok(());
    }

    let (inventory, sg) = demo_inventory(args.members, args.interfaces, args.delete);
    let inventory: Arc<dyn Inventory> = inventory;

    if args.dry_run {
        let graph = if sg.marked_for_deletion {
            build_delete_graph(&sg, &inventory)?
        } else {
            build_update_graph(&sg, &inventory)?
        };
        print_dry_run(&cfg, &graph);
        return Ok(());
    }

    let mut registry = WorkRegistry::new();
    conformance::register_work(&mut registry, inventory.clone());

    let jobs = if args.resume {
        recover(store.as_ref(), &registry)?
    } else {
        let mut graph = TaskGraph::new();
        graph.add_task(conformance::update_or_delete_task(&sg, &inventory), &[])?;
        vec![Job::new(format!("reconcile security group '{}'", sg.name), graph)]
    };
    let job_ids: Vec<JobId> = jobs.iter().map(Job::id).collect();
    info!(jobs = job_ids.len(), resume = args.resume, "submitting jobs");

    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(cfg.engine.event_buffer);
    let executor = WorkerPoolBackend::new(rt_tx.clone());

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    if job_ids.is_empty() {
        info!("nothing to run");
        return Ok(());
    }
    for job in jobs {
        rt_tx.send(RuntimeEvent::JobSubmitted(job)).await?;
    }

    let core = CoreRuntime::new(store.clone(), cfg.runtime_options());
    let runtime = Runtime::new(core, rt_rx, executor).with_retry_sender(rt_tx.downgrade());
    drop(rt_tx);
    runtime.run().await?;

    let reports = job_ids
        .into_iter()
        .map(|id| report::project_job(store.as_ref(), id))
        .collect::<errors::Result<Vec<_>>>()?;
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

fn open_store(cfg: &ConfigFile) -> Result<Arc<dyn TaskStore>> {
    let store: Arc<dyn TaskStore> = match cfg.store.mode {
        StoreMode::Memory => Arc::new(MemoryStore::new()),
        StoreMode::File => Arc::new(FileStore::open(&cfg.store.path)?),
    };
    Ok(store)
}

/// Dry-run output: engine settings plus the graph the job would expand into.
fn print_dry_run(cfg: &ConfigFile, graph: &TaskGraph) {
    println!("jobgraph dry-run");
    println!("  engine.worker_count = {}", cfg.engine.worker_count);
    println!("  store.mode = {:?}", cfg.store.mode);
    println!();

    println!("tasks ({}):", graph.len());
    for task in graph.iter() {
        println!("  - [{}] {}", task.dependency_order(), task.name());
        println!("      kind: {}", task.kind().kind());
        let preds: Vec<&str> = task
            .predecessors()
            .iter()
            .filter_map(|p| graph.get(*p))
            .map(|p| p.name())
            .collect();
        if !preds.is_empty() {
            println!("      after ({}): {:?}", task.guard(), preds);
        }
    }

    debug!("dry-run complete (no execution)");
}

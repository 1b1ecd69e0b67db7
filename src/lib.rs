// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod plan;
pub mod relations;
pub mod transaction;
pub mod types;

use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::cli::CliArgs;
use crate::config::{build_engine, load_and_validate, PlanFile};
use crate::engine::{RunSummary, Runtime};
use crate::errors::PlanError;

/// Capacity of the request channel between handles and the runtime.
const REQUEST_CAPACITY: usize = 64;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - plan file loading and validation
/// - engine construction
/// - the runtime loop
/// - Ctrl-C handling
///
/// Returns the run summary, or `None` for a dry run. Must run on a
/// current-thread Tokio runtime.
pub async fn run(args: CliArgs) -> Result<Option<RunSummary>> {
    let config_path = PathBuf::from(&args.config);
    let mut file = load_and_validate(&config_path)?;

    if let Some(max_cycles) = args.max_cycles {
        file.engine.max_cycles = max_cycles;
    }

    if args.dry_run {
        print_dry_run(&file);
        return Ok(None);
    }

    let engine = build_engine(&file)?;
    let (runtime, handle) = Runtime::new(engine, REQUEST_CAPACITY);

    // Ctrl-C → graceful shutdown.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            if let Err(e) = handle.shutdown().await {
                debug!(error = %e, "shutdown request not delivered");
            }
        });
    }

    match runtime.run().await {
        Ok(summary) => {
            info!(?summary, "planloop finished");
            println!(
                "planloop: {} cycle(s), {} mission(s) succeeded, {} failed ({:?})",
                summary.cycles, summary.missions_succeeded, summary.missions_failed, summary.reason
            );
            if summary.missions_failed > 0 {
                warn!(failed = summary.missions_failed, "some missions failed");
            }
            Ok(Some(summary))
        }
        Err(PlanError::Aborting(aborting)) => {
            for cause in aborting.all_exceptions() {
                error!(%cause, "fatal error");
                eprintln!("  - {cause}");
            }
            Err(aborting.into())
        }
        Err(other) => Err(other.into()),
    }
}

/// Print models, tasks and dependencies without running anything.
fn print_dry_run(file: &PlanFile) {
    println!("planloop dry-run");
    println!("  engine.cycle_period_ms = {}", file.engine.cycle_period_ms);
    println!("  engine.max_cycles = {}", file.engine.max_cycles);
    println!("  engine.exit_when_idle = {}", file.engine.exit_when_idle);
    println!();

    if !file.model.is_empty() {
        println!("models ({}):", file.model.len());
        for (name, model) in file.model.iter() {
            println!("  - {name} < {}", model.effective_parent());
            if model.is_abstract {
                println!("      abstract: true");
            }
            if !model.tags.is_empty() {
                println!("      tags: {:?}", model.tags);
            }
            if !model.events.is_empty() {
                println!("      events: {:?}", model.events.keys().collect::<Vec<_>>());
            }
        }
        println!();
    }

    println!("tasks ({}):", file.task.len());
    for (name, task) in file.task.iter() {
        println!("  - {name} ({})", task.effective_model());
        if task.mission {
            println!("      mission: true");
        }
        if task.permanent {
            println!("      permanent: true");
        }
        if let Some(ref planner) = task.planned_by {
            println!("      planned_by: {planner}");
        }
        if let Some(n) = task.succeed_after {
            println!("      succeed_after: {n}");
        }
        if let Some(n) = task.fail_after {
            println!("      fail_after: {n}");
        }
    }

    if !file.dependency.is_empty() {
        println!();
        println!("dependencies ({}):", file.dependency.len());
        for dep in file.dependency.iter() {
            println!("  - {} -> {}", dep.parent, dep.child);
            if !dep.roles.is_empty() {
                println!("      roles: {:?}", dep.roles);
            }
        }
    }

    debug!("dry-run complete (no execution)");
}

//! Command-line interface for cadence.
//!
//! Provides commands for running suites, inspecting a cycle's journal,
//! resetting a cycle's checkpoint, and checking sink graphs before a run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::warn;

use crate::core::artifact_pipeline::ArtifactPipeline;
use crate::core::checkpoint::CheckpointStore;
use crate::core::event_store::EventStore;
use crate::core::halt::HaltHandle;
use crate::core::orchestrator::{Orchestrator, SuiteResult};
use crate::core::suite::SuiteDefinition;
use crate::domain::{CycleState, EventType, RowState};

pub mod wiring;

/// cadence - resumable, rate-governed cycle engine
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the cycles of a suite (resuming from checkpoints)
    Run {
        /// Suite definition file
        suite: PathBuf,

        /// Run only this cycle (plus the baseline in experimental suites)
        #[arg(short, long)]
        cycle: Option<String>,

        /// Print the suite result as JSON
        #[arg(long, env = "CADENCE_JSON")]
        json: bool,
    },

    /// Show the journal summary of a cycle
    Status {
        /// Suite name
        suite: String,

        /// Cycle name
        cycle: String,
    },

    /// List cycles that have state for a suite
    Cycles {
        /// Suite name
        suite: String,
    },

    /// Discard a cycle's checkpoint and journal so it starts over
    Reset {
        /// Suite name
        suite: String,

        /// Cycle name
        cycle: String,
    },

    /// Validate a suite and print each cycle's sink execution order
    Plan {
        /// Suite definition file
        suite: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { suite, cycle, json } => run_suite(&suite, cycle.as_deref(), json).await,
            Commands::Status { suite, cycle } => show_status(&suite, &cycle).await,
            Commands::Cycles { suite } => list_cycles(&suite).await,
            Commands::Reset { suite, cycle } => reset_cycle(&suite, &cycle).await,
            Commands::Plan { suite } => show_plan(&suite),
            Commands::Config => show_config(),
        }
    }
}

fn load_suite(path: &Path) -> Result<SuiteDefinition> {
    let suite = SuiteDefinition::from_file(path)?;
    suite
        .validate()
        .with_context(|| format!("Invalid suite: {}", path.display()))?;
    Ok(suite)
}

/// Run a suite until it finishes or Ctrl-C stops dispatch
async fn run_suite(path: &Path, only: Option<&str>, as_json: bool) -> Result<()> {
    let suite = load_suite(path)?;

    let halt = HaltHandle::new();
    let on_interrupt = halt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight rows");
            on_interrupt.request_halt();
        }
    });

    let jobs = wiring::build_jobs(&suite, only, &halt)?;
    let orchestrator = Orchestrator::new(&suite.name, suite.strategy);
    let result = orchestrator.run(jobs).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&result_json(&result))?);
    } else {
        print_result(&result);
    }

    if result.failed() > 0 {
        anyhow::bail!("{} of {} cycles failed", result.failed(), result.order.len());
    }
    Ok(())
}

fn result_json(result: &SuiteResult) -> serde_json::Value {
    let cycles: Vec<_> = result
        .iter()
        .map(|(name, outcome)| match outcome {
            Ok(report) => json!({
                "cycle": name,
                "ok": true,
                "result": report.result,
                "artifacts": report.artifacts,
            }),
            Err(e) => json!({
                "cycle": name,
                "ok": false,
                "error": e.to_string(),
            }),
        })
        .collect();
    json!({ "suite": result.suite, "cycles": cycles })
}

fn print_result(result: &SuiteResult) {
    println!("Suite: {}", result.suite);
    println!(
        "{:<20} {:<10} {:>8} {:>8} {:>8} {:>8} {:>10}",
        "CYCLE", "STATE", "OK", "FAILED", "RESUMED", "SKIPPED", "COST"
    );
    println!("{}", "-".repeat(78));

    for (name, outcome) in result.iter() {
        match outcome {
            Ok(report) => {
                let stats = &report.result.stats;
                let state = if report.result.halted.is_some() {
                    "halted"
                } else {
                    "completed"
                };
                println!(
                    "{:<20} {:<10} {:>8} {:>8} {:>8} {:>8} {:>10.4}",
                    name,
                    state,
                    stats.rows_succeeded,
                    stats.rows_failed,
                    stats.rows_resumed,
                    stats.rows_skipped,
                    stats.cost_usd
                );
            }
            Err(e) => println!("{:<20} {:<10} {}", name, "failed", e),
        }
    }

    for (name, outcome) in result.iter() {
        let Ok(report) = outcome else { continue };
        if let Some(ref halt) = report.result.halted {
            println!("\n{} halted by {}: {}", name, halt.condition, halt.message);
        }
        if let Some(comparisons) = report.result.comparisons() {
            println!("\n{} vs baseline:", name);
            println!("{}", serde_json::to_string_pretty(comparisons).unwrap_or_default());
        }
        for artifact in &report.artifacts {
            println!("  artifact {} ({}, {})", artifact.id, artifact.artifact_type, artifact.security_level);
        }
    }
}

/// Show what the journal says about a cycle
async fn show_status(suite: &str, cycle: &str) -> Result<()> {
    let store = EventStore::for_cycle(suite, cycle).await?;
    let Some(summary) = store.summary().await? else {
        println!("No journal for {}/{}", suite, cycle);
        return Ok(());
    };

    let state = match &summary.state {
        CycleState::Pending => "pending".to_string(),
        CycleState::Running => "running (or interrupted)".to_string(),
        CycleState::Completed => "completed".to_string(),
        CycleState::Halted { reason } => format!("halted: {}", reason),
        CycleState::Failed { error } => format!("failed: {}", error),
    };

    println!("Cycle: {}/{}", suite, summary.cycle);
    println!("State: {}", state);
    println!("Executions: {}", summary.executions);
    if let Some(id) = summary.last_execution {
        println!("Last execution: {}", id);
    }
    if let Some(started) = summary.started_at {
        println!("Started: {}", started);
    }
    if let Some(completed) = summary.completed_at {
        println!("Completed: {}", completed);
    }
    println!("\nRows:");
    println!("  completed: {}", summary.count(RowState::Completed));
    println!("  failed:    {}", summary.count(RowState::Failed));
    println!("  retrying:  {}", summary.count(RowState::Retrying));
    println!("  in flight: {}", summary.count(RowState::InFlight));
    println!("  retries:   {}", summary.retries);

    if let Some(failure) = store.last_event_of_type(EventType::RowFailed).await? {
        println!(
            "\nLast failure: row {} ({})",
            failure.row_key.as_deref().unwrap_or("?"),
            failure.error.as_deref().unwrap_or("no error recorded")
        );
    }

    Ok(())
}

async fn list_cycles(suite: &str) -> Result<()> {
    let cycles = EventStore::list_cycles(suite).await?;
    if cycles.is_empty() {
        println!("No cycles found for {}", suite);
        return Ok(());
    }

    println!("{:<24} {:<12} {:>10}", "CYCLE", "STATE", "EXECUTIONS");
    println!("{}", "-".repeat(48));
    for name in cycles {
        let store = EventStore::for_cycle(suite, &name).await?;
        let (state, executions) = match store.summary().await? {
            Some(s) => {
                let state = match s.state {
                    CycleState::Pending => "pending",
                    CycleState::Running => "running",
                    CycleState::Completed => "completed",
                    CycleState::Halted { .. } => "halted",
                    CycleState::Failed { .. } => "failed",
                };
                (state, s.executions)
            }
            None => ("pending", 0),
        };
        println!("{:<24} {:<12} {:>10}", name, state, executions);
    }
    Ok(())
}

/// Clear checkpoint and journal for a cycle
async fn reset_cycle(suite: &str, cycle: &str) -> Result<()> {
    let dir = EventStore::cycle_directory(suite, cycle)?;
    if !dir.exists() {
        println!("Nothing to reset for {}/{}", suite, cycle);
        return Ok(());
    }

    // Holding the checkpoint lock guarantees no run is using this cycle
    let checkpoint = CheckpointStore::open(&dir, true)
        .await
        .with_context(|| format!("Cannot reset {}/{}", suite, cycle))?;
    checkpoint.reset().await?;
    EventStore::open(&dir).await?.clear().await?;

    println!("Reset {}/{}", suite, cycle);
    Ok(())
}

/// Check every cycle's sink graph without running anything
fn show_plan(path: &Path) -> Result<()> {
    let suite = load_suite(path)?;
    let halt = HaltHandle::new();

    println!("Suite: {} ({:?})", suite.name, suite.strategy);
    for cycle in &suite.cycles {
        let dir = crate::config::cycle_dir(&suite.name, &cycle.name)?;
        let job = wiring::build_job(&suite, cycle, &dir, &halt)?;
        let plan = ArtifactPipeline::new(job.sinks.clone())
            .plan(job.security_level)
            .with_context(|| format!("Invalid sink graph in cycle '{}'", cycle.name))?;

        let marker = if cycle.baseline { " [baseline]" } else { "" };
        println!("\nCycle: {}{} (payload: {})", cycle.name, marker, job.security_level);
        if plan.levels.is_empty() {
            println!("  (no sinks)");
        }
        for (i, level) in plan.levels.iter().enumerate() {
            println!("  level {}: {}", i, level.join(", "));
        }
        for artifact in &plan.artifacts {
            println!(
                "  artifact {} ({}, {})",
                artifact.id, artifact.artifact_type, artifact.security_level
            );
        }
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = crate::config::config()?;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home: {}", cfg.home.display());
    println!("  Runs: {}", crate::config::runs_dir()?.display());

    Ok(())
}

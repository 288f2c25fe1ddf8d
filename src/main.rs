use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use strata::config::Config;
use strata::core::{load_tasks, TaskStatus};
use strata::orchestration::{
    Behavior, ExecutionPlan, Orchestrator, PlannedRun, RunOutcome, RunSummary, Script,
    SimulatedWorkerFactory,
};
use strata::Result;

/// Strata - dependency-aware parallel task orchestrator
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    STRATA_DEBUG=1  Enable debug logging (alternative to --debug)\n    RUST_LOG        Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Configuration file (defaults to ~/.strata/strata.toml)
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build the dependency graph and print the execution plan
    Plan {
        /// Task file (.toml with [[task]] tables, or a .json array)
        tasks: PathBuf,

        /// Override the configured worker count
        #[arg(long, short = 'w')]
        workers: Option<usize>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan and execute tasks on simulated workers
    Run {
        /// Task file (.toml with [[task]] tables, or a .json array)
        tasks: PathBuf,

        /// Override the configured worker count
        #[arg(long, short = 'w')]
        workers: Option<usize>,

        /// Wall-clock milliseconds per estimate unit
        #[arg(long)]
        time_unit_ms: Option<u64>,

        /// Make a task fail on every attempt
        #[arg(long = "fail", value_name = "ID")]
        fail: Vec<String>,

        /// Make a task hang until it times out
        #[arg(long = "hang", value_name = "ID")]
        hang: Vec<String>,

        /// Per-attempt timeout in seconds (defaults to 5 when --hang is given)
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        write: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    strata::log::init_with_debug(cli.debug);
    debug!(debug = strata::log::is_debug(), "strata starting");

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Plan {
            tasks,
            workers,
            json,
        } => {
            if let Some(workers) = workers {
                config.max_workers = workers;
            }
            run_plan(&config, &tasks, json)
        }
        Command::Run {
            tasks,
            workers,
            time_unit_ms,
            fail,
            hang,
            timeout_secs,
            json,
        } => {
            if let Some(workers) = workers {
                config.max_workers = workers;
            }
            if let Some(time_unit_ms) = time_unit_ms {
                config.time_unit_ms = time_unit_ms;
            }
            apply_timeout(&mut config, timeout_secs, !hang.is_empty());
            let script = build_script(&fail, &hang);
            run_tasks(&config, &tasks, script, json)
        }
        Command::Config { write } => run_config(&config, cli.config.as_deref(), write),
    }
}

/// Timeout used for `--hang` runs unless one is given.
const HANG_TIMEOUT_SECS: u64 = 5;

fn apply_timeout(config: &mut Config, timeout_secs: Option<u64>, hangs: bool) {
    match timeout_secs {
        Some(secs) => config.task_timeout_secs = secs,
        None if hangs => {
            config.task_timeout_secs = config.task_timeout_secs.min(HANG_TIMEOUT_SECS)
        }
        None => {}
    }
}

fn build_script(fail: &[String], hang: &[String]) -> Script {
    let script = fail.iter().fold(Script::new(), |script, id| {
        script.always(id, Behavior::Fail("simulated failure".to_string()))
    });
    hang.iter()
        .fold(script, |script, id| script.always(id, Behavior::Hang))
}

fn orchestrator(config: &Config, script: Script) -> Orchestrator {
    let time_unit = Duration::from_millis(config.time_unit_ms);
    Orchestrator::new(
        config.run_config(),
        Arc::new(SimulatedWorkerFactory::with_script(time_unit, script)),
    )
}

/// Print the layered plan.
fn run_plan(config: &Config, path: &Path, json: bool) -> Result<()> {
    let tasks = load_tasks(path)?;
    let run = orchestrator(config, Script::new()).plan(tasks)?;

    if json {
        println!("{}", serde_json::to_string_pretty(run.plan.as_ref())?);
        return Ok(());
    }
    print_plan(&run);
    Ok(())
}

fn print_plan(run: &PlannedRun) {
    let plan: &ExecutionPlan = &run.plan;
    println!();
    println!(
        "  {} tasks, {} dependencies, {} layers, {} workers",
        run.graph.task_count(),
        run.graph.dependency_count(),
        plan.layers.len(),
        plan.profile.max_workers
    );
    println!();

    for layer in &plan.layers {
        println!("  Layer {} (makespan {:.1})", layer.index, layer.makespan);
        for batch in &layer.batches {
            println!(
                "    batch {} (makespan {:.1})",
                batch.index, batch.estimated_makespan
            );
            for id in &batch.tasks {
                let slot = layer
                    .assignments
                    .get(id)
                    .map(|s| format!("slot {}", s))
                    .unwrap_or_else(|| "-".to_string());
                let duration = run
                    .graph
                    .task(id)
                    .map(|t| t.estimated_duration)
                    .unwrap_or(0.0);
                println!("      {:<24} {:>8.1}  {}", id.as_str(), duration, slot);
            }
        }
    }

    if !plan.rejected.is_empty() {
        println!();
        println!("  Unschedulable:");
        for rejected in &plan.rejected {
            println!(
                "    {} needs {} {} (worker provides {})",
                rejected.task_id, rejected.demand, rejected.resource, rejected.capacity
            );
        }
    }

    let estimates = &plan.estimates;
    println!();
    println!("  Sequential estimate: {:.1}", estimates.sequential_duration);
    println!("  Parallel estimate:   {:.1}", estimates.parallel_duration);
    println!(
        "  Critical path:       {} ({:.1})",
        estimates
            .critical_path
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>()
            .join(" -> "),
        estimates.critical_path_duration
    );
    println!();
}

/// Execute the task file and print the summary.
fn run_tasks(config: &Config, path: &Path, script: Script, json: bool) -> Result<()> {
    let tasks = load_tasks(path)?;
    let orchestrator = orchestrator(config, script);
    let run = orchestrator.plan(tasks)?;
    if !json {
        print_plan(&run);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        let handle = orchestrator.start(&run);
        info!(run_id = %handle.run_id(), "run started");

        let token = handle.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });

        let events = handle.events().clone();
        let printer = (!json).then(|| {
            thread::spawn(move || {
                for event in events.iter() {
                    println!("  {}", event);
                }
            })
        });

        let summary = handle.wait().await;
        (summary, printer)
    });

    let (summary, printer) = summary;
    if let Some(printer) = printer {
        let _ = printer.join();
    }
    let summary = summary?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn format_status(status: TaskStatus) -> String {
    match status {
        TaskStatus::Completed => format!("\x1b[32m{}\x1b[0m", status), // Green
        TaskStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),    // Red
        TaskStatus::Running => format!("\x1b[33m{}\x1b[0m", status),   // Yellow
        TaskStatus::Skipped => format!("\x1b[35m{}\x1b[0m", status),   // Magenta
        TaskStatus::Pending => format!("\x1b[90m{}\x1b[0m", status),   // Gray
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                       Run Summary                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("  Run ID:      {}", summary.run_id);
    println!("  Outcome:     {}", summary.outcome);
    println!("  Wall time:   {:.2?}", summary.wall_time);
    println!(
        "  Tasks:       {} completed, {} failed, {} skipped",
        summary.completed, summary.failed, summary.skipped
    );
    println!("  Retries:     {}", summary.total_retries);
    println!("  Efficiency:  {:.2}x", summary.parallel_efficiency);
    println!();

    for task in &summary.tasks {
        let error = task
            .last_error
            .as_deref()
            .map(|e| format!("  {}", truncate_string(e, 60)))
            .unwrap_or_default();
        println!(
            "    {:<24} {:<20} attempts {}{}",
            task.task_id.as_str(),
            format_status(task.status),
            task.attempts,
            error
        );
    }
    println!();

    if summary.outcome != RunOutcome::Completed {
        println!("  Run with --debug for failure details.");
        println!();
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print the configuration, optionally saving it.
fn run_config(config: &Config, path: Option<&Path>, write: bool) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    if write {
        let saved = match path {
            Some(path) => {
                config.save_to(path)?;
                path.to_path_buf()
            }
            None => config.save()?,
        };
        println!();
        println!("Saved to {}", saved.display());
    }
    Ok(())
}

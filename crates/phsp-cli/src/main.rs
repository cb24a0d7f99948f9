//! PHSP CLI - run simulation sweeps and inspect their results.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use phsp_core::{EventKind, ProgressEvent, SweepConfig, SweepEvent, SweepFile, SweepStatus};
use phsp_engine::{handler_fn, EngineConfig, Orchestrator, SimulatorCommand, TaskStore};

/// Exit code for a run interrupted by Ctrl-C.
const EXIT_CANCELLED: i32 = 130;

/// PHSP CLI - Simulation sweep runner
#[derive(Parser)]
#[command(name = "phsp")]
#[command(about = "Run PHSP simulation sweeps", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sweep file to completion
    Run {
        /// Sweep description (JSON)
        sweep: PathBuf,

        /// Simulation executable
        #[arg(short, long, default_value = "flint-exec")]
        simulator: PathBuf,

        /// Argument passed to the simulator before the model (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Maximum number of concurrent simulations
        #[arg(short, long, default_value_t = 4)]
        jobs: usize,

        /// Progress polling interval in milliseconds
        #[arg(long, default_value_t = 200)]
        poll_ms: u64,

        /// Log lines shown when a simulation fails
        #[arg(long, default_value_t = 50)]
        tail_lines: usize,
    },

    /// Print the tasks a sweep file expands to
    Expand {
        /// Sweep description (JSON)
        sweep: PathBuf,
    },

    /// Print a persisted task table
    Inspect {
        /// Task table snapshot (tasks.json)
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            sweep,
            simulator,
            args,
            jobs,
            poll_ms,
            tail_lines,
        } => {
            let mut command = SimulatorCommand::new(simulator);
            command.args = args;
            let config = EngineConfig::new(command)
                .with_max_concurrent_tasks(jobs)
                .with_poll_interval(Duration::from_millis(poll_ms))
                .with_log_tail_lines(tail_lines);

            let status = run_sweep(&sweep, config).await?;
            let code = exit_code(status);
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Expand { sweep } => {
            expand_sweep(&sweep)?;
        }
        Commands::Inspect { snapshot } => {
            inspect_snapshot(&snapshot).await?;
        }
    }

    Ok(())
}

fn load_sweep(path: &Path) -> Result<SweepConfig, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let file: SweepFile = serde_json::from_str(&text)?;
    let config = file.into_config();
    config.validate()?;
    Ok(config)
}

async fn run_sweep(
    path: &Path,
    config: EngineConfig,
) -> Result<SweepStatus, Box<dyn std::error::Error>> {
    let sweep = load_sweep(path)?;
    let orchestrator = Arc::new(Orchestrator::open(config, &sweep.output_dir).await?);

    orchestrator
        .subscribe(
            EventKind::Progress,
            handler_fn(|event| {
                if let SweepEvent::Progress(progress) = event {
                    println!("{}", format_progress(progress));
                }
            }),
        )
        .await;

    let handle = orchestrator.run(sweep).await?;
    info!(run_id = %handle.run_id(), tasks = handle.task_ids().len(), "Sweep started");

    let interrupt = {
        let orchestrator = orchestrator.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    println!("Cancelling...");
                    orchestrator.cancel_all(&handle).await;
                }
                Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
            }
        })
    };

    let report = handle.wait().await?;
    interrupt.abort();

    match report.status {
        SweepStatus::Completed => println!("Simulation completed"),
        SweepStatus::Cancelled => println!("Simulation cancelled"),
        _ => {
            println!("Simulation failed");
            if let Some(diagnostic) = report.diagnostic.as_deref() {
                print!("{}", diagnostic);
            }
        }
    }
    Ok(report.status)
}

fn expand_sweep(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let sweep = load_sweep(path)?;

    println!("Tasks ({}):", sweep.len());
    println!("{:<4}  {:<32}  {}", "#", "MODEL", "PARAMETERS");
    println!("{}", "-".repeat(80));
    for (index, entry) in sweep.entries.iter().enumerate() {
        println!("{:<4}  {:<32}  {}", index, entry.model.display(), entry.params);
    }

    Ok(())
}

async fn inspect_snapshot(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = TaskStore::load(path).await?;

    for run in store.runs().await {
        println!("Run {} ({})", run.id, run.status);
        println!("  Output:     {}", run.output_dir.display());
        println!("  Created:    {}", format_timestamp(&run.created_at));
        if let Some(finished) = &run.finished_at {
            println!("  Finished:   {}", format_timestamp(finished));
        }
        println!(
            "  {:<36}  {:<10}  {:>4}  {:<24}  {}",
            "TASK", "STATUS", "PCT", "MODEL", "PARAMETERS"
        );
        for task in store.tasks_for_run(&run.id).await? {
            println!(
                "  {:<36}  {:<10}  {:>3}%  {:<24}  {}",
                task.id,
                task.status,
                task.progress,
                task.model.display(),
                task.params
            );
        }
        println!();
    }

    Ok(())
}

fn format_progress(event: &ProgressEvent) -> String {
    let mut line = format!(
        "[{}] {} ({}): {:>3}%",
        event.task_id,
        event.model.display(),
        event.params,
        event.progress
    );
    if event.cancelling {
        line.push_str(" cancelling");
    } else if event.status.is_terminal() {
        line.push_str(&format!(" {}", event.status));
    }
    line
}

fn exit_code(status: SweepStatus) -> i32 {
    match status {
        SweepStatus::Completed => 0,
        SweepStatus::Cancelled => EXIT_CANCELLED,
        _ => 1,
    }
}

fn format_timestamp(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

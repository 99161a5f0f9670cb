//! `mloop` binary: init, start, resume, status, report.

mod report;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use mloop_core::config::LoopConfig;
use mloop_core::orchestrator::Orchestrator;
use mloop_core::state::RunState;

const DEFAULT_CONFIG: &str = "mloop.toml";
const DEFAULT_PROMPT: &str = "Improve the model in this workspace until it reaches the target metric.";

#[derive(Parser)]
#[command(name = "mloop", version, about = "Iterative ML training improvement loop")]
struct Cli {
    /// Config file (also settable via MLOOP_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Begin a new run from cycle 1
    Start {
        /// Goal given to the codegen agent each cycle
        #[arg(default_value = DEFAULT_PROMPT)]
        prompt: String,
    },
    /// Continue an interrupted run at the next cycle
    Resume {
        #[arg(default_value = DEFAULT_PROMPT)]
        prompt: String,
    },
    /// Show the current run state
    Status,
    /// Write a markdown report of the run so far
    Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("MLOOP_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    match cli.command {
        Command::Init { force } => init(&config_path, force),
        Command::Start { prompt } => {
            let state = run(&config_path, &prompt, false).await?;
            print_summary(&state);
            Ok(())
        }
        Command::Resume { prompt } => {
            let state = run(&config_path, &prompt, true).await?;
            print_summary(&state);
            Ok(())
        }
        Command::Status => status(&config_path),
        Command::Report => report_cmd(&config_path),
    }
}

fn init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }
    std::fs::write(config_path, LoopConfig::example_toml())
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    println!("wrote {}", config_path.display());
    Ok(())
}

/// Directory config-relative paths resolve against.
fn base_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn run(config_path: &Path, prompt: &str, resume: bool) -> Result<RunState> {
    let config = LoopConfig::load(config_path)?;
    let paths = config.resolved_paths(&base_dir(config_path));

    let cancel = CancellationToken::new();
    let handler = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current phase");
            handler.cancel();
        }
    });

    let orchestrator = Orchestrator::new(config, paths, cancel);
    if resume {
        orchestrator.resume(prompt).await
    } else {
        orchestrator.start(prompt).await
    }
}

fn print_summary(state: &RunState) {
    println!();
    println!("run {}: {}", state.run_id, state.status);
    println!("cycles completed: {}", state.current_cycle);
    match state.best_metric {
        Some(best) => println!("best metric: {best} (cycle {})", state.best_cycle),
        None => println!("best metric: none recorded"),
    }
}

fn load_state(config_path: &Path) -> Result<(LoopConfig, Option<RunState>)> {
    let config = LoopConfig::load(config_path)?;
    let paths = config.resolved_paths(&base_dir(config_path));
    let state = RunState::load(&paths.state_file)?;
    Ok((config, state))
}

fn status(config_path: &Path) -> Result<()> {
    let (config, state) = load_state(config_path)?;
    let Some(state) = state else {
        println!("no run state found; use `mloop start`");
        return Ok(());
    };

    let target = &config.project.target;
    println!("run:    {}", state.run_id);
    println!("status: {}", state.status);
    println!(
        "cycle:  {} of {}",
        state.current_cycle, config.safeguards.max_cycles
    );
    println!(
        "target: {} {} {}",
        target.metric,
        target.direction.comparator(),
        target.value
    );
    match state.best_metric {
        Some(best) => println!("best:   {best} (cycle {})", state.best_cycle),
        None => println!("best:   none recorded"),
    }
    if let Some(checkpoint) = &state.phase_checkpoint {
        println!(
            "in-flight: cycle {} finished phase {:?} at {}",
            checkpoint.cycle, checkpoint.completed, checkpoint.at
        );
    }
    for snapshot in state.history.iter().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
        let value = snapshot
            .metrics
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  cycle {:>3}: {} = {} ({} fault(s))",
            snapshot.cycle,
            snapshot.metrics.metric,
            value,
            snapshot.faults.len()
        );
    }
    Ok(())
}

fn report_cmd(config_path: &Path) -> Result<()> {
    let (config, state) = load_state(config_path)?;
    let Some(state) = state else {
        bail!("no run state found; nothing to report on");
    };

    let paths = config.resolved_paths(&base_dir(config_path));
    std::fs::create_dir_all(&paths.reports)
        .with_context(|| format!("failed to create {}", paths.reports.display()))?;

    let rendered = report::render(&config, &state);
    let path = paths.reports.join(format!("run_{}.md", state.run_id));
    std::fs::write(&path, rendered)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

//! ARENA CLI - Command-line interface
//!
//! Commands:
//! - simulate: Rank a synthetic pool end to end
//! - converge: Evaluate a saved context snapshot
//! - queue: Inspect and maintain a JSON-file task queue

mod converge;
mod format;
mod queue;
mod simulate;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use arena_coordinator::CoordinatorConfig;

#[derive(Parser)]
#[command(name = "arena")]
#[command(about = "Adaptive pairwise ranking arena", version)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Coordinator configuration JSON file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rank a synthetic pool with hidden skills and report how well it did
    Simulate(simulate::SimulateArgs),
    /// Decide whether a saved context snapshot has converged
    Converge(converge::ConvergeArgs),
    /// Inspect and maintain a task queue file
    Queue(queue::QueueArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Simulate(args) => simulate::run(args, config),
        Commands::Converge(args) => converge::run(args, config),
        Commands::Queue(args) => queue::run(args, config),
    }
}

/// Logs go to stderr so `--json` output on stdout stays machine-readable
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<CoordinatorConfig> {
    match path {
        Some(path) => CoordinatorConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(CoordinatorConfig::default()),
    }
}

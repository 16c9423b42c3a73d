//! Queue command - inspect and maintain a JSON-file task queue
//!
//! ## Architecture (4-layer granularity)
//!
//! - Level 1: run() - orchestration
//! - Level 2: one function per subcommand
//! - Level 3: (delegated to TaskCoordinator)
//! - Level 4: formatting utilities

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use arena_core::ContextId;
use arena_coordinator::{
    CoordinatorConfig, JsonFileTaskStore, Task, TaskCoordinator, TaskFilter, TaskId, TaskStatus, TracingSink,
};

use crate::format::truncate;

// ============================================================================
// COMMAND ARGUMENTS (Level 4 - Configuration)
// ============================================================================

#[derive(Args)]
pub struct QueueArgs {
    /// Task queue JSON file
    #[arg(long, value_name = "FILE", default_value = "arena-queue.json")]
    pub file: PathBuf,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: QueueCommand,
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// List tasks, oldest first
    List {
        /// Only tasks with this status
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Only tasks of this context
        #[arg(long)]
        context: Option<String>,
    },
    /// Task counts per status
    Stats,
    /// Requeue or fail tasks whose worker stopped heartbeating
    Recover,
    /// Cancel a pending task
    Cancel { id: TaskId },
    /// Put a failed task back in the queue
    Retry { id: TaskId },
    /// Delete finished tasks
    Purge {
        /// Only tasks finished more than this many hours ago
        #[arg(long, default_value = "24")]
        older_than_hours: i64,
    },
}

// ============================================================================
// LEVEL 1 - ORCHESTRATION
// ============================================================================

/// Run queue command
pub fn run(args: QueueArgs, config: CoordinatorConfig) -> Result<()> {
    let store = JsonFileTaskStore::open(&args.file)
        .with_context(|| format!("Failed to open task queue: {}", args.file.display()))?;
    let coordinator = TaskCoordinator::new(Arc::new(store), Arc::new(TracingSink), config);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async {
        match &args.command {
            QueueCommand::List { status, context } => list(&coordinator, *status, context.as_deref(), args.json).await,
            QueueCommand::Stats => stats(&coordinator, args.json).await,
            QueueCommand::Recover => recover(&coordinator, args.json).await,
            QueueCommand::Cancel { id } => {
                let task = coordinator.cancel(*id).await.context("Failed to cancel task")?;
                print_task(&task, args.json)
            }
            QueueCommand::Retry { id } => {
                let task = coordinator.retry_failed(*id).await.context("Failed to retry task")?;
                print_task(&task, args.json)
            }
            QueueCommand::Purge { older_than_hours } => purge(&coordinator, *older_than_hours, args.json).await,
        }
    })
}

// ============================================================================
// LEVEL 2 - SUBCOMMANDS
// ============================================================================

async fn list(coordinator: &TaskCoordinator, status: Option<TaskStatus>, context: Option<&str>, json: bool) -> Result<()> {
    let mut filter = TaskFilter::default();
    if let Some(status) = status {
        filter = filter.with_status(status);
    }
    if let Some(context) = context {
        filter = filter.with_context(ContextId::new(context));
    }
    let tasks = coordinator.list(&filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks");
        return Ok(());
    }
    println!(
        "{:<36}  {:<15} {:<11} {:<16} {:>9} {:>7}",
        "Id", "Kind", "Status", "Context", "Progress", "Retries"
    );
    for task in &tasks {
        println!(
            "{:<36}  {:<15} {:<11} {:<16} {:>9} {:>7}",
            task.id.to_string(),
            task.kind.name(),
            task.status.to_string(),
            truncate(task.context_id.as_str(), 16),
            format!("{}/{}", task.progress.processed(), task.progress.total),
            format!("{}/{}", task.retry_count, task.max_retries)
        );
    }
    Ok(())
}

async fn stats(coordinator: &TaskCoordinator, json: bool) -> Result<()> {
    let stats = coordinator.stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Pending:     {}", stats.pending);
    println!("Processing:  {}", stats.processing);
    println!("Completed:   {}", stats.completed);
    println!("Failed:      {}", stats.failed);
    println!("Cancelled:   {}", stats.cancelled);
    if let Some(age) = stats.oldest_pending_age_secs {
        println!("Oldest pending task waited {}", format_age(age));
    }
    Ok(())
}

async fn recover(coordinator: &TaskCoordinator, json: bool) -> Result<()> {
    let report = coordinator.recover_zombies().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Requeued {} task(s), failed {}", report.requeued, report.failed);
    }
    Ok(())
}

async fn purge(coordinator: &TaskCoordinator, older_than_hours: i64, json: bool) -> Result<()> {
    if older_than_hours < 0 {
        anyhow::bail!("--older-than-hours must not be negative");
    }
    let removed = coordinator
        .purge_finished(chrono::Duration::hours(older_than_hours))
        .await?;
    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("Removed {} finished task(s)", removed);
    }
    Ok(())
}

fn print_task(task: &Task, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(task)?);
    } else {
        println!("Task {} is now {}", task.id, task.status);
    }
    Ok(())
}

// ============================================================================
// LEVEL 4 - UTILITIES
// ============================================================================

fn format_age(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(42), "42s");
        assert_eq!(format_age(125), "2m 5s");
        assert_eq!(format_age(7_380), "2h 3m");
    }
}

//! Converge command - evaluate a saved context snapshot
//!
//! ## Architecture (4-layer granularity)
//!
//! - Level 1: run() - orchestration
//! - Level 2: load_snapshot(), report_decision()
//! - Level 3: (delegated to arena-core)
//! - Level 4: formatting utilities

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use arena_core::{ContextSnapshot, ConvergenceDecision, ConvergenceDetector};
use arena_coordinator::CoordinatorConfig;

// ============================================================================
// COMMAND ARGUMENTS (Level 4 - Configuration)
// ============================================================================

#[derive(Args)]
pub struct ConvergeArgs {
    /// Context snapshot JSON file
    #[arg(value_name = "FILE")]
    pub snapshot: PathBuf,

    /// Pool size at which statistical detection takes over
    #[arg(long)]
    pub statistical_threshold: Option<usize>,

    /// Output the decision as JSON
    #[arg(long)]
    pub json: bool,
}

// ============================================================================
// LEVEL 1 - ORCHESTRATION
// ============================================================================

/// Run converge command
///
/// 1. Load the snapshot
/// 2. Run the detector once
/// 3. Report the decision
pub fn run(args: ConvergeArgs, config: CoordinatorConfig) -> Result<()> {
    let snapshot = load_snapshot(&args)?;

    let mut convergence = config.convergence;
    if let Some(threshold) = args.statistical_threshold {
        convergence = convergence.with_statistical_threshold(threshold);
    }

    tracing::info!(
        "Evaluating {} items, {} battles from {}",
        snapshot.item_count(),
        snapshot.total_battles,
        args.snapshot.display()
    );

    let decision = ConvergenceDetector::new(convergence).should_stop(&snapshot);
    report_decision(&decision, &args)
}

// ============================================================================
// LEVEL 2 - PHASES
// ============================================================================

fn load_snapshot(args: &ConvergeArgs) -> Result<ContextSnapshot> {
    let contents = std::fs::read_to_string(&args.snapshot)
        .with_context(|| format!("Failed to read snapshot: {}", args.snapshot.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse snapshot: {}", args.snapshot.display()))
}

fn report_decision(decision: &ConvergenceDecision, args: &ConvergeArgs) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(decision)?);
        return Ok(());
    }

    println!("\n=== CONVERGENCE ===\n");
    println!("Stop:        {}", if decision.should_stop { "yes" } else { "no" });
    println!("Mode:        {:?}", decision.mode);
    println!("Reason:      {}", decision.reason);
    println!("Confidence:  {:.0}%", decision.confidence * 100.0);
    println!("Progress:    {:.0}%", decision.progress);
    println!("Avg sigma:   {:.3}", decision.avg_sigma);
    println!("Min battles: {}", decision.min_battles);
    println!("Battles:     {}", decision.total_battles);

    println!("\n=== SIGNALS ===\n");
    println!(
        "Stability:   {:.2} ({} stable windows{})",
        decision.stability.score,
        decision.stability.consecutive_stable_windows,
        if decision.stability.is_stable { ", stable" } else { "" }
    );
    println!(
        "Trend:       {:?}, rate {:.4}{}",
        decision.trend.direction,
        decision.trend.convergence_rate,
        decision
            .trend
            .predicted_battles
            .map(|b| format!(", ~{:.0} battles to go", b))
            .unwrap_or_default()
    );
    println!(
        "Quality:     recent {:.2}, surprise {:.2}{}",
        decision.quality.recent_quality,
        decision.quality.average_surprise,
        if decision.quality.is_diminishing { ", diminishing" } else { "" }
    );
    Ok(())
}

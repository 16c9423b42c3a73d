//! Simulate command - rank a synthetic pool whose true order is known
//!
//! ## Architecture (4-layer granularity)
//!
//! - Level 1: run() - orchestration
//! - Level 2: build_arena(), drive(), build_report(), report_results()
//! - Level 3: SkillJudge, event following
//! - Level 4: formatting utilities

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use arena_core::convergence::ranking_similarity;
use arena_core::{ContextId, ItemId, Outcome};
use arena_coordinator::{
    BattleRunner, BroadcastSink, CoordinatorConfig, EventSink, Judge, JudgeError, JudgeRequest, LoopSupervisor,
    MemoryRatingStore, MemoryTaskStore, MultiSink, ProgressEvent, RatingStore, TaskCoordinator, TaskKind,
    TaskWorker, TracingSink, Verdict,
};

use crate::format::truncate;

// ============================================================================
// COMMAND ARGUMENTS (Level 4 - Configuration)
// ============================================================================

#[derive(Args)]
pub struct SimulateArgs {
    /// Number of items in the pool
    #[arg(long, default_value = "20")]
    pub items: usize,

    /// Battle budget
    #[arg(long, default_value = "500")]
    pub max_battles: u32,

    /// Scale of the judge's logistic noise (larger means more upsets)
    #[arg(long, default_value = "1.0")]
    pub noise: f64,

    /// Random seed for hidden skills and verdicts
    #[arg(long)]
    pub seed: Option<u64>,

    /// Run through the scheduled battle loop instead of a batch task
    #[arg(long)]
    pub scheduled: bool,

    /// Loop interval in milliseconds for --scheduled
    #[arg(long, default_value = "5")]
    pub interval_ms: u64,

    /// Context name
    #[arg(long, default_value = "simulation")]
    pub context: String,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct LeaderboardRow {
    rank: usize,
    item: ItemId,
    hidden_skill: f64,
    mu: f64,
    sigma: f64,
    ordinal: f64,
    battles: u32,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    context: ContextId,
    items: usize,
    battles: usize,
    converged: bool,
    reason: String,
    /// Kendall agreement of the final ranking with the hidden order, in [0, 1]
    agreement: f64,
    leaderboard: Vec<LeaderboardRow>,
}

struct Arena {
    ratings: Arc<MemoryRatingStore>,
    runner: Arc<BattleRunner>,
    coordinator: Arc<TaskCoordinator>,
    supervisor: Arc<LoopSupervisor>,
    events: BroadcastSink,
}

// ============================================================================
// LEVEL 1 - ORCHESTRATION
// ============================================================================

/// Run simulate command
///
/// This function reads like a table of contents:
/// 1. Draw hidden skills
/// 2. Build the arena around a skill-based judge
/// 3. Drive it until it converges or the budget runs out
/// 4. Report results
pub fn run(args: SimulateArgs, config: CoordinatorConfig) -> Result<()> {
    if args.items < 2 {
        anyhow::bail!("Need at least 2 items to simulate, got {}", args.items);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let report = runtime.block_on(async {
        let mut rng = create_rng(args.seed);
        let skills = hidden_skills(&mut rng, args.items);
        let judge = SkillJudge::new(skills.clone(), args.noise, rng);

        tracing::info!(
            "Simulating {} items ({} mode, budget {} battles)",
            args.items,
            if args.scheduled { "scheduled" } else { "batch" },
            args.max_battles
        );

        let arena = build_arena(Arc::new(judge), &args, config);
        drive(&arena, &args, &skills).await?;
        build_report(&arena, &args, &skills).await
    })?;

    report_results(&report, &args)
}

// ============================================================================
// LEVEL 2 - PHASES
// ============================================================================

fn build_arena(judge: Arc<dyn Judge>, args: &SimulateArgs, mut config: CoordinatorConfig) -> Arena {
    if args.scheduled {
        config = config.with_loop_interval(Duration::from_millis(args.interval_ms));
    }

    let events = BroadcastSink::new(8192);
    let sink: Arc<dyn EventSink> = Arc::new(
        MultiSink::new()
            .with(Arc::new(events.clone()))
            .with(Arc::new(TracingSink)),
    );

    let ratings = Arc::new(MemoryRatingStore::new());
    let runner = Arc::new(BattleRunner::new(ratings.clone(), judge, sink.clone(), config.clone()));
    let coordinator = Arc::new(TaskCoordinator::new(Arc::new(MemoryTaskStore::new()), sink, config));
    let supervisor = Arc::new(LoopSupervisor::new(runner.clone()));

    Arena {
        ratings,
        runner,
        coordinator,
        supervisor,
        events,
    }
}

/// Enqueue the work, run one worker and follow the event stream until done
async fn drive(arena: &Arena, args: &SimulateArgs, skills: &HashMap<ItemId, f64>) -> Result<()> {
    let context = ContextId::new(args.context.clone());
    let mut items: Vec<ItemId> = skills.keys().cloned().collect();
    items.sort();

    let events = arena.events.subscribe();
    arena
        .coordinator
        .create_task(
            context.clone(),
            TaskKind::AddItems {
                items,
                start_loop: args.scheduled,
            },
        )
        .await?;
    let battle_task = if args.scheduled {
        None
    } else {
        let task = arena
            .coordinator
            .create_task(
                context.clone(),
                TaskKind::RunBattleLoop {
                    max_battles: args.max_battles,
                },
            )
            .await?;
        Some(task.id)
    };

    let bar = progress_bar(args)?;
    let cancel = CancellationToken::new();
    let worker = TaskWorker::new(arena.coordinator.clone(), arena.runner.clone())
        .with_supervisor(arena.supervisor.clone());
    let mut handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    let following = follow(events, &bar, |event, battles| match event {
        ProgressEvent::TaskStatusChanged { task_id, status, .. } => {
            Some(*task_id) == battle_task && status.is_terminal()
        }
        ProgressEvent::LoopStopped { context_id, .. } => args.scheduled && context_id == &context,
        ProgressEvent::BattleResolved { .. } if args.scheduled && battles >= args.max_battles as usize => {
            arena.supervisor.stop(&context);
            false
        }
        _ => false,
    });
    let (followed, worker_exited) = follow_while_working(following, &mut handle).await;
    bar.finish_and_clear();

    // Release anything still claimed and stop every loop before reporting.
    cancel.cancel();
    if !worker_exited {
        handle.await.context("Worker task panicked")??;
    }
    arena.supervisor.shutdown().await;
    followed
}

async fn build_report(arena: &Arena, args: &SimulateArgs, skills: &HashMap<ItemId, f64>) -> Result<SimulationReport> {
    let context = ContextId::new(args.context.clone());
    let mut ratings = arena.ratings.current_ratings(&context).await?;
    ratings.sort_by(|a, b| {
        b.ordinal
            .partial_cmp(&a.ordinal)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });

    let ranking: Vec<ItemId> = ratings.iter().map(|r| r.item_id.clone()).collect();
    let agreement = ranking_similarity(&ranking, &hidden_order(skills));

    let stored = arena.ratings.context(&context).await?;
    let (converged, reason) = match stored {
        Some(ctx) if ctx.completed => (true, ctx.completion_reason.unwrap_or_default()),
        _ => (false, "Battle budget exhausted before convergence".to_string()),
    };

    let leaderboard = ratings
        .iter()
        .enumerate()
        .map(|(i, r)| LeaderboardRow {
            rank: i + 1,
            item: r.item_id.clone(),
            hidden_skill: skills.get(&r.item_id).copied().unwrap_or(f64::NAN),
            mu: r.mu,
            sigma: r.sigma,
            ordinal: r.ordinal,
            battles: r.battle_count,
        })
        .collect();

    Ok(SimulationReport {
        context,
        items: ratings.len(),
        battles: arena.ratings.battle_count(&ContextId::new(args.context.clone())).await?,
        converged,
        reason,
        agreement,
        leaderboard,
    })
}

fn report_results(report: &SimulationReport, args: &SimulateArgs) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("\n=== LEADERBOARD ({}) ===\n", report.context);
    println!(
        "{:>4}  {:<12} {:>8} {:>8} {:>7} {:>8} {:>7}",
        "Rank", "Item", "Hidden", "Mu", "Sigma", "Ordinal", "Battles"
    );
    for row in &report.leaderboard {
        println!(
            "{:>4}  {:<12} {:>8.2} {:>8.2} {:>7.2} {:>8.2} {:>7}",
            row.rank,
            truncate(row.item.as_str(), 12),
            row.hidden_skill,
            row.mu,
            row.sigma,
            row.ordinal,
            row.battles
        );
    }

    println!("\n=== SUMMARY ===\n");
    println!("Items:      {}", report.items);
    println!("Battles:    {}", report.battles);
    println!("Converged:  {}", if report.converged { "yes" } else { "no" });
    println!("Reason:     {}", report.reason);
    println!("Agreement:  {:.1}% with the hidden order", report.agreement * 100.0);
    Ok(())
}

// ============================================================================
// LEVEL 3 - JUDGE AND EVENTS
// ============================================================================

/// Decides battles from hidden skills: A wins with probability
/// `1 / (1 + exp(-(skill_a - skill_b) / noise))`.
struct SkillJudge {
    skills: HashMap<ItemId, f64>,
    noise: f64,
    rng: Mutex<ChaCha8Rng>,
}

impl SkillJudge {
    fn new(skills: HashMap<ItemId, f64>, noise: f64, rng: ChaCha8Rng) -> Self {
        Self {
            skills,
            noise: noise.max(1e-6),
            rng: Mutex::new(rng),
        }
    }

    fn skill(&self, item: &ItemId) -> Result<f64, JudgeError> {
        self.skills
            .get(item)
            .copied()
            .ok_or_else(|| JudgeError::Failed(format!("unknown item {}", item)))
    }
}

#[async_trait]
impl Judge for SkillJudge {
    async fn judge(&self, request: &JudgeRequest) -> Result<Verdict, JudgeError> {
        let diff = self.skill(&request.item_a)? - self.skill(&request.item_b)?;
        let p_a = 1.0 / (1.0 + (-diff / self.noise).exp());

        let roll: f64 = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| JudgeError::Failed("judge rng poisoned".to_string()))?;
            rng.gen()
        };
        let outcome = if roll < p_a { Outcome::AWin } else { Outcome::BWin };
        Ok(Verdict::new(outcome).with_judge("skill-judge"))
    }
}

/// Consume events, advancing the bar, until `done` returns true.
/// `done` also sees the number of battles resolved so far.
async fn follow(
    mut events: broadcast::Receiver<ProgressEvent>,
    bar: &ProgressBar,
    mut done: impl FnMut(&ProgressEvent, usize) -> bool,
) -> Result<()> {
    let mut battles = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Progress display skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => anyhow::bail!("Event stream closed"),
        };

        match &event {
            ProgressEvent::BattleResolved { .. } => {
                battles += 1;
                bar.inc(1);
            }
            ProgressEvent::Convergence { progress, .. } => {
                bar.set_message(format!("{:.0}% converged", progress));
            }
            _ => {}
        }

        if done(&event, battles) {
            return Ok(());
        }
    }
}

/// Follow events until done, unless the worker exits first.
///
/// Returns the outcome and whether the worker handle has already been joined.
async fn follow_while_working(
    following: impl Future<Output = Result<()>>,
    worker: &mut JoinHandle<arena_coordinator::Result<()>>,
) -> (Result<()>, bool) {
    tokio::select! {
        followed = following => (followed, false),
        exited = worker => {
            let outcome = match exited {
                Err(e) => Err(anyhow::Error::new(e).context("Worker task panicked")),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("Worker failed")),
                Ok(Ok(())) => Err(anyhow::anyhow!("Worker stopped before the simulation finished")),
            };
            (outcome, true)
        }
    }
}

// ============================================================================
// LEVEL 4 - UTILITIES
// ============================================================================

fn create_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    }
}

fn hidden_skills(rng: &mut ChaCha8Rng, count: usize) -> HashMap<ItemId, f64> {
    (0..count)
        .map(|i| (ItemId::new(format!("item-{:03}", i)), rng.gen_range(0.0..10.0)))
        .collect()
}

/// Items ordered by hidden skill, best first
fn hidden_order(skills: &HashMap<ItemId, f64>) -> Vec<ItemId> {
    let mut order: Vec<(&ItemId, f64)> = skills.iter().map(|(id, s)| (id, *s)).collect();
    order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(b.0)));
    order.into_iter().map(|(id, _)| id.clone()).collect()
}

fn progress_bar(args: &SimulateArgs) -> Result<ProgressBar> {
    if args.json {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new(args.max_battles as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} battles {msg}")
            .context("Invalid progress template")?
            .progress_chars("=> "),
    );
    Ok(bar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_coordinator::CoordinatorError;

    #[test]
    fn test_hidden_order_is_by_skill() {
        let skills: HashMap<ItemId, f64> = [("low", 1.0), ("high", 9.0), ("mid", 5.0)]
            .into_iter()
            .map(|(id, s)| (ItemId::from(id), s))
            .collect();
        let order: Vec<String> = hidden_order(&skills).iter().map(|i| i.to_string()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_skill_judge_favours_stronger_item() {
        let skills: HashMap<ItemId, f64> = [("strong", 10.0), ("weak", 0.0)]
            .into_iter()
            .map(|(id, s)| (ItemId::from(id), s))
            .collect();
        let judge = SkillJudge::new(skills, 1.0, ChaCha8Rng::seed_from_u64(3));
        let request = JudgeRequest {
            context_id: "ctx".into(),
            item_a: "strong".into(),
            item_b: "weak".into(),
            criteria: None,
        };

        let mut wins = 0;
        for _ in 0..100 {
            if judge.judge(&request).await.unwrap().outcome == Outcome::AWin {
                wins += 1;
            }
        }
        assert!(wins > 95, "strong item won only {wins} of 100");
    }

    #[tokio::test]
    async fn test_skill_judge_rejects_unknown_items() {
        let judge = SkillJudge::new(HashMap::new(), 1.0, ChaCha8Rng::seed_from_u64(3));
        let request = JudgeRequest {
            context_id: "ctx".into(),
            item_a: "x".into(),
            item_b: "y".into(),
            criteria: None,
        };
        assert!(judge.judge(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_error_ends_following() {
        let mut worker = tokio::spawn(async { Err(CoordinatorError::NoPair("ctx".into())) });
        let (outcome, exited) = follow_while_working(std::future::pending(), &mut worker).await;
        assert!(exited);
        let message = format!("{:#}", outcome.unwrap_err());
        assert!(message.contains("Worker failed"), "{message}");
    }

    #[tokio::test]
    async fn test_following_finishes_before_worker() {
        let mut worker = tokio::spawn(std::future::pending::<arena_coordinator::Result<()>>());
        let (outcome, exited) = follow_while_working(async { Ok(()) }, &mut worker).await;
        assert!(outcome.is_ok());
        assert!(!exited);
        worker.abort();
    }
}

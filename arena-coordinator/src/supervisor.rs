//! Per-context battle loops
//!
//! Each running context owns a tokio task that ticks on a fixed interval:
//! check convergence, stop if converged, otherwise run one battle. Handles
//! are kept in an explicit map so loops can be listed, stopped and awaited.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arena_core::ContextId;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::battle::BattleRunner;
use crate::error::{CoordinatorError, Result};
use crate::events::ProgressEvent;

const STOPPED: &str = "stopped";

struct LoopHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type LoopMap = Arc<Mutex<FxHashMap<ContextId, LoopHandle>>>;

fn lock(loops: &LoopMap) -> MutexGuard<'_, FxHashMap<ContextId, LoopHandle>> {
    loops.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct LoopSupervisor {
    runner: Arc<BattleRunner>,
    loops: LoopMap,
    generations: AtomicU64,
    interval: Duration,
}

impl LoopSupervisor {
    pub fn new(runner: Arc<BattleRunner>) -> Self {
        let interval = runner.config().loop_interval();
        Self {
            runner,
            loops: Arc::new(Mutex::new(FxHashMap::default())),
            generations: AtomicU64::new(0),
            interval,
        }
    }

    /// Start the battle loop of `context`.
    ///
    /// Returns false when a loop is already running. Clears the context's
    /// completion flag so a converged context can be resumed.
    pub async fn start(&self, context: &ContextId) -> Result<bool> {
        if self.is_active(context) {
            return Ok(false);
        }
        self.runner.reopen(context).await?;

        let mut loops = lock(&self.loops);
        if loops.get(context).is_some_and(|h| !h.task.is_finished()) {
            return Ok(false);
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.runner.clone(),
            self.loops.clone(),
            context.clone(),
            cancel.clone(),
            generation,
            self.interval,
        ));
        loops.insert(
            context.clone(),
            LoopHandle {
                generation,
                cancel,
                task,
            },
        );
        Ok(true)
    }

    /// Cancel the loop of `context`. A battle in flight finishes; no further
    /// tick runs. Returns false when no loop was running.
    pub fn stop(&self, context: &ContextId) -> bool {
        match lock(&self.loops).remove(context) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every loop and wait for all of them to exit
    pub async fn shutdown(&self) {
        let handles: Vec<(ContextId, LoopHandle)> = lock(&self.loops).drain().collect();
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (context, handle) in handles {
            if let Err(e) = handle.task.await {
                tracing::error!("Battle loop for {} ended abnormally: {}", context, e);
            }
        }
    }

    /// Contexts with a running loop, sorted
    pub fn active_contexts(&self) -> Vec<ContextId> {
        let mut active: Vec<ContextId> = lock(&self.loops)
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(ctx, _)| ctx.clone())
            .collect();
        active.sort();
        active
    }

    pub fn is_active(&self, context: &ContextId) -> bool {
        lock(&self.loops)
            .get(context)
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Whether the context has converged, from the persisted flag
    pub async fn is_complete(&self, context: &ContextId) -> Result<bool> {
        self.runner.is_complete(context).await
    }
}

// ============================================================================
// Loop body
// ============================================================================

async fn run_loop(
    runner: Arc<BattleRunner>,
    loops: LoopMap,
    context: ContextId,
    cancel: CancellationToken,
    generation: u64,
    interval: Duration,
) {
    runner.events().publish(ProgressEvent::LoopStarted {
        context_id: context.clone(),
    });

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break STOPPED.to_string(),
            _ = ticker.tick() => {}
        }
        if let Some(reason) = tick(&runner, &context).await {
            break reason;
        }
    };

    {
        let mut loops = lock(&loops);
        if loops.get(&context).is_some_and(|h| h.generation == generation) {
            loops.remove(&context);
        }
    }

    runner.events().publish(ProgressEvent::LoopStopped {
        context_id: context,
        reason,
    });
}

/// One tick. Returns the stop reason once the context has converged.
async fn tick(runner: &BattleRunner, context: &ContextId) -> Option<String> {
    let decision = runner.check_convergence(context).await;
    if decision.should_stop {
        if let Err(e) = runner.mark_complete(context, &decision.reason).await {
            tracing::error!("Could not mark {} complete: {}", context, e);
        }
        return Some(decision.reason);
    }

    match runner.run_battle(context).await {
        Ok(_) => {}
        Err(CoordinatorError::NoPair(_)) => tracing::debug!("No pair available in {}", context),
        Err(e) => tracing::warn!("Battle in {} failed: {}", context, e),
    }
    None
}

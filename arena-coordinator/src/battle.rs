//! One battle at a time: snapshot, select, judge, resolve
//!
//! ## Architecture (4-layer granularity)
//!
//! - Level 1: BattleRunner::run_battle, BattleRunner::check_convergence
//! - Level 2: select_pair, judge_pair, resolve
//! - Level 3: store calls wrapped in the retry policy
//! - Level 4: per-context resolution locks
//!
//! Resolution is single-writer per context: the latest ratings are re-read
//! under the context's lock, so two battles sharing an item never update it
//! from the same stale rating.

use std::sync::{Arc, Mutex};

use arena_core::{
    Battle, ContextId, ConvergenceDecision, ConvergenceDetector, ItemId, Matchmaker, RatingEngine, RatingRecord,
    Selection,
};
use chrono::Utc;
use rustc_hash::FxHashMap;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, JudgeError, Result};
use crate::events::{EventSink, ProgressEvent};
use crate::judge::{Judge, JudgeRequest, Verdict};
use crate::store::{Completion, RatingStore};

pub struct BattleRunner {
    store: Arc<dyn RatingStore>,
    judge: Arc<dyn Judge>,
    events: Arc<dyn EventSink>,
    config: CoordinatorConfig,
    engine: RatingEngine,
    matchmaker: Matchmaker,
    detector: Mutex<ConvergenceDetector>,
    locks: Mutex<FxHashMap<ContextId, Arc<tokio::sync::Mutex<()>>>>,
}

impl BattleRunner {
    pub fn new(
        store: Arc<dyn RatingStore>,
        judge: Arc<dyn Judge>,
        events: Arc<dyn EventSink>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            engine: RatingEngine::new(config.rating.clone()),
            matchmaker: Matchmaker::new(config.matchmaking.clone()),
            detector: Mutex::new(ConvergenceDetector::new(config.convergence.clone())),
            locks: Mutex::new(FxHashMap::default()),
            store,
            judge,
            events,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RatingStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ========================================================================
    // Level 1 - Battles and convergence
    // ========================================================================

    /// Run one battle in `context` and return it resolved.
    ///
    /// Fails with `NoPair` when nothing can be selected (including when the
    /// store stays unavailable). A battle whose verdict never arrives, or
    /// whose resolution fails, is abandoned and leaves ratings untouched.
    pub async fn run_battle(&self, context: &ContextId) -> Result<Battle> {
        let selection = self
            .select_pair(context)
            .await
            .ok_or_else(|| CoordinatorError::NoPair(context.clone()))?;

        let battle = Battle::pending(context.clone(), selection.item_a, selection.item_b, Utc::now());
        self.config
            .store_retry
            .run("record battle", || self.store.record_battle(&battle))
            .await?;

        let verdict = match self.judge_pair(&battle).await {
            Ok(verdict) => verdict,
            Err(e) => {
                self.abandon(&battle, &e.to_string()).await;
                return Err(e.into());
            }
        };

        match self.resolve(battle.clone(), verdict).await {
            Ok(resolved) => Ok(resolved),
            Err(e) => {
                self.abandon(&battle, &format!("resolution failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Consult the convergence detector on a fresh snapshot.
    ///
    /// A store that stays unavailable yields a "continue" decision.
    pub async fn check_convergence(&self, context: &ContextId) -> ConvergenceDecision {
        let snapshot = self
            .config
            .store_retry
            .run("convergence snapshot", || {
                self.store.snapshot(context, self.config.recent_battle_window)
            })
            .await;

        let decision = match snapshot {
            Ok(snapshot) => {
                let mut detector = self.detector.lock().unwrap_or_else(|e| e.into_inner());
                detector.should_stop(&snapshot)
            }
            Err(e) => {
                tracing::warn!("Convergence snapshot for {} failed: {}", context, e);
                ConvergenceDecision::fallback(format!("Store unavailable: {}", e))
            }
        };

        self.events.publish(ProgressEvent::Convergence {
            context_id: context.clone(),
            should_stop: decision.should_stop,
            confidence: decision.confidence,
            progress: decision.progress,
            reason: decision.reason.clone(),
        });
        decision
    }

    // ========================================================================
    // Context bookkeeping
    // ========================================================================

    /// Give `item` its initial rating unless it already has one
    pub async fn seed_item(&self, context: &ContextId, item: &ItemId) -> Result<bool> {
        let rating = self
            .engine
            .create_initial_rating(item.clone(), context.clone(), Utc::now());
        let created = self
            .config
            .store_retry
            .run("seed item", || self.store.seed(rating.clone()))
            .await?;
        Ok(created)
    }

    /// Persist the completion flag for `context`
    pub async fn mark_complete(&self, context: &ContextId, reason: &str) -> Result<()> {
        let completion = Completion {
            at: Utc::now(),
            reason: reason.to_string(),
        };
        self.config
            .store_retry
            .run("mark complete", || self.store.set_completion(context, Some(completion.clone())))
            .await?;
        tracing::info!("Context {} complete: {}", context, reason);
        Ok(())
    }

    /// Clear the completion flag so the context can run again
    pub async fn reopen(&self, context: &ContextId) -> Result<()> {
        self.config
            .store_retry
            .run("reopen context", || self.store.set_completion(context, None))
            .await?;
        Ok(())
    }

    pub async fn is_complete(&self, context: &ContextId) -> Result<bool> {
        let stored = self
            .config
            .store_retry
            .run("read context", || self.store.context(context))
            .await?;
        Ok(stored.map(|c| c.completed).unwrap_or(false))
    }

    // ========================================================================
    // Level 2 - Phases
    // ========================================================================

    async fn select_pair(&self, context: &ContextId) -> Option<Selection> {
        let snapshot = self
            .config
            .store_retry
            .run("selection snapshot", || {
                self.store.snapshot(context, self.config.recent_battle_window)
            })
            .await;

        match snapshot {
            Ok(snapshot) => self.matchmaker.select_next_pair(&snapshot.ratings, &snapshot.battles),
            Err(e) => {
                tracing::warn!("Selection snapshot for {} failed: {}", context, e);
                None
            }
        }
    }

    async fn judge_pair(&self, battle: &Battle) -> std::result::Result<Verdict, JudgeError> {
        let request = JudgeRequest {
            context_id: battle.context_id.clone(),
            item_a: battle.item_a.clone(),
            item_b: battle.item_b.clone(),
            criteria: self.config.judge_criteria.clone(),
        };
        let limit = self.config.judge_timeout();

        let verdict = tokio::time::timeout(limit, self.judge.judge(&request))
            .await
            .map_err(|_| JudgeError::Timeout(limit))??;
        if !verdict.outcome.is_resolved() {
            return Err(JudgeError::Failed("judge returned a pending outcome".to_string()));
        }
        Ok(verdict)
    }

    async fn resolve(&self, mut battle: Battle, verdict: Verdict) -> Result<Battle> {
        let lock = self.context_lock(&battle.context_id);
        let _guard = lock.lock().await;

        let participants = [battle.item_a.clone(), battle.item_b.clone()];
        let current = self
            .config
            .store_retry
            .run("read ratings", || self.store.batch_latest(&battle.context_id, &participants))
            .await?;

        let now = Utc::now();
        let (rating_a, rating_b) = self.engine.resolve(&battle, verdict.outcome, &current, now)?;

        battle.outcome = verdict.outcome;
        battle.judge_id = verdict.judge_id;
        battle.completed_at = Some(now);
        let record_a = RatingRecord::from_battle(rating_a, battle.id);
        let record_b = RatingRecord::from_battle(rating_b, battle.id);

        self.config
            .store_retry
            .run("resolve battle", || {
                self.store.resolve_battle(&battle, record_a.clone(), record_b.clone())
            })
            .await?;

        tracing::debug!(
            "{}: {} vs {} -> {}",
            battle.context_id,
            battle.item_a,
            battle.item_b,
            battle.outcome
        );
        self.events.publish(ProgressEvent::BattleResolved {
            context_id: battle.context_id.clone(),
            battle_id: battle.id,
            item_a: battle.item_a.clone(),
            item_b: battle.item_b.clone(),
            outcome: battle.outcome,
        });
        Ok(battle)
    }

    async fn abandon(&self, battle: &Battle, reason: &str) {
        tracing::warn!("Battle {} in {} abandoned: {}", battle.id, battle.context_id, reason);

        let abandoned = self
            .config
            .store_retry
            .run("abandon battle", || {
                self.store.abandon_battle(&battle.context_id, battle.id, reason)
            })
            .await;
        if let Err(e) = abandoned {
            tracing::error!("Could not abandon battle {}: {}", battle.id, e);
        }

        self.events.publish(ProgressEvent::BattleAbandoned {
            context_id: battle.context_id.clone(),
            battle_id: battle.id,
            reason: reason.to_string(),
        });
    }

    // ========================================================================
    // Level 4 - Locks
    // ========================================================================

    fn context_lock(&self, context: &ContextId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(context.clone()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::events::BroadcastSink;
    use crate::judge::FnJudge;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryRatingStore;
    use arena_core::Outcome;
    use async_trait::async_trait;
    use std::time::Duration;

    struct SlowJudge;

    #[async_trait]
    impl Judge for SlowJudge {
        async fn judge(&self, _request: &JudgeRequest) -> std::result::Result<Verdict, JudgeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Verdict::new(Outcome::AWin))
        }
    }

    fn always(outcome: Outcome) -> Arc<dyn Judge> {
        Arc::new(FnJudge::new("stub", move |_: &JudgeRequest| Ok(outcome)))
    }

    async fn runner_with(judge: Arc<dyn Judge>, items: &[&str]) -> (BattleRunner, Arc<MemoryRatingStore>) {
        let store = Arc::new(MemoryRatingStore::new());
        let config = CoordinatorConfig::default()
            .with_judge_timeout(Duration::from_secs(1))
            .with_store_retry(RetryPolicy::none());
        let runner = BattleRunner::new(store.clone(), judge, Arc::new(BroadcastSink::new(64)), config);
        let context = ContextId::from("ctx");
        for item in items {
            runner.seed_item(&context, &ItemId::from(*item)).await.unwrap();
        }
        (runner, store)
    }

    #[tokio::test]
    async fn test_battle_updates_both_ratings() {
        let (runner, store) = runner_with(always(Outcome::AWin), &["a", "b"]).await;
        let context = ContextId::from("ctx");

        let battle = runner.run_battle(&context).await.unwrap();
        assert_eq!(battle.outcome, Outcome::AWin);
        assert_eq!(battle.judge_id.as_deref(), Some("stub"));

        let winner = store.latest(&context, &battle.item_a).await.unwrap().unwrap();
        let loser = store.latest(&context, &battle.item_b).await.unwrap().unwrap();
        assert_eq!(winner.battle_count, 1);
        assert_eq!(loser.battle_count, 1);
        assert!(winner.ordinal > loser.ordinal);
        assert_eq!(store.battle_count(&context).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_single_item_has_no_pair() {
        let (runner, _) = runner_with(always(Outcome::AWin), &["only"]).await;
        let err = runner.run_battle(&"ctx".into()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NoPair(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_judge_timeout_abandons_battle() {
        let (runner, store) = runner_with(Arc::new(SlowJudge), &["a", "b"]).await;
        let context = ContextId::from("ctx");

        let err = runner.run_battle(&context).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Judge(JudgeError::Timeout(_))));

        assert_eq!(store.battle_count(&context).await.unwrap(), 0);
        assert_eq!(store.abandoned_battles(&context).len(), 1);
        assert!(store.pending_battles(&context).is_empty());
        let a = store.latest(&context, &"a".into()).await.unwrap().unwrap();
        assert_eq!(a.battle_count, 0);
    }

    #[tokio::test]
    async fn test_judge_failure_is_not_a_draw() {
        let judge: Arc<dyn Judge> = Arc::new(FnJudge::new("flaky", |_: &JudgeRequest| {
            Err(JudgeError::Failed("model offline".into()))
        }));
        let (runner, store) = runner_with(judge, &["a", "b"]).await;
        let context = ContextId::from("ctx");

        let err = runner.run_battle(&context).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.recent_battles(&context, 10).await.unwrap().is_empty());
        let (abandoned, reason) = &store.abandoned_battles(&context)[0];
        assert_eq!(abandoned.outcome, Outcome::Pending);
        assert!(reason.contains("model offline"));
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades() {
        let (runner, store) = runner_with(always(Outcome::AWin), &["a", "b"]).await;
        let context = ContextId::from("ctx");
        store.inject_transient_failures(100);

        let err = runner.run_battle(&context).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NoPair(_)));

        let decision = runner.check_convergence(&context).await;
        assert!(!decision.should_stop);
        assert_eq!(decision.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_completion_flag() {
        let (runner, _) = runner_with(always(Outcome::Draw), &["a", "b"]).await;
        let context = ContextId::from("ctx");
        assert!(!runner.is_complete(&context).await.unwrap());

        runner.mark_complete(&context, "done").await.unwrap();
        assert!(runner.is_complete(&context).await.unwrap());
        runner.reopen(&context).await.unwrap();
        assert!(!runner.is_complete(&context).await.unwrap());
    }

    #[test]
    fn test_store_error_surfaces_as_store() {
        let err: CoordinatorError = StoreError::Transient("x".into()).into();
        assert!(matches!(err, CoordinatorError::Store(_)));
    }
}

//! Integration tests for arena-coordinator
//!
//! Queue protocol under concurrency and restarts, and workers driving
//! battles end to end against in-memory stores.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arena_coordinator::{
    BattleRunner, BroadcastSink, CoordinatorConfig, FnJudge, JsonFileTaskStore, Judge, JudgeError, JudgeRequest,
    MemoryRatingStore, MemoryTaskStore, ProgressEvent, RatingStore, RetryPolicy, TaskCoordinator, TaskKind,
    TaskStatus, TaskStore, TaskWorker, Verdict, WorkerId,
};
use arena_core::{ContextId, ItemId, Outcome};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// TEST FIXTURES
// ============================================================================

/// Lower item number always wins
fn ordered_judge() -> Arc<dyn Judge> {
    Arc::new(FnJudge::new("ordered", |req: &JudgeRequest| {
        Ok(if req.item_a < req.item_b {
            Outcome::AWin
        } else {
            Outcome::BWin
        })
    }))
}

/// Never answers within any reasonable timeout
struct HangingJudge;

#[async_trait]
impl Judge for HangingJudge {
    async fn judge(&self, _request: &JudgeRequest) -> Result<Verdict, JudgeError> {
        tokio::time::sleep(Duration::from_secs(10 * 3600)).await;
        Ok(Verdict::new(Outcome::Draw))
    }
}

fn items(n: usize) -> Vec<ItemId> {
    (0..n).map(|i| ItemId::new(format!("item-{i:02}"))).collect()
}

struct Arena {
    coordinator: Arc<TaskCoordinator>,
    runner: Arc<BattleRunner>,
    ratings: Arc<MemoryRatingStore>,
    events: BroadcastSink,
}

impl Arena {
    fn new(judge: Arc<dyn Judge>, config: CoordinatorConfig) -> Self {
        Self::with_tasks(judge, config, Arc::new(MemoryTaskStore::new()))
    }

    fn with_tasks(judge: Arc<dyn Judge>, config: CoordinatorConfig, tasks: Arc<dyn TaskStore>) -> Self {
        let ratings = Arc::new(MemoryRatingStore::new());
        let events = BroadcastSink::new(4096);
        let runner = Arc::new(BattleRunner::new(
            ratings.clone(),
            judge,
            Arc::new(events.clone()),
            config.clone(),
        ));
        let coordinator = Arc::new(TaskCoordinator::new(tasks, Arc::new(events.clone()), config));
        Self {
            coordinator,
            runner,
            ratings,
            events,
        }
    }

    fn worker(&self) -> TaskWorker {
        TaskWorker::new(self.coordinator.clone(), self.runner.clone())
    }

    async fn wait_for_finished(&self, count: usize) {
        loop {
            let stats = self.coordinator.stats().await.unwrap();
            if stats.completed + stats.failed + stats.cancelled >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// ============================================================================
// QUEUE PROTOCOL
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exactly_once() {
    let arena = Arena::new(ordered_judge(), CoordinatorConfig::default());
    for _ in 0..50 {
        arena
            .coordinator
            .create_task("ctx".into(), TaskKind::RunBattleLoop { max_battles: 1 })
            .await
            .unwrap();
    }

    let mut claimers = Vec::new();
    for _ in 0..8 {
        let coordinator = arena.coordinator.clone();
        claimers.push(tokio::spawn(async move {
            let worker = WorkerId::generate();
            let mut claimed = Vec::new();
            while let Some(task) = coordinator.claim_next(&worker).await.unwrap() {
                assert_eq!(task.owner.as_ref(), Some(&worker));
                claimed.push(task.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for claimer in claimers {
        all.extend(claimer.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 50);
    assert_eq!(unique.len(), 50);
    assert_eq!(arena.coordinator.stats().await.unwrap().processing, 50);
}

#[tokio::test]
async fn test_zombie_requeued_then_failed_at_limit() {
    let arena = Arena::new(ordered_judge(), CoordinatorConfig::default().with_max_retries(1));
    let task = arena
        .coordinator
        .create_task("ctx".into(), TaskKind::RunBattleLoop { max_battles: 5 })
        .await
        .unwrap();
    let later = Utc::now() + chrono::Duration::hours(2);

    arena.coordinator.claim_next(&WorkerId::new("crashed-1")).await.unwrap().unwrap();
    let report = arena.coordinator.recover_zombies_at(later).await.unwrap();
    assert_eq!(report.requeued, 1);
    let requeued = arena.coordinator.get(task.id).await.unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.owner.is_none());
    assert!(requeued.heartbeat_at.is_none());

    arena.coordinator.claim_next(&WorkerId::new("crashed-2")).await.unwrap().unwrap();
    let report = arena.coordinator.recover_zombies_at(later).await.unwrap();
    assert_eq!(report.failed, 1);
    let failed = arena.coordinator.get(task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error.is_some());
}

#[tokio::test]
async fn test_fresh_heartbeat_is_not_a_zombie() {
    let arena = Arena::new(ordered_judge(), CoordinatorConfig::default());
    arena
        .coordinator
        .create_task("ctx".into(), TaskKind::RunBattleLoop { max_battles: 5 })
        .await
        .unwrap();
    arena.coordinator.claim_next(&WorkerId::generate()).await.unwrap();

    let report = arena.coordinator.recover_zombies().await.unwrap();
    assert_eq!(report.requeued + report.failed, 0);
    assert_eq!(arena.coordinator.stats().await.unwrap().processing, 1);
}

#[tokio::test]
async fn test_json_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");

    let task_id = {
        let store = Arc::new(JsonFileTaskStore::open(&path).unwrap());
        let arena = Arena::with_tasks(ordered_judge(), CoordinatorConfig::default(), store);
        let task = arena
            .coordinator
            .create_task("ctx".into(), TaskKind::AddItems {
                items: items(3),
                start_loop: false,
            })
            .await
            .unwrap();
        arena.coordinator.claim_next(&WorkerId::new("lost")).await.unwrap();
        task.id
    };

    // The process died while the task was claimed.
    let store = Arc::new(JsonFileTaskStore::open(&path).unwrap());
    let arena = Arena::with_tasks(ordered_judge(), CoordinatorConfig::default(), store);
    let reloaded = arena.coordinator.get(task_id).await.unwrap();
    assert_eq!(reloaded.status, TaskStatus::Processing);

    let report = arena
        .coordinator
        .recover_zombies_at(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);

    let cancel = CancellationToken::new();
    let worker = arena.worker();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };
    arena.wait_for_finished(1).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    let done = arena.coordinator.get(task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(arena.ratings.current_ratings(&"ctx".into()).await.unwrap().len(), 3);
}

// ============================================================================
// WORKERS
// ============================================================================

#[tokio::test]
async fn test_worker_runs_context_to_convergence() {
    let arena = Arena::new(ordered_judge(), CoordinatorConfig::default());
    let context = ContextId::from("ctx");
    arena
        .coordinator
        .create_task(context.clone(), TaskKind::AddItems {
            items: items(8),
            start_loop: false,
        })
        .await
        .unwrap();
    let battles = arena
        .coordinator
        .create_task(context.clone(), TaskKind::RunBattleLoop { max_battles: 200 })
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let worker = arena.worker();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };
    tokio::time::timeout(Duration::from_secs(30), arena.wait_for_finished(2))
        .await
        .unwrap();
    cancel.cancel();
    run.await.unwrap().unwrap();

    let task = arena.coordinator.get(battles.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.progress.completed < 200);
    assert!(arena.runner.is_complete(&context).await.unwrap());

    let played = arena.ratings.battle_count(&context).await.unwrap();
    assert_eq!(played as u32, task.progress.completed);
    let history = arena.ratings.context_history(&context).await.unwrap();
    assert_eq!(history.len(), 8 + 2 * played);
}

#[tokio::test]
async fn test_add_items_is_fail_soft() {
    let config = CoordinatorConfig::default().with_store_retry(RetryPolicy::none());
    let arena = Arena::new(ordered_judge(), config);
    let worker = arena.worker();
    let task = arena
        .coordinator
        .create_task("ctx".into(), TaskKind::AddItems {
            items: items(3),
            start_loop: false,
        })
        .await
        .unwrap();
    arena.ratings.inject_transient_failures(1);

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };
    arena.wait_for_finished(1).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    let task = arena.coordinator.get(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.progress.completed, 2);
    assert_eq!(task.progress.failed, 1);
    assert_eq!(arena.ratings.current_ratings(&"ctx".into()).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_store_errors_are_retried() {
    let arena = Arena::new(ordered_judge(), CoordinatorConfig::default());
    let worker = arena.worker();
    let task = arena
        .coordinator
        .create_task("ctx".into(), TaskKind::AddItems {
            items: items(2),
            start_loop: false,
        })
        .await
        .unwrap();
    arena.ratings.inject_transient_failures(2);

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };
    arena.wait_for_finished(1).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    let task = arena.coordinator.get(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_claimed_task() {
    let arena = Arena::new(Arc::new(HangingJudge), CoordinatorConfig::default());
    let context = ContextId::from("ctx");
    for item in items(4) {
        arena.runner.seed_item(&context, &item).await.unwrap();
    }
    let task = arena
        .coordinator
        .create_task(context.clone(), TaskKind::RunBattleLoop { max_battles: 10 })
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let worker = arena.worker();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };
    while arena.coordinator.stats().await.unwrap().processing == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    run.await.unwrap().unwrap();

    let released = arena.coordinator.get(task.id).await.unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert!(released.owner.is_none());
    assert_eq!(released.retry_count, 0);
    // The battle in flight timed out and was counted, never drawn.
    assert_eq!(released.progress.failed, 1);
    assert_eq!(arena.ratings.battle_count(&context).await.unwrap(), 0);
    assert_eq!(arena.ratings.abandoned_battles(&context).len(), 1);
}

#[tokio::test]
async fn test_battle_events_are_published() {
    let arena = Arena::new(ordered_judge(), CoordinatorConfig::default());
    let mut events = arena.events.subscribe();
    let context = ContextId::from("ctx");
    for item in items(3) {
        arena.runner.seed_item(&context, &item).await.unwrap();
    }

    let battle = arena.runner.run_battle(&context).await.unwrap();
    let mut resolved = None;
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::BattleResolved { battle_id, outcome, .. } = event {
            resolved = Some((battle_id, outcome));
        }
    }
    assert_eq!(resolved, Some((battle.id, battle.outcome)));
}

#[tokio::test]
async fn test_failed_resolution_abandons_battle() {
    let ratings = Arc::new(MemoryRatingStore::new());
    let flaky = ratings.clone();
    // The store goes down after the battle is recorded, while the judge deliberates.
    let judge = Arc::new(FnJudge::new("flaky-store", move |_req: &JudgeRequest| {
        flaky.inject_transient_failures(1);
        Ok(Outcome::AWin)
    }));
    let events = BroadcastSink::new(64);
    let mut rx = events.subscribe();
    let runner = BattleRunner::new(
        ratings.clone(),
        judge,
        Arc::new(events.clone()),
        CoordinatorConfig::default().with_store_retry(RetryPolicy::none()),
    );
    let context = ContextId::from("ctx");
    for item in items(3) {
        runner.seed_item(&context, &item).await.unwrap();
    }

    let err = runner.run_battle(&context).await.unwrap_err();
    assert!(err.is_retryable());

    assert!(ratings.pending_battles(&context).is_empty());
    let abandoned = ratings.abandoned_battles(&context);
    assert_eq!(abandoned.len(), 1);
    assert!(abandoned[0].1.contains("resolution failed"));
    assert_eq!(ratings.battle_count(&context).await.unwrap(), 0);
    for rating in ratings.current_ratings(&context).await.unwrap() {
        assert_eq!(rating.battle_count, 0);
    }

    let mut saw_abandoned = false;
    while let Ok(event) = rx.try_recv() {
        if let ProgressEvent::BattleAbandoned { battle_id, .. } = event {
            assert_eq!(battle_id, abandoned[0].0.id);
            saw_abandoned = true;
        }
    }
    assert!(saw_abandoned);
}

//! Task worker - claims queued tasks and executes them
//!
//! ## Architecture (4-layer granularity)
//!
//! - Level 1: TaskWorker::run (dequeue loop, recovery ticker, shutdown)
//! - Level 2: process (heartbeat ticker around one task)
//! - Level 3: add_items, run_battles
//! - Level 4: heartbeat loop
//!
//! Failures of single units (one item, one battle) are counted and never
//! abort the task; an error from the queue itself fails the task, and the
//! worker moves on.

use std::sync::Arc;

use arena_core::{ContextId, ItemId};
use tokio_util::sync::CancellationToken;

use crate::battle::BattleRunner;
use crate::coordinator::TaskCoordinator;
use crate::error::{CoordinatorError, Result};
use crate::supervisor::LoopSupervisor;
use crate::task::{Task, TaskId, TaskKind, WorkerId};

/// How a task run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Execution {
    /// The task reached a terminal status
    Finished,
    /// The worker was cancelled mid-task; the task stays claimed until released
    Interrupted,
}

pub struct TaskWorker {
    id: WorkerId,
    coordinator: Arc<TaskCoordinator>,
    runner: Arc<BattleRunner>,
    supervisor: Option<Arc<LoopSupervisor>>,
}

impl TaskWorker {
    pub fn new(coordinator: Arc<TaskCoordinator>, runner: Arc<BattleRunner>) -> Self {
        Self {
            id: WorkerId::generate(),
            coordinator,
            runner,
            supervisor: None,
        }
    }

    /// Supervisor used to start battle loops after ADD_ITEMS
    pub fn with_supervisor(mut self, supervisor: Arc<LoopSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    // ========================================================================
    // Level 1 - Worker loop
    // ========================================================================

    /// Process tasks until `cancel` fires, then hand back any claimed task.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Worker {} starting", self.id);

        if let Err(e) = self.coordinator.recover_zombies().await {
            tracing::warn!("Startup zombie scan failed: {}", e);
        }

        let recovery_cancel = cancel.child_token();
        let recovery = tokio::spawn(recovery_loop(self.coordinator.clone(), recovery_cancel.clone()));

        loop {
            let task = match self.coordinator.next_task(&self.id, &cancel).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Worker {} could not dequeue: {}", self.id, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.coordinator.config().idle_recheck()) => continue,
                    }
                }
            };

            if self.process(task, &cancel).await == Execution::Interrupted {
                break;
            }
        }

        recovery_cancel.cancel();
        if let Err(e) = recovery.await {
            tracing::error!("Recovery ticker ended abnormally: {}", e);
        }

        let released = self.coordinator.release_owned(&self.id).await?;
        tracing::info!("Worker {} stopped ({} task(s) released)", self.id, released);
        Ok(())
    }

    // ========================================================================
    // Level 2 - One task
    // ========================================================================

    async fn process(&self, task: Task, cancel: &CancellationToken) -> Execution {
        let beat = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.coordinator.clone(),
            task.id,
            self.id.clone(),
            beat.clone(),
        ));

        let outcome = self.execute(&task, cancel).await;

        beat.cancel();
        if let Err(e) = heartbeat.await {
            tracing::error!("Heartbeat for task {} ended abnormally: {}", task.id, e);
        }

        match outcome {
            Ok(execution) => execution,
            Err(e) => {
                tracing::error!("Task {} ({}) failed: {}", task.id, task.kind.name(), e);
                if let Err(fail_err) = self.coordinator.fail(task.id, &self.id, &e.to_string()).await {
                    tracing::error!("Could not mark task {} failed: {}", task.id, fail_err);
                }
                Execution::Finished
            }
        }
    }

    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<Execution> {
        match &task.kind {
            TaskKind::AddItems { items, start_loop } => self.add_items(task, items, *start_loop, cancel).await,
            TaskKind::RunBattleLoop { max_battles } => self.run_battles(task, *max_battles, cancel).await,
        }
    }

    // ========================================================================
    // Level 3 - Task kinds
    // ========================================================================

    /// Seed every item not yet processed; a requeued task resumes where it stopped
    async fn add_items(
        &self,
        task: &Task,
        items: &[ItemId],
        start_loop: bool,
        cancel: &CancellationToken,
    ) -> Result<Execution> {
        let context = &task.context_id;
        let mut completed = task.progress.completed;
        let mut failed = task.progress.failed;

        for item in items.iter().skip(task.progress.processed() as usize) {
            if cancel.is_cancelled() {
                return Ok(Execution::Interrupted);
            }

            match self.runner.seed_item(context, item).await {
                Ok(_) => completed += 1,
                Err(e) => {
                    tracing::warn!("Could not add {} to {}: {}", item, context, e);
                    failed += 1;
                }
            }
            self.coordinator
                .update_progress(task.id, &self.id, completed, failed, Some(item.to_string()))
                .await?;
        }

        let finished = self.coordinator.finish(task.id, &self.id).await?;
        tracing::info!(
            "Added {} item(s) to {} ({} failed), task {}",
            completed,
            context,
            failed,
            finished.status
        );

        if start_loop {
            self.start_loop(context).await;
        }
        Ok(Execution::Finished)
    }

    /// Run battles until the budget is spent, the context converges or no
    /// pair is left
    async fn run_battles(&self, task: &Task, max_battles: u32, cancel: &CancellationToken) -> Result<Execution> {
        let context = &task.context_id;
        let mut completed = task.progress.completed;
        let mut failed = task.progress.failed;

        while completed + failed < max_battles {
            if cancel.is_cancelled() {
                return Ok(Execution::Interrupted);
            }

            let decision = self.runner.check_convergence(context).await;
            if decision.should_stop {
                self.runner.mark_complete(context, &decision.reason).await?;
                break;
            }

            match self.runner.run_battle(context).await {
                Ok(_) => completed += 1,
                Err(CoordinatorError::NoPair(_)) => {
                    tracing::info!("No pair left in {}, ending battle run early", context);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Battle in {} failed: {}", context, e);
                    failed += 1;
                }
            }

            let note = format!("battle {}", completed + failed);
            self.coordinator
                .update_progress(task.id, &self.id, completed, failed, Some(note))
                .await?;
        }

        self.coordinator.finish(task.id, &self.id).await?;
        Ok(Execution::Finished)
    }

    async fn start_loop(&self, context: &ContextId) {
        let Some(supervisor) = &self.supervisor else {
            tracing::warn!("No loop supervisor attached; not starting the loop for {}", context);
            return;
        };
        match supervisor.start(context).await {
            Ok(true) => tracing::info!("Started battle loop for {}", context),
            Ok(false) => tracing::debug!("Battle loop for {} already running", context),
            Err(e) => tracing::error!("Could not start battle loop for {}: {}", context, e),
        }
    }
}

// ============================================================================
// Level 4 - Background tickers
// ============================================================================

async fn heartbeat_loop(coordinator: Arc<TaskCoordinator>, task: TaskId, worker: WorkerId, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(coordinator.config().heartbeat_interval());
    // The claim itself stamped the first heartbeat.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = coordinator.heartbeat(task, &worker).await {
            tracing::debug!("Heartbeat for task {} stopped: {}", task, e);
            return;
        }
    }
}

async fn recovery_loop(coordinator: Arc<TaskCoordinator>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(coordinator.config().zombie_scan_interval());
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match coordinator.recover_zombies().await {
            Ok(report) if report.requeued + report.failed > 0 => {
                tracing::info!(
                    "Zombie scan: {} requeued, {} failed",
                    report.requeued,
                    report.failed
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Zombie scan failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::events::TracingSink;
    use crate::judge::{FnJudge, JudgeRequest};
    use crate::store::{MemoryRatingStore, MemoryTaskStore, RatingStore};
    use crate::task::TaskStatus;
    use arena_core::Outcome;

    fn setup() -> (Arc<TaskCoordinator>, Arc<BattleRunner>, Arc<MemoryRatingStore>) {
        let config = CoordinatorConfig::default();
        let ratings = Arc::new(MemoryRatingStore::new());
        let judge = Arc::new(FnJudge::new("stub", |_: &JudgeRequest| Ok(Outcome::AWin)));
        let runner = Arc::new(BattleRunner::new(
            ratings.clone(),
            judge,
            Arc::new(TracingSink),
            config.clone(),
        ));
        let coordinator = Arc::new(TaskCoordinator::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(TracingSink),
            config,
        ));
        (coordinator, runner, ratings)
    }

    async fn run_one(worker: &TaskWorker, coordinator: &TaskCoordinator) -> Task {
        let task = coordinator.claim_next(worker.id()).await.unwrap().unwrap();
        let id = task.id;
        assert_eq!(worker.process(task, &CancellationToken::new()).await, Execution::Finished);
        coordinator.get(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_items_seeds_everything() {
        let (coordinator, runner, ratings) = setup();
        let worker = TaskWorker::new(coordinator.clone(), runner);
        let items: Vec<ItemId> = ["a", "b", "c"].into_iter().map(ItemId::from).collect();
        coordinator
            .create_task(
                "ctx".into(),
                TaskKind::AddItems {
                    items,
                    start_loop: false,
                },
            )
            .await
            .unwrap();

        let task = run_one(&worker, &coordinator).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress.completed, 3);
        assert_eq!(task.progress.note.as_deref(), Some("c"));
        assert_eq!(ratings.current_ratings(&"ctx".into()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_battle_run_respects_budget() {
        let (coordinator, runner, _) = setup();
        let context = ContextId::from("ctx");
        for id in ["a", "b", "c", "d"] {
            runner.seed_item(&context, &ItemId::from(id)).await.unwrap();
        }
        let worker = TaskWorker::new(coordinator.clone(), runner);
        coordinator
            .create_task(context, TaskKind::RunBattleLoop { max_battles: 3 })
            .await
            .unwrap();

        let task = run_one(&worker, &coordinator).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress.completed, 3);
        assert_eq!(task.progress.failed, 0);
    }

    #[tokio::test]
    async fn test_battle_run_without_pair_ends_early() {
        let (coordinator, runner, _) = setup();
        let worker = TaskWorker::new(coordinator.clone(), runner);
        coordinator
            .create_task("empty".into(), TaskKind::RunBattleLoop { max_battles: 10 })
            .await
            .unwrap();

        let task = run_one(&worker, &coordinator).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress.processed(), 0);
    }
}

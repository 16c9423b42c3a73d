//! Task coordinator - the durable queue protocol on top of a TaskStore
//!
//! ## Architecture (4-layer granularity)
//!
//! - Level 1: next_task (blocking dequeue), recover_zombies, release_owned
//! - Level 2: create/claim/heartbeat/progress/finish operations
//! - Level 3: update (read, transition, compare-and-swap save, retry on conflict)
//! - Level 4: QueueStats, RecoveryReport
//!
//! Task state rules live on [`Task`]; this type only sequences store calls,
//! wakes idle workers and publishes events.

use std::sync::Arc;

use arena_core::ContextId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result, StoreError, TaskError};
use crate::events::{EventSink, ProgressEvent};
use crate::store::TaskStore;
use crate::task::{Task, TaskFilter, TaskId, TaskKind, TaskStatus, WorkerId};

/// Counts per status plus the age of the oldest waiting task
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub oldest_pending_age_secs: Option<i64>,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// What a zombie scan did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

pub struct TaskCoordinator {
    store: Arc<dyn TaskStore>,
    events: Arc<dyn EventSink>,
    config: CoordinatorConfig,
    wake: Notify,
}

impl TaskCoordinator {
    pub fn new(store: Arc<dyn TaskStore>, events: Arc<dyn EventSink>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            events,
            config,
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ========================================================================
    // Producers
    // ========================================================================

    /// Enqueue a task with the configured retry limit and timeout
    pub async fn create_task(&self, context: ContextId, kind: TaskKind) -> Result<Task> {
        let task = Task::new(
            context,
            kind,
            self.config.max_retries,
            self.config.task_timeout_secs,
            Utc::now(),
        );
        self.enqueue(task).await
    }

    /// Enqueue a fully built task
    pub async fn enqueue(&self, task: Task) -> Result<Task> {
        task.check_size()?;
        self.store.insert(task.clone()).await?;
        tracing::info!(
            "Created {} task {} for {} ({} units)",
            task.kind.name(),
            task.id,
            task.context_id,
            task.progress.total
        );
        self.publish_status(&task);
        self.wake.notify_waiters();
        Ok(task)
    }

    // ========================================================================
    // Level 1 - Workers
    // ========================================================================

    /// Claim the oldest pending task, if any
    pub async fn claim_next(&self, worker: &WorkerId) -> Result<Option<Task>> {
        let claimed = self.store.claim_next(worker, Utc::now()).await?;
        if let Some(task) = &claimed {
            tracing::info!("{} claimed task {} ({})", worker, task.id, task.kind.name());
            self.publish_status(task);
        }
        Ok(claimed)
    }

    /// Wait until a task can be claimed. Returns `None` once `cancel` fires.
    ///
    /// Idle waiters wake on new or requeued tasks, and also re-check the
    /// store periodically for work enqueued by other processes.
    pub async fn next_task(&self, worker: &WorkerId, cancel: &CancellationToken) -> Result<Option<Task>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            // Register interest before looking, so a wake-up between the
            // empty claim and the select is not lost.
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.claim_next(worker).await? {
                return Ok(Some(task));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.config.idle_recheck()) => {}
            }
        }
    }

    /// Requeue or fail every processing task whose heartbeat is too old
    pub async fn recover_zombies(&self) -> Result<RecoveryReport> {
        self.recover_zombies_at(Utc::now()).await
    }

    /// Zombie scan against an explicit clock
    pub async fn recover_zombies_at(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let processing = self
            .store
            .list(&TaskFilter::default().with_status(TaskStatus::Processing))
            .await?;

        let mut report = RecoveryReport::default();
        for candidate in processing.into_iter().filter(|t| t.is_zombie(now)) {
            let recovered = self
                .update_if(candidate.id, |task| {
                    if !task.is_zombie(now) {
                        return Ok(false);
                    }
                    task.requeue_zombie(now)?;
                    Ok(true)
                })
                .await;

            match recovered {
                Ok(Some(task)) if task.status == TaskStatus::Pending => {
                    tracing::warn!(
                        "Recovered zombie task {} (retry {}/{})",
                        task.id,
                        task.retry_count,
                        task.max_retries
                    );
                    report.requeued += 1;
                }
                Ok(Some(task)) => {
                    tracing::error!("Task {} failed: {}", task.id, task.error.as_deref().unwrap_or("timed out"));
                    report.failed += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Could not recover task {}: {}", candidate.id, e),
            }
        }

        if report.requeued > 0 {
            self.wake.notify_waiters();
        }
        Ok(report)
    }

    /// Return every task `worker` is processing to the queue (graceful shutdown)
    pub async fn release_owned(&self, worker: &WorkerId) -> Result<usize> {
        let owned = self
            .store
            .list(
                &TaskFilter::default()
                    .with_status(TaskStatus::Processing)
                    .with_owner(worker.clone()),
            )
            .await?;

        let mut released = 0;
        for task in owned {
            match self.update(task.id, |t| t.release(worker)).await {
                Ok(_) => released += 1,
                Err(e) => tracing::warn!("Could not release task {}: {}", task.id, e),
            }
        }

        if released > 0 {
            tracing::info!("{} released {} task(s)", worker, released);
            self.wake.notify_waiters();
        }
        Ok(released)
    }

    // ========================================================================
    // Level 2 - Task operations
    // ========================================================================

    pub async fn heartbeat(&self, id: TaskId, worker: &WorkerId) -> Result<Task> {
        self.update(id, |t| t.heartbeat(worker, Utc::now())).await
    }

    pub async fn update_progress(
        &self,
        id: TaskId,
        worker: &WorkerId,
        completed: u32,
        failed: u32,
        note: Option<String>,
    ) -> Result<Task> {
        let task = self
            .update(id, |t| {
                t.record_progress(worker, completed, failed, note.clone())?;
                t.heartbeat(worker, Utc::now())
            })
            .await?;
        self.events.publish(ProgressEvent::TaskProgress {
            task_id: task.id,
            context_id: task.context_id.clone(),
            progress: task.progress.clone(),
        });
        Ok(task)
    }

    pub async fn complete(&self, id: TaskId, worker: &WorkerId) -> Result<Task> {
        self.update(id, |t| t.complete(worker, Utc::now())).await
    }

    pub async fn fail(&self, id: TaskId, worker: &WorkerId, error: &str) -> Result<Task> {
        self.update(id, |t| t.fail(worker, error, Utc::now())).await
    }

    /// Complete, or fail if any unit of work failed
    pub async fn finish(&self, id: TaskId, worker: &WorkerId) -> Result<Task> {
        self.update(id, |t| t.finish(worker, Utc::now())).await
    }

    /// Cancel a task that has not been claimed yet
    pub async fn cancel(&self, id: TaskId) -> Result<Task> {
        self.update(id, |t| t.cancel(Utc::now())).await
    }

    /// Put a failed task back in the queue for a fresh attempt
    pub async fn retry_failed(&self, id: TaskId) -> Result<Task> {
        let task = self.update(id, |t| t.retry()).await?;
        self.wake.notify_waiters();
        Ok(task)
    }

    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.store.get(id).await?.ok_or(CoordinatorError::TaskNotFound(id))
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let tasks = self.store.list(&TaskFilter::default()).await?;
        let now = Utc::now();
        let mut stats = QueueStats::default();
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.oldest_pending_age_secs = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.created_at)
            .min()
            .map(|oldest| (now - oldest).num_seconds());
        Ok(stats)
    }

    /// Delete finished tasks older than `older_than`
    pub async fn purge_finished(&self, older_than: Duration) -> Result<usize> {
        let removed = self.store.purge_finished(Utc::now() - older_than).await?;
        if removed > 0 {
            tracing::info!("Purged {} finished task(s)", removed);
        }
        Ok(removed)
    }

    // ========================================================================
    // Level 3 - Read, transition, save
    // ========================================================================

    async fn update<F>(&self, id: TaskId, mut change: F) -> Result<Task>
    where
        F: FnMut(&mut Task) -> std::result::Result<(), TaskError> + Send,
    {
        let updated = self
            .update_if(id, |task| {
                change(task)?;
                Ok(true)
            })
            .await?;
        match updated {
            Some(task) => Ok(task),
            None => self.get(id).await,
        }
    }

    /// Apply `change` and save with compare-and-swap, re-reading on conflict.
    /// `change` returns false to leave the task untouched.
    async fn update_if<F>(&self, id: TaskId, mut change: F) -> Result<Option<Task>>
    where
        F: FnMut(&mut Task) -> std::result::Result<bool, TaskError> + Send,
    {
        let mut attempt = 0;
        loop {
            let mut task = self.get(id).await?;
            let before = task.status;
            if !change(&mut task)? {
                return Ok(None);
            }

            match self.store.save(&task).await {
                Ok(saved) => {
                    if saved.status != before {
                        self.publish_status(&saved);
                    }
                    return Ok(Some(saved));
                }
                Err(StoreError::Conflict { .. }) if attempt < self.config.conflict_retries => {
                    attempt += 1;
                    tracing::debug!("Version conflict on task {}, re-reading (attempt {})", id, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn publish_status(&self, task: &Task) {
        self.events.publish(ProgressEvent::TaskStatusChanged {
            task_id: task.id,
            context_id: task.context_id.clone(),
            kind: task.kind.name().to_string(),
            status: task.status,
            progress: task.progress.clone(),
        });
    }
}

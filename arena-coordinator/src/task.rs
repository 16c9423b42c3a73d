//! Durable background tasks and their state machine
//!
//! ```text
//! PENDING ──claim──▶ PROCESSING ──finish──▶ COMPLETED | FAILED
//!    │                   │
//!    │                   └──release / zombie requeue──▶ PENDING
//!    └──cancel──▶ CANCELLED          FAILED ──retry──▶ PENDING
//! ```
//!
//! Every transition is a method on [`Task`] that checks the current state and
//! the caller's ownership before mutating anything.

use std::fmt;

use arena_core::{ContextId, ItemId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Identifier of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of a worker process
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// A fresh `worker-<uuid>` identity
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::new_v4()))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown task status: {}", s))
    }
}

/// What a task does
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// Seed ratings for new items, optionally starting the context's battle loop
    AddItems {
        items: Vec<ItemId>,
        #[serde(default)]
        start_loop: bool,
    },
    /// Run up to `max_battles` battles, stopping early on convergence
    RunBattleLoop { max_battles: u32 },
}

impl TaskKind {
    /// Units of work, used as the progress total.
    ///
    /// `None` when the item list does not fit the progress counters.
    pub fn units(&self) -> Option<u32> {
        match self {
            TaskKind::AddItems { items, .. } => u32::try_from(items.len()).ok(),
            TaskKind::RunBattleLoop { max_battles } => Some(*max_battles),
        }
    }

    /// Progress total; saturates for oversized item lists, which
    /// [`Task::check_size`] rejects before they reach a queue.
    pub fn total(&self) -> u32 {
        self.units().unwrap_or(u32::MAX)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::AddItems { .. } => "ADD_ITEMS",
            TaskKind::RunBattleLoop { .. } => "RUN_BATTLE_LOOP",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    /// What the worker is currently on, e.g. an item id
    pub note: Option<String>,
}

impl TaskProgress {
    pub fn processed(&self) -> u32 {
        self.completed.saturating_add(self.failed)
    }

    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.processed())
    }
}

/// A unit of background work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub context_id: ContextId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: TaskProgress,
    pub retry_count: u32,
    pub max_retries: u32,
    pub owner: Option<WorkerId>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Heartbeat age after which a processing task counts as abandoned
    pub timeout_secs: u64,
    /// Bumped by the store on every save
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(context_id: ContextId, kind: TaskKind, max_retries: u32, timeout_secs: u64, now: DateTime<Utc>) -> Self {
        let progress = TaskProgress {
            total: kind.total(),
            ..Default::default()
        };
        Self {
            id: TaskId::new(),
            context_id,
            kind,
            status: TaskStatus::Pending,
            progress,
            retry_count: 0,
            max_retries,
            owner: None,
            heartbeat_at: None,
            timeout_secs,
            version: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.owner.as_ref() == Some(worker)
    }

    /// PROCESSING with a heartbeat older than the task's timeout
    pub fn is_zombie(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Processing {
            return false;
        }
        let last_sign_of_life = self.heartbeat_at.or(self.started_at).unwrap_or(self.created_at);
        now - last_sign_of_life > Duration::seconds(self.timeout_secs as i64)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// PENDING -> PROCESSING, owned by `worker`
    pub fn claim(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.expect_status(TaskStatus::Pending, TaskStatus::Processing)?;
        self.status = TaskStatus::Processing;
        self.owner = Some(worker.clone());
        self.heartbeat_at = Some(now);
        self.started_at = Some(now);
        Ok(())
    }

    pub fn heartbeat(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.expect_owned_processing(worker, TaskStatus::Processing)?;
        self.heartbeat_at = Some(now);
        Ok(())
    }

    /// Set the progress counters. They may only grow and never exceed the total.
    pub fn record_progress(
        &mut self,
        worker: &WorkerId,
        completed: u32,
        failed: u32,
        note: Option<String>,
    ) -> Result<(), TaskError> {
        self.expect_owned_processing(worker, TaskStatus::Processing)?;

        if completed < self.progress.completed || failed < self.progress.failed {
            return Err(self.invalid_progress(format!(
                "counters may not decrease ({}/{} -> {}/{})",
                self.progress.completed, self.progress.failed, completed, failed
            )));
        }
        let processed = completed
            .checked_add(failed)
            .ok_or_else(|| self.invalid_progress(format!("{} completed + {} failed overflows", completed, failed)))?;
        if processed > self.progress.total {
            return Err(self.invalid_progress(format!(
                "{} completed + {} failed exceeds total {}",
                completed, failed, self.progress.total
            )));
        }

        self.progress.completed = completed;
        self.progress.failed = failed;
        self.progress.note = note;
        Ok(())
    }

    /// PROCESSING -> COMPLETED, or FAILED if any unit failed
    pub fn finish(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), TaskError> {
        if self.progress.failed > 0 {
            let message = format!("{} of {} units failed", self.progress.failed, self.progress.total);
            self.fail(worker, message, now)
        } else {
            self.complete(worker, now)
        }
    }

    pub fn complete(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.expect_owned_processing(worker, TaskStatus::Completed)?;
        self.status = TaskStatus::Completed;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, worker: &WorkerId, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.expect_owned_processing(worker, TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(now);
        Ok(())
    }

    /// PROCESSING -> PENDING without a retry charge (graceful shutdown)
    pub fn release(&mut self, worker: &WorkerId) -> Result<(), TaskError> {
        self.expect_owned_processing(worker, TaskStatus::Pending)?;
        self.clear_claim();
        Ok(())
    }

    /// Recover a task whose worker stopped heartbeating. Returns the new status.
    pub fn requeue_zombie(&mut self, now: DateTime<Utc>) -> Result<TaskStatus, TaskError> {
        if self.status != TaskStatus::Processing {
            return Err(self.invalid_transition(TaskStatus::Pending));
        }

        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.clear_claim();
        } else {
            self.status = TaskStatus::Failed;
            self.error = Some(format!(
                "worker stopped heartbeating after {} retries",
                self.retry_count
            ));
            self.finished_at = Some(now);
            self.owner = None;
        }
        Ok(self.status)
    }

    /// PENDING -> CANCELLED
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.expect_status(TaskStatus::Pending, TaskStatus::Cancelled)?;
        self.status = TaskStatus::Cancelled;
        self.finished_at = Some(now);
        Ok(())
    }

    /// FAILED -> PENDING for another full attempt
    pub fn retry(&mut self) -> Result<(), TaskError> {
        self.expect_status(TaskStatus::Failed, TaskStatus::Pending)?;
        self.status = TaskStatus::Pending;
        self.owner = None;
        self.heartbeat_at = None;
        self.finished_at = None;
        self.error = None;
        self.progress = TaskProgress {
            total: self.progress.total,
            ..Default::default()
        };
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn clear_claim(&mut self) {
        self.status = TaskStatus::Pending;
        self.owner = None;
        self.heartbeat_at = None;
    }

    fn expect_status(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskError> {
        if self.status != from {
            return Err(self.invalid_transition(to));
        }
        Ok(())
    }

    fn expect_owned_processing(&self, worker: &WorkerId, to: TaskStatus) -> Result<(), TaskError> {
        self.expect_status(TaskStatus::Processing, to)?;
        if !self.is_owned_by(worker) {
            return Err(TaskError::NotOwner {
                task: self.id,
                caller: worker.clone(),
            });
        }
        Ok(())
    }

    fn invalid_transition(&self, to: TaskStatus) -> TaskError {
        TaskError::InvalidTransition {
            task: self.id,
            from: self.status,
            to,
        }
    }

    /// Reject payloads whose unit count does not fit the progress counters
    pub fn check_size(&self) -> Result<(), TaskError> {
        match self.kind.units() {
            Some(_) => Ok(()),
            None => Err(self.invalid_progress(format!("{} has too many units", self.kind.name()))),
        }
    }

    fn invalid_progress(&self, reason: String) -> TaskError {
        TaskError::InvalidProgress { task: self.id, reason }
    }
}

/// Selection criteria for listing tasks
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub context_id: Option<ContextId>,
    pub owner: Option<WorkerId>,
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_context(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn with_owner(mut self, owner: WorkerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.context_id.as_ref().map_or(true, |c| &task.context_id == c)
            && self.owner.as_ref().map_or(true, |o| task.owner.as_ref() == Some(o))
    }
}

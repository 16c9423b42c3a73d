//! Error types for the coordination layer

use std::time::Duration;

use arena_core::{ContextId, RatingError};

use crate::task::{TaskId, TaskStatus, WorkerId};

/// Errors from rating and task persistence
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Temporary failure; the same call may succeed if repeated
    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    /// Optimistic concurrency check failed on save
    #[error("task {task} was modified concurrently (expected version {expected}, found {found})")]
    Conflict { task: TaskId, expected: u64, found: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    /// The write would break a store invariant
    #[error("rejected: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors returned by a judge
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JudgeError {
    #[error("judge failed: {0}")]
    Failed(String),

    #[error("judge did not answer within {0:?}")]
    Timeout(Duration),
}

/// Rejected task state changes
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition { task: TaskId, from: TaskStatus, to: TaskStatus },

    #[error("task {task} is not owned by {caller}")]
    NotOwner { task: TaskId, caller: WorkerId },

    #[error("invalid progress for task {task}: {reason}")]
    InvalidProgress { task: TaskId, reason: String },
}

/// Umbrella error for coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Judge(#[from] JudgeError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Rating(#[from] RatingError),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("no pair available in context {0}")]
    NoPair(ContextId),
}

impl CoordinatorError {
    /// Whether repeating the operation later may succeed.
    ///
    /// Judge failures and timeouts count as retryable battle attempts.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::Store(e) => e.is_transient() || matches!(e, StoreError::Conflict { .. }),
            CoordinatorError::Judge(_) => true,
            CoordinatorError::Task(_)
            | CoordinatorError::Rating(_)
            | CoordinatorError::TaskNotFound(_)
            | CoordinatorError::NoPair(_) => false,
        }
    }
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;

//! Persistence seams for ratings, battles and tasks
//!
//! Both stores are async traits so that database-backed implementations can
//! slot in; this crate ships in-memory stores and a JSON-file task store.

mod json_file;
mod memory;

pub use json_file::JsonFileTaskStore;
pub use memory::{MemoryRatingStore, MemoryTaskStore};

use arena_core::{Battle, BattleId, ContextId, ContextSnapshot, ItemId, Rating, RatingRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::task::{Task, TaskFilter, TaskId, WorkerId};

pub type StoreResult<T> = Result<T, StoreError>;

/// An evaluation context and its persisted completion flag
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub id: ContextId,
    pub items: Vec<ItemId>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub completion_reason: Option<String>,
}

impl EvaluationContext {
    pub fn new(id: ContextId) -> Self {
        Self {
            id,
            items: Vec::new(),
            completed: false,
            completed_at: None,
            completion_reason: None,
        }
    }
}

/// Why and when a context stopped
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Summary statistics of a context's ratings and battles
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextAggregates {
    pub item_count: usize,
    pub average_sigma: f64,
    pub min_battle_count: u32,
    pub max_battle_count: u32,
    /// Resolved battles completed at or after the requested time
    pub battles_since: usize,
}

/// Ratings, their history and battles, per context
#[async_trait]
pub trait RatingStore: Send + Sync {
    /// Create the item's rating if it has none. Returns whether it was created.
    async fn seed(&self, rating: Rating) -> StoreResult<bool>;

    async fn latest(&self, context: &ContextId, item: &ItemId) -> StoreResult<Option<Rating>>;

    async fn batch_latest(&self, context: &ContextId, items: &[ItemId]) -> StoreResult<FxHashMap<ItemId, Rating>>;

    /// Current rating of every item in the context
    async fn current_ratings(&self, context: &ContextId) -> StoreResult<Vec<Rating>>;

    /// The item's most recent `limit` records, oldest first
    async fn history(&self, context: &ContextId, item: &ItemId, limit: usize) -> StoreResult<Vec<RatingRecord>>;

    /// Every record of the context, oldest first
    async fn context_history(&self, context: &ContextId) -> StoreResult<Vec<RatingRecord>>;

    /// Append one record. Records of an item must not go back in time.
    async fn append(&self, record: RatingRecord) -> StoreResult<()>;

    /// Register a pending battle
    async fn record_battle(&self, battle: &Battle) -> StoreResult<()>;

    /// Store a resolved battle together with both participants' new records
    async fn resolve_battle(&self, battle: &Battle, record_a: RatingRecord, record_b: RatingRecord) -> StoreResult<()>;

    /// Drop a pending battle that will never resolve
    async fn abandon_battle(&self, context: &ContextId, battle: BattleId, reason: &str) -> StoreResult<()>;

    /// The newest `limit` resolved battles, oldest first
    async fn recent_battles(&self, context: &ContextId, limit: usize) -> StoreResult<Vec<Battle>>;

    /// Count of resolved battles
    async fn battle_count(&self, context: &ContextId) -> StoreResult<usize>;

    async fn aggregates(&self, context: &ContextId, since: Option<DateTime<Utc>>) -> StoreResult<ContextAggregates>;

    async fn context(&self, context: &ContextId) -> StoreResult<Option<EvaluationContext>>;

    /// Set or clear the completion flag
    async fn set_completion(&self, context: &ContextId, completion: Option<Completion>) -> StoreResult<()>;

    /// Point-in-time view used by the selector and the convergence detector
    async fn snapshot(&self, context: &ContextId, battle_limit: usize) -> StoreResult<ContextSnapshot> {
        let ratings = self.current_ratings(context).await?;
        let history = self.context_history(context).await?;
        let battles = self.recent_battles(context, battle_limit).await?;
        let total_battles = self.battle_count(context).await?;
        Ok(ContextSnapshot {
            context_id: Some(context.clone()),
            ratings,
            history,
            battles,
            total_battles,
            taken_at: Some(Utc::now()),
        })
    }
}

/// Durable task queue
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task) -> StoreResult<()>;

    async fn get(&self, id: TaskId) -> StoreResult<Option<Task>>;

    /// Matching tasks, oldest first
    async fn list(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>>;

    /// Atomically claim the oldest pending task for `owner`
    async fn claim_next(&self, owner: &WorkerId, now: DateTime<Utc>) -> StoreResult<Option<Task>>;

    /// Compare-and-swap on `version`. Returns the stored copy with the new version.
    async fn save(&self, task: &Task) -> StoreResult<Task>;

    /// Delete terminal tasks finished before `before`. Returns how many were removed.
    async fn purge_finished(&self, before: DateTime<Utc>) -> StoreResult<usize>;
}

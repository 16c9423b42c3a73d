//! In-memory stores
//!
//! Locks are std locks and are never held across an `.await`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arena_core::{Battle, BattleId, ContextId, ItemId, Rating, RatingRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::{Completion, ContextAggregates, EvaluationContext, RatingStore, StoreResult, TaskStore};
use crate::error::StoreError;
use crate::task::{Task, TaskFilter, TaskId, TaskStatus, WorkerId};

fn poisoned(what: &str) -> StoreError {
    StoreError::Transient(format!("{} lock poisoned", what))
}

// ============================================================================
// Ratings
// ============================================================================

#[derive(Debug)]
struct ContextState {
    context: EvaluationContext,
    records: Vec<RatingRecord>,
    latest: FxHashMap<ItemId, Rating>,
    /// Resolved battles in resolution order
    resolved: Vec<Battle>,
    pending: FxHashMap<BattleId, Battle>,
    abandoned: Vec<(Battle, String)>,
}

impl ContextState {
    fn new(id: ContextId) -> Self {
        Self {
            context: EvaluationContext::new(id),
            records: Vec::new(),
            latest: FxHashMap::default(),
            resolved: Vec::new(),
            pending: FxHashMap::default(),
            abandoned: Vec::new(),
        }
    }

    fn check_append(&self, record: &RatingRecord) -> StoreResult<()> {
        let item = &record.rating.item_id;
        match self.latest.get(item) {
            None => Err(StoreError::NotFound(format!("item {} in context {}", item, self.context.id))),
            Some(current) if record.recorded_at() < current.updated_at => Err(StoreError::Invalid(format!(
                "record for {} at {} predates the current rating at {}",
                item,
                record.recorded_at(),
                current.updated_at
            ))),
            Some(_) => Ok(()),
        }
    }

    fn push_record(&mut self, record: RatingRecord) {
        self.latest.insert(record.rating.item_id.clone(), record.rating.clone());
        self.records.push(record);
    }
}

/// Rating store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryRatingStore {
    contexts: RwLock<FxHashMap<ContextId, ContextState>>,
    injected_failures: AtomicU32,
}

impl MemoryRatingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a transient error
    pub fn inject_transient_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Battles given up on, with the reason
    pub fn abandoned_battles(&self, context: &ContextId) -> Vec<(Battle, String)> {
        self.contexts
            .read()
            .ok()
            .and_then(|map| map.get(context).map(|state| state.abandoned.clone()))
            .unwrap_or_default()
    }

    /// Battles recorded but not yet resolved
    pub fn pending_battles(&self, context: &ContextId) -> Vec<Battle> {
        self.contexts
            .read()
            .ok()
            .and_then(|map| map.get(context).map(|state| state.pending.values().cloned().collect()))
            .unwrap_or_default()
    }

    fn check_fault(&self) -> StoreResult<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Transient("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, FxHashMap<ContextId, ContextState>>> {
        self.check_fault()?;
        self.contexts.read().map_err(|_| poisoned("rating store"))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, FxHashMap<ContextId, ContextState>>> {
        self.check_fault()?;
        self.contexts.write().map_err(|_| poisoned("rating store"))
    }
}

#[async_trait]
impl RatingStore for MemoryRatingStore {
    async fn seed(&self, rating: Rating) -> StoreResult<bool> {
        let mut contexts = self.write()?;
        let state = contexts
            .entry(rating.context_id.clone())
            .or_insert_with(|| ContextState::new(rating.context_id.clone()));

        if state.latest.contains_key(&rating.item_id) {
            return Ok(false);
        }
        state.context.items.push(rating.item_id.clone());
        state.push_record(RatingRecord::seed(rating));
        Ok(true)
    }

    async fn latest(&self, context: &ContextId, item: &ItemId) -> StoreResult<Option<Rating>> {
        let contexts = self.read()?;
        Ok(contexts.get(context).and_then(|s| s.latest.get(item).cloned()))
    }

    async fn batch_latest(&self, context: &ContextId, items: &[ItemId]) -> StoreResult<FxHashMap<ItemId, Rating>> {
        let contexts = self.read()?;
        let Some(state) = contexts.get(context) else {
            return Ok(FxHashMap::default());
        };
        Ok(items
            .iter()
            .filter_map(|item| state.latest.get(item).map(|r| (item.clone(), r.clone())))
            .collect())
    }

    async fn current_ratings(&self, context: &ContextId) -> StoreResult<Vec<Rating>> {
        let contexts = self.read()?;
        let Some(state) = contexts.get(context) else {
            return Ok(Vec::new());
        };
        Ok(state
            .context
            .items
            .iter()
            .filter_map(|item| state.latest.get(item).cloned())
            .collect())
    }

    async fn history(&self, context: &ContextId, item: &ItemId, limit: usize) -> StoreResult<Vec<RatingRecord>> {
        let contexts = self.read()?;
        let Some(state) = contexts.get(context) else {
            return Ok(Vec::new());
        };
        let mine: Vec<&RatingRecord> = state.records.iter().filter(|r| &r.rating.item_id == item).collect();
        let skip = mine.len().saturating_sub(limit);
        Ok(mine.into_iter().skip(skip).cloned().collect())
    }

    async fn context_history(&self, context: &ContextId) -> StoreResult<Vec<RatingRecord>> {
        let contexts = self.read()?;
        Ok(contexts.get(context).map(|s| s.records.clone()).unwrap_or_default())
    }

    async fn append(&self, record: RatingRecord) -> StoreResult<()> {
        let mut contexts = self.write()?;
        let context = record.rating.context_id.clone();
        let state = contexts
            .get_mut(&context)
            .ok_or_else(|| StoreError::NotFound(format!("context {}", context)))?;
        state.check_append(&record)?;
        state.push_record(record);
        Ok(())
    }

    async fn record_battle(&self, battle: &Battle) -> StoreResult<()> {
        let mut contexts = self.write()?;
        let state = contexts
            .get_mut(&battle.context_id)
            .ok_or_else(|| StoreError::NotFound(format!("context {}", battle.context_id)))?;
        state.pending.insert(battle.id, battle.clone());
        Ok(())
    }

    async fn resolve_battle(&self, battle: &Battle, record_a: RatingRecord, record_b: RatingRecord) -> StoreResult<()> {
        let mut contexts = self.write()?;
        let state = contexts
            .get_mut(&battle.context_id)
            .ok_or_else(|| StoreError::NotFound(format!("context {}", battle.context_id)))?;

        if !battle.is_resolved() {
            return Err(StoreError::Invalid(format!("battle {} has no outcome", battle.id)));
        }
        if !state.pending.contains_key(&battle.id) {
            return Err(StoreError::NotFound(format!("pending battle {}", battle.id)));
        }
        for record in [&record_a, &record_b] {
            if record.battle_id != Some(battle.id) {
                return Err(StoreError::Invalid(format!(
                    "record for {} does not belong to battle {}",
                    record.rating.item_id, battle.id
                )));
            }
            state.check_append(record)?;
        }

        state.pending.remove(&battle.id);
        state.push_record(record_a);
        state.push_record(record_b);
        state.resolved.push(battle.clone());
        Ok(())
    }

    async fn abandon_battle(&self, context: &ContextId, battle: BattleId, reason: &str) -> StoreResult<()> {
        let mut contexts = self.write()?;
        let state = contexts
            .get_mut(context)
            .ok_or_else(|| StoreError::NotFound(format!("context {}", context)))?;
        let pending = state
            .pending
            .remove(&battle)
            .ok_or_else(|| StoreError::NotFound(format!("pending battle {}", battle)))?;
        state.abandoned.push((pending, reason.to_string()));
        Ok(())
    }

    async fn recent_battles(&self, context: &ContextId, limit: usize) -> StoreResult<Vec<Battle>> {
        let contexts = self.read()?;
        let Some(state) = contexts.get(context) else {
            return Ok(Vec::new());
        };
        let skip = state.resolved.len().saturating_sub(limit);
        Ok(state.resolved[skip..].to_vec())
    }

    async fn battle_count(&self, context: &ContextId) -> StoreResult<usize> {
        let contexts = self.read()?;
        Ok(contexts.get(context).map_or(0, |s| s.resolved.len()))
    }

    async fn aggregates(&self, context: &ContextId, since: Option<DateTime<Utc>>) -> StoreResult<ContextAggregates> {
        let contexts = self.read()?;
        let Some(state) = contexts.get(context) else {
            return Ok(ContextAggregates::default());
        };

        let ratings: Vec<&Rating> = state.latest.values().collect();
        if ratings.is_empty() {
            return Ok(ContextAggregates::default());
        }
        let battles_since = state
            .resolved
            .iter()
            .filter(|b| since.map_or(true, |t| b.sort_time() >= t))
            .count();

        Ok(ContextAggregates {
            item_count: ratings.len(),
            average_sigma: ratings.iter().map(|r| r.sigma).sum::<f64>() / ratings.len() as f64,
            min_battle_count: ratings.iter().map(|r| r.battle_count).min().unwrap_or(0),
            max_battle_count: ratings.iter().map(|r| r.battle_count).max().unwrap_or(0),
            battles_since,
        })
    }

    async fn context(&self, context: &ContextId) -> StoreResult<Option<EvaluationContext>> {
        let contexts = self.read()?;
        Ok(contexts.get(context).map(|s| s.context.clone()))
    }

    async fn set_completion(&self, context: &ContextId, completion: Option<Completion>) -> StoreResult<()> {
        let mut contexts = self.write()?;
        let state = contexts
            .entry(context.clone())
            .or_insert_with(|| ContextState::new(context.clone()));
        match completion {
            Some(done) => {
                state.context.completed = true;
                state.context.completed_at = Some(done.at);
                state.context.completion_reason = Some(done.reason);
            }
            None => {
                state.context.completed = false;
                state.context.completed_at = None;
                state.context.completion_reason = None;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Queue operations shared by the memory and JSON-file task stores
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct TaskQueue {
    tasks: Vec<Task>,
}

impl TaskQueue {
    pub(crate) fn insert(&mut self, task: Task) -> StoreResult<()> {
        if let Some(existing) = self.tasks.iter().find(|t| t.id == task.id) {
            return Err(StoreError::Conflict {
                task: task.id,
                expected: task.version,
                found: existing.version,
            });
        }
        self.tasks.push(task);
        Ok(())
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.iter().find(|t| t.id == id).cloned()
    }

    pub(crate) fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut found: Vec<Task> = self.tasks.iter().filter(|t| filter.matches(t)).cloned().collect();
        found.sort_by_key(|t| t.created_at);
        found
    }

    pub(crate) fn claim_next(&mut self, owner: &WorkerId, now: DateTime<Utc>) -> StoreResult<Option<Task>> {
        let oldest = self
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by_key(|t| t.created_at);
        let Some(task) = oldest else {
            return Ok(None);
        };

        task.claim(owner, now)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        task.version += 1;
        Ok(Some(task.clone()))
    }

    pub(crate) fn save(&mut self, task: &Task) -> StoreResult<Task> {
        let stored = self
            .tasks
            .iter_mut()
            .find(|t| t.id == task.id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task.id)))?;

        if stored.version != task.version {
            return Err(StoreError::Conflict {
                task: task.id,
                expected: task.version,
                found: stored.version,
            });
        }

        *stored = task.clone();
        stored.version += 1;
        Ok(stored.clone())
    }

    pub(crate) fn purge_finished(&mut self, before: DateTime<Utc>) -> usize {
        let start = self.tasks.len();
        self.tasks
            .retain(|t| !(t.status.is_terminal() && t.finished_at.map_or(false, |at| at < before)));
        start - self.tasks.len()
    }
}

/// Task store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    queue: Mutex<TaskQueue>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> StoreResult<MutexGuard<'_, TaskQueue>> {
        self.queue.lock().map_err(|_| poisoned("task queue"))
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: Task) -> StoreResult<()> {
        self.queue()?.insert(task)
    }

    async fn get(&self, id: TaskId) -> StoreResult<Option<Task>> {
        Ok(self.queue()?.get(id))
    }

    async fn list(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        Ok(self.queue()?.list(filter))
    }

    async fn claim_next(&self, owner: &WorkerId, now: DateTime<Utc>) -> StoreResult<Option<Task>> {
        self.queue()?.claim_next(owner, now)
    }

    async fn save(&self, task: &Task) -> StoreResult<Task> {
        self.queue()?.save(task)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        Ok(self.queue()?.purge_finished(before))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_core::{Outcome, RatingEngine};
    use chrono::Duration;

    use crate::task::TaskKind;

    fn ctx() -> ContextId {
        ContextId::from("ctx")
    }

    async fn seeded(store: &MemoryRatingStore, items: &[&str]) {
        let engine = RatingEngine::default();
        for item in items {
            let rating = engine.create_initial_rating((*item).into(), ctx(), Utc::now());
            store.seed(rating).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_seed_is_create_if_absent() {
        let store = MemoryRatingStore::new();
        seeded(&store, &["a", "b"]).await;
        let again = RatingEngine::default().create_initial_rating("a".into(), ctx(), Utc::now());
        assert!(!store.seed(again).await.unwrap());
        assert_eq!(store.current_ratings(&ctx()).await.unwrap().len(), 2);
        assert_eq!(store.context_history(&ctx()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_battle_writes_everything_at_once() {
        let store = MemoryRatingStore::new();
        seeded(&store, &["a", "b"]).await;
        let engine = RatingEngine::default();
        let now = Utc::now() + Duration::seconds(1);

        let mut battle = Battle::pending(ctx(), "a".into(), "b".into(), now);
        store.record_battle(&battle).await.unwrap();
        assert_eq!(store.pending_battles(&ctx()).len(), 1);

        let ratings = store.batch_latest(&ctx(), &["a".into(), "b".into()]).await.unwrap();
        battle.outcome = Outcome::AWin;
        battle.completed_at = Some(now);
        let (a, b) = engine.resolve(&battle, Outcome::AWin, &ratings, now).unwrap();
        store
            .resolve_battle(
                &battle,
                RatingRecord::from_battle(a, battle.id),
                RatingRecord::from_battle(b, battle.id),
            )
            .await
            .unwrap();

        assert!(store.pending_battles(&ctx()).is_empty());
        assert_eq!(store.battle_count(&ctx()).await.unwrap(), 1);
        assert_eq!(store.history(&ctx(), &"a".into(), 10).await.unwrap().len(), 2);
        let latest = store.latest(&ctx(), &"a".into()).await.unwrap().unwrap();
        assert_eq!(latest.battle_count, 1);

        let aggregates = store.aggregates(&ctx(), None).await.unwrap();
        assert_eq!(aggregates.item_count, 2);
        assert_eq!(aggregates.min_battle_count, 1);
        assert_eq!(aggregates.battles_since, 1);
    }

    #[tokio::test]
    async fn test_history_must_move_forward() {
        let store = MemoryRatingStore::new();
        seeded(&store, &["a"]).await;
        let current = store.latest(&ctx(), &"a".into()).await.unwrap().unwrap();
        let mut stale = current.clone();
        stale.updated_at = current.updated_at - Duration::hours(1);
        let err = store.append(RatingRecord::seed(stale)).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_abandon_removes_pending() {
        let store = MemoryRatingStore::new();
        seeded(&store, &["a", "b"]).await;
        let battle = Battle::pending(ctx(), "a".into(), "b".into(), Utc::now());
        store.record_battle(&battle).await.unwrap();
        store.abandon_battle(&ctx(), battle.id, "judge timed out").await.unwrap();
        assert!(store.pending_battles(&ctx()).is_empty());
        assert_eq!(store.abandoned_battles(&ctx())[0].1, "judge timed out");
        assert_eq!(store.battle_count(&ctx()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryRatingStore::new();
        store.inject_transient_failures(2);
        assert!(store.battle_count(&ctx()).await.unwrap_err().is_transient());
        assert!(store.battle_count(&ctx()).await.is_err());
        assert_eq!(store.battle_count(&ctx()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_completion_flag_round_trip() {
        let store = MemoryRatingStore::new();
        let done = Completion {
            at: Utc::now(),
            reason: "converged".to_string(),
        };
        store.set_completion(&ctx(), Some(done)).await.unwrap();
        assert!(store.context(&ctx()).await.unwrap().unwrap().completed);
        store.set_completion(&ctx(), None).await.unwrap();
        assert!(!store.context(&ctx()).await.unwrap().unwrap().completed);
    }

    fn task(at: DateTime<Utc>) -> Task {
        Task::new(ctx(), TaskKind::RunBattleLoop { max_battles: 3 }, 2, 60, at)
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_pending() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let newer = task(now);
        let older = task(now - Duration::minutes(5));
        store.insert(newer).await.unwrap();
        store.insert(older.clone()).await.unwrap();

        let worker = WorkerId::generate();
        let claimed = store.claim_next(&worker, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, older.id);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.version, 1);
    }

    #[tokio::test]
    async fn test_save_detects_stale_version() {
        let store = MemoryTaskStore::new();
        let t = task(Utc::now());
        store.insert(t.clone()).await.unwrap();

        let saved = store.save(&t).await.unwrap();
        assert_eq!(saved.version, 1);
        let err = store.save(&t).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, found: 1, .. }));
    }

    #[tokio::test]
    async fn test_purge_only_old_terminal_tasks() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let mut done = task(now);
        done.status = TaskStatus::Cancelled;
        done.finished_at = Some(now - Duration::days(2));
        store.insert(done).await.unwrap();
        store.insert(task(now)).await.unwrap();

        assert_eq!(store.purge_finished(now - Duration::days(1)).await.unwrap(), 1);
        assert_eq!(store.list(&TaskFilter::default()).await.unwrap().len(), 1);
    }
}

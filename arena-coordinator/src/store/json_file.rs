//! Task store persisted to a single JSON file
//!
//! The whole queue is rewritten after every mutation: serialized to a
//! sibling temp file, then renamed over the target so a crash never leaves a
//! half-written queue behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::memory::TaskQueue;
use super::{StoreResult, TaskStore};
use crate::error::StoreError;
use crate::task::{Task, TaskFilter, TaskId, WorkerId};

#[derive(Debug)]
pub struct JsonFileTaskStore {
    path: PathBuf,
    queue: Mutex<TaskQueue>,
}

impl JsonFileTaskStore {
    /// Open the queue at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let queue = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                TaskQueue::default()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            TaskQueue::default()
        };

        tracing::debug!("Opened task queue at {}", path.display());
        Ok(Self {
            path,
            queue: Mutex::new(queue),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn queue(&self) -> StoreResult<MutexGuard<'_, TaskQueue>> {
        self.queue
            .lock()
            .map_err(|_| StoreError::Transient("task queue lock poisoned".to_string()))
    }

    /// Apply `op` to a copy of the queue and keep it only if it was persisted.
    fn mutate<T>(&self, op: impl FnOnce(&mut TaskQueue) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard = self.queue()?;
        let mut next = guard.clone();
        let result = op(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(result)
    }

    fn persist(&self, queue: &TaskQueue) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(queue)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn insert(&self, task: Task) -> StoreResult<()> {
        self.mutate(|q| q.insert(task))
    }

    async fn get(&self, id: TaskId) -> StoreResult<Option<Task>> {
        Ok(self.queue()?.get(id))
    }

    async fn list(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        Ok(self.queue()?.list(filter))
    }

    async fn claim_next(&self, owner: &WorkerId, now: DateTime<Utc>) -> StoreResult<Option<Task>> {
        self.mutate(|q| q.claim_next(owner, now))
    }

    async fn save(&self, task: &Task) -> StoreResult<Task> {
        self.mutate(|q| q.save(task))
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        self.mutate(|q| Ok(q.purge_finished(before)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskKind, TaskStatus};

    fn task() -> Task {
        Task::new(
            "ctx".into(),
            TaskKind::AddItems {
                items: vec!["a".into()],
                start_loop: true,
            },
            3,
            60,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileTaskStore::open(dir.path().join("queue.json")).unwrap();
        assert!(store.list(&TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let worker = WorkerId::generate();

        let t = task();
        {
            let store = JsonFileTaskStore::open(&path).unwrap();
            store.insert(t.clone()).await.unwrap();
            store.claim_next(&worker, Utc::now()).await.unwrap().unwrap();
        }

        let reopened = JsonFileTaskStore::open(&path).unwrap();
        let loaded = reopened.get(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Processing);
        assert_eq!(loaded.owner, Some(worker));
        assert_eq!(loaded.kind, t.kind);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_queue_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileTaskStore::open(dir.path().join("queue.json")).unwrap();
        let t = task();
        store.insert(t.clone()).await.unwrap();

        // Duplicate insert is rejected before anything is written.
        assert!(store.insert(t).await.is_err());
        assert_eq!(store.list(&TaskFilter::default()).await.unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_a_serde_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(JsonFileTaskStore::open(&path), Err(StoreError::Serde(_))));
    }
}

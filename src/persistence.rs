//! Durable queue snapshots.
//!
//! The engine persists a snapshot of all non-terminal (plus recently
//! terminal) operations and their results after every state transition, and
//! rebuilds in-memory state from the snapshot at startup. The concrete
//! backing store is injected; the crate ships a JSON file store and an
//! in-memory fake for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::operation::{ExecutionResult, Operation};

/// Serializable queue state. All timestamps serialize as ISO-8601 strings
/// via chrono's serde support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub saved_at: DateTime<Utc>,
    pub operations: Vec<Operation>,
    pub results: Vec<ExecutionResult>,
}

impl QueueSnapshot {
    pub fn new(operations: Vec<Operation>, results: Vec<ExecutionResult>) -> Self {
        Self {
            saved_at: Utc::now(),
            operations,
            results,
        }
    }
}

/// Storage collaborator interface.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save_queue_state(&self, snapshot: &QueueSnapshot) -> Result<()>;

    /// `Ok(None)` means no snapshot exists yet; a corrupt snapshot is an
    /// `Err`, which the engine downgrades to an empty queue plus a
    /// load-failure event.
    async fn load_queue_state(&self) -> Result<Option<QueueSnapshot>>;
}

/// JSON snapshot on disk with atomic write-then-rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PersistenceStore for FileStore {
    async fn save_queue_state(&self, snapshot: &QueueSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| SyncError::Persistence(format!("snapshot serialization: {e}")))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| SyncError::Persistence(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SyncError::Persistence(format!("rename {}: {e}", self.path.display())))?;

        debug!(
            path = %self.path.display(),
            operations = snapshot.operations.len(),
            results = snapshot.results.len(),
            "Queue snapshot saved"
        );
        Ok(())
    }

    async fn load_queue_state(&self) -> Result<Option<QueueSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::Persistence(format!(
                    "read {}: {e}",
                    self.path.display()
                )))
            }
        };

        let snapshot: QueueSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Persistence(format!("corrupt snapshot: {e}")))?;
        Ok(Some(snapshot))
    }
}

/// In-memory store for tests, with fault injection.
///
/// Snapshots round-trip through their JSON encoding so serialization bugs
/// show up in unit tests as well as in the file store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<String>>,
    fail_saves: AtomicBool,
    save_count: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail (storage outage simulation).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Replace the stored state with raw bytes (corruption simulation).
    pub fn inject_raw(&self, raw: impl Into<String>) {
        *self.state.lock() = Some(raw.into());
    }

    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn save_queue_state(&self, snapshot: &QueueSnapshot) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(SyncError::Persistence("simulated storage outage".to_string()));
        }
        let json = serde_json::to_string(snapshot)
            .map_err(|e| SyncError::Persistence(format!("snapshot serialization: {e}")))?;
        *self.state.lock() = Some(json);
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_queue_state(&self) -> Result<Option<QueueSnapshot>> {
        let Some(json) = self.state.lock().clone() else {
            return Ok(None);
        };
        let snapshot = serde_json::from_str(&json)
            .map_err(|e| SyncError::Persistence(format!("corrupt snapshot: {e}")))?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Operation, OperationSpec, OperationStatus};

    fn sample_snapshot() -> QueueSnapshot {
        let op = Operation::from_spec(OperationSpec::new("payment", "card"), 3);
        let result = ExecutionResult::success(op.id, 42);
        QueueSnapshot::new(vec![op], vec![result])
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let snapshot = sample_snapshot();
        store.save_queue_state(&snapshot).await.unwrap();

        let loaded = store.load_queue_state().await.unwrap().unwrap();
        assert_eq!(loaded.operations.len(), 1);
        assert_eq!(loaded.operations[0].id, snapshot.operations[0].id);
        assert_eq!(loaded.operations[0].status, OperationStatus::Pending);
        assert_eq!(loaded.operations[0].created_at, snapshot.operations[0].created_at);
        assert_eq!(loaded.results.len(), 1);
        assert!(loaded.results[0].success);
    }

    #[tokio::test]
    async fn test_memory_store_fault_injection() {
        let store = MemoryStore::new();
        store.set_fail_saves(true);
        let err = store.save_queue_state(&sample_snapshot()).await.unwrap_err();
        assert!(matches!(err, SyncError::Persistence(_)));

        store.set_fail_saves(false);
        store.save_queue_state(&sample_snapshot()).await.unwrap();
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_persistence_error() {
        let store = MemoryStore::new();
        store.inject_raw("{not json");
        assert!(matches!(
            store.load_queue_state().await,
            Err(SyncError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("queue.json"));

        assert!(store.load_queue_state().await.unwrap().is_none());

        let snapshot = sample_snapshot();
        store.save_queue_state(&snapshot).await.unwrap();

        let loaded = store.load_queue_state().await.unwrap().unwrap();
        assert_eq!(loaded.operations[0].id, snapshot.operations[0].id);
        assert_eq!(loaded.saved_at, snapshot.saved_at);
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        tokio::fs::write(&path, b"garbage").await.unwrap();

        let store = FileStore::new(path);
        assert!(matches!(
            store.load_queue_state().await,
            Err(SyncError::Persistence(_))
        ));
    }
}

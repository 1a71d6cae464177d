//! ticker-state: checkpoint persistence.
//! Provides an in-memory store, a file-backed store and the coordinator that
//! assembles lane snapshots into checkpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use ticker_core::{Checkpoint, CheckpointId, Result};

pub mod coordinator;
pub mod file;

pub use coordinator::{CheckpointCoordinator, CoordinatorReport};
pub use file::FileCheckpointStore;

/// Durable home of completed checkpoints.
///
/// Only the coordinator writes; readers load the newest entry at startup.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn latest(&self) -> Result<Option<Checkpoint>>;
    /// Ids of the retained checkpoints, oldest first.
    async fn list(&self) -> Result<Vec<CheckpointId>>;
}

#[derive(Default)]
struct Inner {
    checkpoints: BTreeMap<CheckpointId, Checkpoint>,
}

/// Process-local store, useful for tests and development runs.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
    retained: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_retention(3)
    }
}

impl InMemoryStore {
    pub fn with_retention(retained: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            retained: retained.max(1),
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut guard = self.inner.lock();
        guard.checkpoints.insert(checkpoint.id, checkpoint.clone());
        while guard.checkpoints.len() > self.retained {
            guard.checkpoints.pop_first();
        }
        Ok(())
    }
    async fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.inner.lock().checkpoints.values().next_back().cloned())
    }
    async fn list(&self) -> Result<Vec<CheckpointId>> {
        Ok(self.inner.lock().checkpoints.keys().copied().collect())
    }
}

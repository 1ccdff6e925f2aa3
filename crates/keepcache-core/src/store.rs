//! The durable store collaborator backing the cache.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::error::CacheError;
use crate::types::{Keep, KeepStatus};

/// Persistent storage for cached keeps and the scan checkpoint.
///
/// Implementations include [`MemoryKeepStore`] here, and `JsonFileStore` /
/// `SqliteKeepStore` in `keepcache-storage`. Every failure must be reported
/// as [`CacheError::Persistence`], and every successful write must be
/// durable before the call returns.
#[async_trait]
pub trait KeepStore: Send + Sync {
    /// Create the store if needed. A store without a checkpoint gets one at
    /// `default_checkpoint`; existing data is left untouched.
    async fn initialize(&self, default_checkpoint: u64) -> Result<(), CacheError>;

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, CacheError>;

    /// Save (upsert) the checkpoint.
    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), CacheError>;

    /// All keeps, in insertion order.
    async fn keeps(&self) -> Result<Vec<Keep>, CacheError>;

    async fn find_keep(&self, address: &str) -> Result<Option<Keep>, CacheError>;

    /// Insert `keep` unless a keep with the same address already exists.
    ///
    /// Returns `false` (and writes nothing) for a duplicate address.
    async fn insert_keep(&self, keep: Keep) -> Result<bool, CacheError>;

    /// Overwrite the status of an existing keep.
    async fn update_status(&self, address: &str, status: KeepStatus) -> Result<(), CacheError>;
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    checkpoint: Option<Checkpoint>,
    keeps: Vec<Keep>,
    fail_writes: bool,
}

/// In-memory keep store for tests and ephemeral caches.
///
/// All data is lost when the store is dropped.
#[derive(Default)]
pub struct MemoryKeepStore {
    state: Mutex<MemoryState>,
}

impl MemoryKeepStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`CacheError::Persistence`].
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writable(state: &MemoryState) -> Result<(), CacheError> {
        if state.fail_writes {
            return Err(CacheError::Persistence("memory store is read-only".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeepStore for MemoryKeepStore {
    async fn initialize(&self, default_checkpoint: u64) -> Result<(), CacheError> {
        let mut state = self.state();
        if state.checkpoint.is_none() {
            Self::writable(&state)?;
            state.checkpoint = Some(Checkpoint::new(default_checkpoint));
        }
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, CacheError> {
        Ok(self.state().checkpoint.clone())
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), CacheError> {
        let mut state = self.state();
        Self::writable(&state)?;
        state.checkpoint = Some(checkpoint);
        Ok(())
    }

    async fn keeps(&self) -> Result<Vec<Keep>, CacheError> {
        Ok(self.state().keeps.clone())
    }

    async fn find_keep(&self, address: &str) -> Result<Option<Keep>, CacheError> {
        Ok(self.state().keeps.iter().find(|k| k.address == address).cloned())
    }

    async fn insert_keep(&self, keep: Keep) -> Result<bool, CacheError> {
        let mut state = self.state();
        Self::writable(&state)?;
        if state.keeps.iter().any(|k| k.address == keep.address) {
            return Ok(false);
        }
        state.keeps.push(keep);
        Ok(true)
    }

    async fn update_status(&self, address: &str, status: KeepStatus) -> Result<(), CacheError> {
        let mut state = self.state();
        Self::writable(&state)?;
        match state.keeps.iter_mut().find(|k| k.address == address) {
            Some(keep) => {
                keep.status = status;
                Ok(())
            }
            None => Err(CacheError::Persistence(format!("keep {address} is not cached"))),
        }
    }
}

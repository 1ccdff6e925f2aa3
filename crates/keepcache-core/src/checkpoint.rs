//! Checkpoint manager: the highest block already scanned for keep creations.
//!
//! Each refresh re-scans from `checkpoint - reorg_depth`, so the checkpoint
//! only needs to move forward; it never rewinds.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::store::KeepStore;

/// A persisted scan checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest block fully scanned for `BondedECDSAKeepCreated` events.
    pub block_number: u64,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(block_number: u64) -> Self {
        Self {
            block_number,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Reads and advances the checkpoint kept in a [`KeepStore`].
pub struct CheckpointManager {
    store: Arc<dyn KeepStore>,
    /// Used until the store holds a checkpoint (the factory deployment block).
    default_block: u64,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn KeepStore>, default_block: u64) -> Self {
        Self {
            store,
            default_block,
        }
    }

    /// The stored checkpoint, or the default if none was saved yet.
    pub async fn read(&self) -> Result<u64, CacheError> {
        Ok(self
            .store
            .load_checkpoint()
            .await?
            .map(|cp| cp.block_number)
            .unwrap_or(self.default_block))
    }

    /// Move the checkpoint to `block_number` and return the effective value.
    ///
    /// A height at or below the current checkpoint is not written. The write
    /// is a single upsert, so a failed save leaves the old value in place.
    pub async fn advance(&self, block_number: u64) -> Result<u64, CacheError> {
        let current = self.read().await?;
        if block_number <= current {
            tracing::debug!(current, requested = block_number, "checkpoint not advanced");
            return Ok(current);
        }
        self.store.save_checkpoint(Checkpoint::new(block_number)).await?;
        tracing::debug!(from = current, to = block_number, "checkpoint advanced");
        Ok(block_number)
    }
}

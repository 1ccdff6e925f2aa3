//! JSON document store: the whole cache in a single file.
//!
//! Layout:
//! ```json
//! { "keeps": [ { "address": "0x…", "members": [...], "creationBlock": 1,
//!                "creationTimestamp": 2, "status": { "name": "active", "timestamp": 2 } } ],
//!   "lastRefreshBlock": 10834116,
//!   "lastRefreshAt": 1600000000 }
//! ```
//!
//! Every mutation rewrites the file through a temporary sibling that is
//! synced and then renamed over the previous file, so a crash leaves either the
//! old or the new document on disk, never a torn one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use keepcache_core::checkpoint::Checkpoint;
use keepcache_core::error::CacheError;
use keepcache_core::store::KeepStore;
use keepcache_core::types::{Keep, KeepStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheDocument {
    #[serde(default)]
    keeps: Vec<Keep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_refresh_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_refresh_at: Option<i64>,
}

impl CacheDocument {
    fn checkpoint(&self) -> Option<Checkpoint> {
        self.last_refresh_block.map(|block_number| Checkpoint {
            block_number,
            updated_at: self.last_refresh_at.unwrap_or_default(),
        })
    }
}

fn storage_error(path: &Path, e: impl std::fmt::Display) -> CacheError {
    CacheError::Persistence(format!("{}: {e}", path.display()))
}

/// Single-file JSON keep store.
pub struct JsonFileStore {
    path: PathBuf,
    doc: Mutex<CacheDocument>,
}

impl JsonFileStore {
    /// Open the document at `path`. A missing file is treated as an empty
    /// cache; it is created on [`KeepStore::initialize`].
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| storage_error(&path, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheDocument::default(),
            Err(e) => return Err(storage_error(&path, e)),
        };
        debug!(path = %path.display(), "opened cache document");
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, doc: &CacheDocument) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error(parent, e))?;
        }

        let bytes = serde_json::to_vec_pretty(doc).map_err(|e| storage_error(&self.path, e))?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| storage_error(&tmp, e))?;
        file.write_all(&bytes).await.map_err(|e| storage_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| storage_error(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| storage_error(&self.path, e))?;
        Ok(())
    }

    /// Apply `change` to a copy of the document under the lock. If it
    /// reports a change, write the copy and only then make it the current
    /// state. Returns whatever `change` reported.
    async fn mutate(
        &self,
        change: impl FnOnce(&mut CacheDocument) -> Result<bool, CacheError>,
    ) -> Result<bool, CacheError> {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        if !change(&mut next)? {
            return Ok(false);
        }
        self.persist(&next).await?;
        *doc = next;
        Ok(true)
    }
}

#[async_trait]
impl KeepStore for JsonFileStore {
    async fn initialize(&self, default_checkpoint: u64) -> Result<(), CacheError> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| storage_error(&self.path, e))?;
        if exists && self.doc.lock().await.last_refresh_block.is_some() {
            return Ok(());
        }
        self.mutate(|doc| {
            if doc.last_refresh_block.is_none() {
                doc.last_refresh_block = Some(default_checkpoint);
                doc.last_refresh_at = Some(chrono::Utc::now().timestamp());
            }
            Ok(true)
        })
        .await?;
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, CacheError> {
        Ok(self.doc.lock().await.checkpoint())
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), CacheError> {
        self.mutate(|doc| {
            doc.last_refresh_block = Some(checkpoint.block_number);
            doc.last_refresh_at = Some(checkpoint.updated_at);
            Ok(true)
        })
        .await?;
        debug!(block = checkpoint.block_number, "checkpoint written");
        Ok(())
    }

    async fn keeps(&self) -> Result<Vec<Keep>, CacheError> {
        Ok(self.doc.lock().await.keeps.clone())
    }

    async fn find_keep(&self, address: &str) -> Result<Option<Keep>, CacheError> {
        Ok(self
            .doc
            .lock()
            .await
            .keeps
            .iter()
            .find(|k| k.address == address)
            .cloned())
    }

    async fn insert_keep(&self, keep: Keep) -> Result<bool, CacheError> {
        let address = keep.address.clone();
        let inserted = self
            .mutate(move |doc| {
                if doc.keeps.iter().any(|k| k.address == keep.address) {
                    return Ok(false);
                }
                doc.keeps.push(keep);
                Ok(true)
            })
            .await?;
        if inserted {
            debug!(keep = %address, "keep written");
        }
        Ok(inserted)
    }

    async fn update_status(&self, address: &str, status: KeepStatus) -> Result<(), CacheError> {
        self.mutate(|doc| match doc.keeps.iter_mut().find(|k| k.address == address) {
            Some(keep) => {
                keep.status = status;
                Ok(true)
            }
            None => Err(CacheError::Persistence(format!("keep {address} is not cached"))),
        })
        .await?;
        Ok(())
    }
}

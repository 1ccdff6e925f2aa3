//! SQLite storage backend for the keep cache.
//!
//! Keeps and the scan checkpoint live in a single SQLite file, accessed
//! through `sqlx` with WAL mode enabled.
//!
//! # Usage
//! ```rust,no_run
//! use keepcache_storage::sqlite::SqliteKeepStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteKeepStore::open("./keeps.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteKeepStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use keepcache_core::checkpoint::Checkpoint;
use keepcache_core::error::CacheError;
use keepcache_core::store::KeepStore;
use keepcache_core::types::{Keep, KeepStatus};

fn storage_error(e: impl std::fmt::Display) -> CacheError {
    CacheError::Persistence(e.to_string())
}

/// SQLite-backed keep store.
pub struct SqliteKeepStore {
    pool: SqlitePool,
}

impl SqliteKeepStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./keeps.db"`) or a full
    /// SQLite URL (`"sqlite:./keeps.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, CacheError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_error)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection would get its own empty database, so the
    /// pool is held to one connection.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_error)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), CacheError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        // `seq` preserves discovery order.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS keeps (
                seq                INTEGER PRIMARY KEY AUTOINCREMENT,
                address            TEXT    NOT NULL UNIQUE,
                members_json       TEXT    NOT NULL,
                creation_block     INTEGER NOT NULL,
                creation_timestamp INTEGER NOT NULL,
                status_json        TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        // Single-row table.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoint (
                id           INTEGER PRIMARY KEY CHECK (id = 0),
                block_number INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    fn keep_from_row(row: &SqliteRow) -> Result<Keep, CacheError> {
        let members: Vec<String> =
            serde_json::from_str(row.get::<&str, _>("members_json")).map_err(storage_error)?;
        let status: KeepStatus =
            serde_json::from_str(row.get::<&str, _>("status_json")).map_err(storage_error)?;

        Ok(Keep {
            address: row.get("address"),
            members,
            creation_block: row.get::<i64, _>("creation_block") as u64,
            creation_timestamp: row.get("creation_timestamp"),
            status,
        })
    }

    /// Number of cached keeps.
    pub async fn keep_count(&self) -> Result<u64, CacheError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM keeps")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

// ─── KeepStore impl ──────────────────────────────────────────────────────────

#[async_trait]
impl KeepStore for SqliteKeepStore {
    async fn initialize(&self, default_checkpoint: u64) -> Result<(), CacheError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO checkpoint (id, block_number, updated_at) VALUES (0, ?, ?)",
        )
        .bind(default_checkpoint as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() > 0 {
            debug!(block = default_checkpoint, "default checkpoint written");
        }
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, CacheError> {
        let row = sqlx::query("SELECT block_number, updated_at FROM checkpoint WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(row.map(|r| Checkpoint {
            block_number: r.get::<i64, _>("block_number") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoint (id, block_number, updated_at) VALUES (0, ?, ?)",
        )
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        debug!(block = checkpoint.block_number, "checkpoint saved");
        Ok(())
    }

    async fn keeps(&self) -> Result<Vec<Keep>, CacheError> {
        let rows = sqlx::query(
            "SELECT address, members_json, creation_block, creation_timestamp, status_json
             FROM keeps ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(Self::keep_from_row).collect()
    }

    async fn find_keep(&self, address: &str) -> Result<Option<Keep>, CacheError> {
        let row = sqlx::query(
            "SELECT address, members_json, creation_block, creation_timestamp, status_json
             FROM keeps WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(Self::keep_from_row).transpose()
    }

    async fn insert_keep(&self, keep: Keep) -> Result<bool, CacheError> {
        let members = serde_json::to_string(&keep.members).map_err(storage_error)?;
        let status = serde_json::to_string(&keep.status).map_err(storage_error)?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO keeps
             (address, members_json, creation_block, creation_timestamp, status_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&keep.address)
        .bind(&members)
        .bind(keep.creation_block as i64)
        .bind(keep.creation_timestamp)
        .bind(&status)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            debug!(keep = %keep.address, block = keep.creation_block, "keep stored");
        }
        Ok(inserted)
    }

    async fn update_status(&self, address: &str, status: KeepStatus) -> Result<(), CacheError> {
        let json = serde_json::to_string(&status).map_err(storage_error)?;

        let result = sqlx::query("UPDATE keeps SET status_json = ? WHERE address = ?")
            .bind(&json)
            .bind(address)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(CacheError::Persistence(format!("keep {address} is not cached")));
        }
        debug!(keep = %address, status = %status.kind(), "keep status stored");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use keepcache_core::types::TerminationCause;

    fn keep(address: &str, block: u64) -> Keep {
        Keep {
            address: address.into(),
            members: vec!["0x1".into(), "0x2".into(), "0x3".into()],
            creation_block: block,
            creation_timestamp: 1_600_000_000 + block as i64,
            status: KeepStatus::Active {
                timestamp: 1_600_000_000 + block as i64,
            },
        }
    }

    #[tokio::test]
    async fn initialize_keeps_existing_checkpoint() {
        let store = SqliteKeepStore::in_memory().await.unwrap();
        assert!(store.load_checkpoint().await.unwrap().is_none());

        store.initialize(100).await.unwrap();
        assert_eq!(store.load_checkpoint().await.unwrap().unwrap().block_number, 100);

        store.save_checkpoint(Checkpoint::new(250)).await.unwrap();
        store.initialize(100).await.unwrap();
        assert_eq!(store.load_checkpoint().await.unwrap().unwrap().block_number, 250);
    }

    #[tokio::test]
    async fn keeps_are_listed_in_insertion_order() {
        let store = SqliteKeepStore::in_memory().await.unwrap();
        store.insert_keep(keep("0xb", 20)).await.unwrap();
        store.insert_keep(keep("0xa", 10)).await.unwrap();

        let keeps = store.keeps().await.unwrap();
        assert_eq!(keeps, vec![keep("0xb", 20), keep("0xa", 10)]);
    }

    #[tokio::test]
    async fn duplicate_address_is_not_inserted() {
        let store = SqliteKeepStore::in_memory().await.unwrap();
        assert!(store.insert_keep(keep("0xa", 10)).await.unwrap());
        assert!(!store.insert_keep(keep("0xa", 11)).await.unwrap());
        assert_eq!(store.keep_count().await.unwrap(), 1);
        assert_eq!(store.find_keep("0xa").await.unwrap().unwrap().creation_block, 10);
    }

    #[tokio::test]
    async fn status_update_roundtrip() {
        let store = SqliteKeepStore::in_memory().await.unwrap();
        store.insert_keep(keep("0xa", 10)).await.unwrap();

        let terminated = KeepStatus::Terminated {
            timestamp: 1_600_000_500,
            cause: TerminationCause::SignatureFail,
        };
        store.update_status("0xa", terminated).await.unwrap();
        assert_eq!(store.find_keep("0xa").await.unwrap().unwrap().status, terminated);
    }

    #[tokio::test]
    async fn updating_unknown_keep_fails() {
        let store = SqliteKeepStore::in_memory().await.unwrap();
        let err = store
            .update_status("0xmissing", KeepStatus::Closed { timestamp: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Persistence(_)));
    }
}

//! keepcache-storage: durable backends for the keep cache.
//!
//! | Backend | Feature | Notes |
//! |---------|---------|-------|
//! | [`file::JsonFileStore`] | `json` (default) | one JSON document, atomic rewrite per write |
//! | [`sqlite::SqliteKeepStore`] | `sqlite` | single file, WAL mode |
//!
//! Both implement [`keepcache_core::KeepStore`]; the in-memory store lives in
//! `keepcache-core` itself.

#[cfg(feature = "json")]
pub mod file;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "json")]
pub use file::JsonFileStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteKeepStore;

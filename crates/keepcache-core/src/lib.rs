//! keepcache-core: a reorg-tolerant local cache of keeps and their
//! lifecycle status, built from the keep factory's on-chain events.
//!
//! # Architecture
//!
//! ```text
//! Cache::refresh
//!     ├── CheckpointManager      (last scanned block, non-decreasing)
//!     ├── EventIngester          (creation scan from checkpoint - reorg depth)
//!     ├── EntityFetcher          (bounded-concurrency detail fetch)
//!     ├── ActiveStatusRefresher  (re-resolve keeps cached as Active)
//!     │       └── StatusResolver (Active / Closed / Terminated(cause))
//!     ├── RetryingLedger         (backoff around every ledger call)
//!     └── KeepStore backend      (memory here; JSON file / SQLite in keepcache-storage)
//! ```

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod ingest;
pub mod ledger;
pub mod refresher;
pub mod retry;
pub mod status;
pub mod store;
pub mod types;
pub mod view;

pub use cache::{Cache, RefreshReport};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::{CacheConfig, CacheConfigBuilder};
pub use error::{CacheError, KeepFailure};
pub use ledger::{EventSource, KeepLedger, MemoryLedger};
pub use retry::{RetryConfig, RetryPolicy, RetryingLedger};
pub use status::StatusResolver;
pub use store::{KeepStore, MemoryKeepStore};
pub use types::{BlockHeader, Keep, KeepStatus, KeepStub, LedgerEvent, StatusKind, TerminationCause};

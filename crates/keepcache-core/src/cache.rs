//! The cache orchestrator.
//!
//! # Refresh cycle
//! Each stage completes before the next one starts:
//! 1. read the checkpoint
//! 2. scan for keep creations from `checkpoint - reorg_depth`, dedupe
//! 3. fetch and persist the new keeps (bounded concurrency)
//! 4. advance the checkpoint to the highest scanned block
//! 5. refresh the status of every keep cached as `Active`
//!
//! A store failure or a failed creation scan aborts the cycle before the
//! checkpoint moves. Per-keep ledger failures do not: they are collected
//! into [`CacheError::PartialBatch`] once the cycle has finished. The
//! checkpoint is held at the lowest creation block of a keep that failed to
//! fetch, so the next scan sees that keep again and retries it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointManager;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::fetcher::{EntityFetcher, FetchOutcome};
use crate::ingest::EventIngester;
use crate::ledger::KeepLedger;
use crate::refresher::ActiveStatusRefresher;
use crate::retry::{RetryPolicy, RetryingLedger};
use crate::store::KeepStore;
use crate::types::{Keep, StatusKind};
use crate::view::{KeepView, KeepWriter};

/// Summary of a completed refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// First block of the creation scan.
    pub scanned_from: u64,
    /// Creation events returned by the scan (including known keeps).
    pub events_seen: usize,
    /// Keeps not yet cached when the scan ran.
    pub discovered: usize,
    /// Newly discovered keeps persisted during this cycle.
    pub fetched: usize,
    /// Checkpoint after the cycle.
    pub checkpoint: u64,
    /// Active keeps re-evaluated.
    pub active_checked: usize,
    /// Keeps whose status kind changed.
    pub status_changes: usize,
}

/// Local cache of keeps and their lifecycle status.
///
/// A single `Cache` must be the only writer to its store; callers must not
/// run two [`Cache::refresh`] calls against the same store at once.
pub struct Cache {
    config: CacheConfig,
    checkpoint: CheckpointManager,
    ingester: EventIngester,
    fetcher: EntityFetcher,
    refresher: ActiveStatusRefresher,
    writer: KeepWriter,
    last_checkpoint: AtomicU64,
}

impl Cache {
    /// Open the store (creating defaults: no keeps, checkpoint at the
    /// deployment block) and load the cached keeps.
    ///
    /// Every ledger call made by the cache goes through the retry policy
    /// from `config.retry`.
    pub async fn initialize(
        config: CacheConfig,
        store: Arc<dyn KeepStore>,
        ledger: Arc<dyn KeepLedger>,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        store.initialize(config.deployment_block).await?;
        let view = Arc::new(KeepView::from_keeps(store.keeps().await?));

        let ledger: Arc<dyn KeepLedger> = Arc::new(RetryingLedger::new(
            ledger,
            RetryPolicy::new(config.retry.clone()),
        ));

        let checkpoint = CheckpointManager::new(store.clone(), config.deployment_block);
        let current = checkpoint.read().await?;

        tracing::info!(
            keeps = view.len(),
            checkpoint = current,
            reorg_depth = config.reorg_depth,
            concurrency = config.concurrency,
            "keep cache initialized"
        );

        Ok(Self {
            ingester: EventIngester::new(ledger.clone(), config.reorg_depth),
            fetcher: EntityFetcher::new(ledger.clone(), config.concurrency),
            refresher: ActiveStatusRefresher::new(ledger, config.concurrency),
            writer: KeepWriter::new(store, view),
            checkpoint,
            last_checkpoint: AtomicU64::new(current),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Run one refresh cycle.
    pub async fn refresh(&self) -> Result<RefreshReport, CacheError> {
        let view = self.writer.view();
        let previous = self.checkpoint.read().await?;

        let scan = self.ingester.scan(previous, |address| view.contains(address)).await?;
        tracing::info!(cached = view.len(), "number of keeps in the cache");

        let mut report = RefreshReport {
            scanned_from: scan.scanned_from,
            events_seen: scan.events_seen,
            discovered: scan.new_keeps.len(),
            ..Default::default()
        };

        let fetch = if scan.new_keeps.is_empty() {
            tracing::info!("cached keeps list is up to date");
            FetchOutcome::default()
        } else {
            self.fetcher.fetch_all(scan.new_keeps, &self.writer).await?
        };
        report.fetched = fetch.persisted.len();

        let target = match (scan.highest_block, fetch.lowest_failed_block) {
            (Some(highest), Some(failed)) => {
                tracing::info!(highest, failed, "holding checkpoint at failed keep");
                Some(highest.min(failed))
            }
            (highest, _) => highest,
        };
        report.checkpoint = match target {
            Some(target) => self.checkpoint.advance(target).await?,
            None => {
                tracing::info!(checkpoint = previous, "no keep creation events in window");
                previous
            }
        };
        self.last_checkpoint.store(report.checkpoint, Ordering::SeqCst);

        let active = view.list(Some(StatusKind::Active));
        let refreshed = self.refresher.run(active, &self.writer).await?;
        report.active_checked = refreshed.checked;
        report.status_changes = refreshed.changed;

        tracing::info!(
            from = report.scanned_from,
            discovered = report.discovered,
            fetched = report.fetched,
            checkpoint = report.checkpoint,
            status_changes = report.status_changes,
            "refresh cycle complete"
        );

        let mut failures = fetch.failures;
        failures.extend(refreshed.failures);
        if !failures.is_empty() {
            tracing::warn!(failed = failures.len(), "some keeps will be retried next cycle");
            return Err(CacheError::PartialBatch { failures });
        }
        Ok(report)
    }

    /// All cached keeps in discovery order, optionally only those whose
    /// status is of kind `filter`.
    pub fn keeps(&self, filter: Option<StatusKind>) -> Vec<Keep> {
        self.writer.view().list(filter)
    }

    pub fn keep(&self, address: &str) -> Option<Keep> {
        self.writer.view().get(address)
    }

    /// Checkpoint as of the last initialization or refresh.
    pub fn checkpoint(&self) -> u64 {
        self.last_checkpoint.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfigBuilder;
    use crate::ledger::{EventSource, MemoryLedger};
    use crate::retry::RetryConfig;
    use crate::store::MemoryKeepStore;

    fn config(deployment_block: u64) -> CacheConfig {
        CacheConfigBuilder::new()
            .deployment_block(deployment_block)
            .retry(RetryConfig::none())
            .build_config()
    }

    #[tokio::test]
    async fn initialize_uses_deployment_block() {
        let store = Arc::new(MemoryKeepStore::new());
        let cache = Cache::initialize(config(5_000), store.clone(), Arc::new(MemoryLedger::new()))
            .await
            .unwrap();
        assert_eq!(cache.checkpoint(), 5_000);
        assert!(cache.keeps(None).is_empty());
        assert_eq!(store.load_checkpoint().await.unwrap().unwrap().block_number, 5_000);
    }

    #[tokio::test]
    async fn initialize_rejects_invalid_config() {
        let cfg = CacheConfigBuilder::new().concurrency(0).build_config();
        let result = Cache::initialize(
            cfg,
            Arc::new(MemoryKeepStore::new()),
            Arc::new(MemoryLedger::new()),
        )
        .await;
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn refresh_reports_cycle() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_keep("0xa", &["0x1"], 100);
        ledger.create_keep("0xb", &["0x2"], 110);
        ledger.close_keep("0xa", 120);

        let cache = Cache::initialize(config(50), Arc::new(MemoryKeepStore::new()), ledger)
            .await
            .unwrap();
        let report = cache.refresh().await.unwrap();

        assert_eq!(report.scanned_from, 38);
        assert_eq!(report.events_seen, 2);
        assert_eq!(report.discovered, 2);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.checkpoint, 110);
        assert_eq!(report.active_checked, 1);
        assert_eq!(report.status_changes, 0);
        assert_eq!(cache.keeps(Some(StatusKind::Closed)).len(), 1);
    }

    #[tokio::test]
    async fn store_failure_aborts_before_checkpoint_moves() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_keep("0xa", &["0x1"], 100);
        let store = Arc::new(MemoryKeepStore::new());
        let cache = Cache::initialize(config(50), store.clone(), ledger).await.unwrap();

        store.fail_writes(true);
        let err = cache.refresh().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(cache.checkpoint(), 50);
        assert!(cache.keeps(None).is_empty());

        store.fail_writes(false);
        cache.refresh().await.unwrap();
        assert_eq!(cache.checkpoint(), 100);
        assert_eq!(cache.keeps(None).len(), 1);
    }

    #[tokio::test]
    async fn failed_scan_aborts_before_anything_moves() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_keep("0xa", &["0x1"], 100);
        let store = Arc::new(MemoryKeepStore::new());
        let cache = Cache::initialize(config(50), store.clone(), ledger.clone())
            .await
            .unwrap();

        ledger.fail_scans(&EventSource::Factory, 1);
        let err = cache.refresh().await.unwrap_err();
        assert!(matches!(err, CacheError::Rpc(_)));
        assert_eq!(cache.checkpoint(), 50);
        assert_eq!(store.load_checkpoint().await.unwrap().unwrap().block_number, 50);
        assert!(cache.keeps(None).is_empty());

        let report = cache.refresh().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(cache.checkpoint(), 100);
    }

    #[tokio::test]
    async fn reopening_restores_cached_keeps() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_keep("0xa", &["0x1"], 100);
        let store = Arc::new(MemoryKeepStore::new());

        let first = Cache::initialize(config(0), store.clone(), ledger.clone()).await.unwrap();
        first.refresh().await.unwrap();
        drop(first);

        let second = Cache::initialize(config(0), store, ledger).await.unwrap();
        assert_eq!(second.checkpoint(), 100);
        assert!(second.keep("0xa").is_some());
    }
}

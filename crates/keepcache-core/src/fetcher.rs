//! Detail fetch for newly discovered keeps.
//!
//! Up to `concurrency` keeps are fetched at once. Each completed keep is
//! persisted as soon as it arrives, so a crash mid-batch loses nothing
//! already fetched; keeps that fail are simply not persisted and are
//! rediscovered by the next scan.

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::error::{CacheError, KeepFailure};
use crate::ledger::KeepLedger;
use crate::status::StatusResolver;
use crate::types::{Keep, KeepStub};
use crate::view::KeepWriter;

/// Result of a fetch batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Addresses persisted by this batch, in completion order.
    pub persisted: Vec<String>,
    pub failures: Vec<KeepFailure>,
    /// Lowest creation block among the failed keeps. The checkpoint must not
    /// move past it, or the next scan would no longer see those keeps.
    pub lowest_failed_block: Option<u64>,
}

pub struct EntityFetcher {
    ledger: Arc<dyn KeepLedger>,
    resolver: StatusResolver,
    concurrency: usize,
}

impl EntityFetcher {
    pub fn new(ledger: Arc<dyn KeepLedger>, concurrency: usize) -> Self {
        Self {
            resolver: StatusResolver::new(ledger.clone()),
            ledger,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetch every stub and persist each result through `writer`.
    ///
    /// Per-keep ledger failures are collected in the outcome; a store
    /// failure aborts the batch.
    pub async fn fetch_all(
        &self,
        stubs: Vec<KeepStub>,
        writer: &KeepWriter,
    ) -> Result<FetchOutcome, CacheError> {
        let total = stubs.len();
        tracing::info!(count = total, "fetching information about new keeps");

        let mut results = stream::iter(stubs)
            .map(|stub| self.fetch_one(stub))
            .buffer_unordered(self.concurrency);

        let mut outcome = FetchOutcome::default();
        while let Some((address, creation_block, result)) = results.next().await {
            match result {
                Ok(keep) => {
                    if writer.insert(keep).await? {
                        tracing::debug!(keep = %address, "fetched keep");
                    }
                    outcome.persisted.push(address);
                }
                Err(err) => {
                    tracing::warn!(keep = %address, error = %err, "failed to fetch keep");
                    outcome.failures.push(KeepFailure::new(address, &err));
                    outcome.lowest_failed_block = Some(
                        outcome
                            .lowest_failed_block
                            .map_or(creation_block, |lowest| lowest.min(creation_block)),
                    );
                }
            }
        }

        tracing::info!(
            fetched = outcome.persisted.len(),
            failed = outcome.failures.len(),
            total,
            "keep fetch complete"
        );
        Ok(outcome)
    }

    async fn fetch_one(&self, stub: KeepStub) -> (String, u64, Result<Keep, CacheError>) {
        let address = stub.address.clone();
        let creation_block = stub.creation_block;
        (address, creation_block, self.fetch_keep(stub).await)
    }

    async fn fetch_keep(&self, stub: KeepStub) -> Result<Keep, CacheError> {
        let creation_timestamp = self.ledger.opened_timestamp(&stub.address).await?;
        let status = self.resolver.resolve(&stub.address, stub.creation_block).await?;
        Ok(Keep::from_stub(stub, creation_timestamp, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::store::{KeepStore, MemoryKeepStore};
    use crate::types::{KeepStatus, StatusKind};
    use crate::view::KeepView;
    use std::time::Duration;

    fn stub(address: &str, block: u64) -> KeepStub {
        KeepStub {
            address: address.into(),
            members: vec!["0x1".into(), "0x2".into()],
            creation_block: block,
        }
    }

    fn writer(store: Arc<MemoryKeepStore>) -> KeepWriter {
        KeepWriter::new(store, Arc::new(KeepView::new()))
    }

    #[tokio::test]
    async fn fetches_detail_and_initial_status() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_keep("0xa", &["0x1", "0x2"], 100);
        ledger.set_opened_timestamp("0xa", 1_234);
        ledger.close_keep("0xa", 150);

        let store = Arc::new(MemoryKeepStore::new());
        let writer = writer(store.clone());
        let outcome = EntityFetcher::new(ledger, 3)
            .fetch_all(vec![stub("0xa", 100)], &writer)
            .await
            .unwrap();

        assert_eq!(outcome.persisted, vec!["0xa"]);
        let keep = store.find_keep("0xa").await.unwrap().unwrap();
        assert_eq!(keep.creation_timestamp, 1_234);
        assert_eq!(keep.members, vec!["0x1", "0x2"]);
        assert_eq!(
            keep.status,
            KeepStatus::Closed { timestamp: MemoryLedger::default_block_time(150) }
        );
    }

    #[tokio::test]
    async fn failures_do_not_block_siblings() {
        let ledger = Arc::new(MemoryLedger::new());
        for (i, addr) in ["0xa", "0xb", "0xc"].iter().enumerate() {
            ledger.create_keep(addr, &[], 100 + i as u64);
        }
        ledger.fail_next("0xb", 10);

        let store = Arc::new(MemoryKeepStore::new());
        let writer = writer(store.clone());
        let outcome = EntityFetcher::new(ledger, 2)
            .fetch_all(vec![stub("0xa", 100), stub("0xb", 101), stub("0xc", 102)], &writer)
            .await
            .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].address, "0xb");
        assert_eq!(outcome.lowest_failed_block, Some(101));
        assert_eq!(outcome.persisted.len(), 2);
        assert!(store.find_keep("0xb").await.unwrap().is_none());
        assert_eq!(writer.view().list(Some(StatusKind::Active)).len(), 2);
    }

    #[tokio::test]
    async fn lowest_failed_block_spans_all_failures() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_keep("0xa", &[], 100);
        ledger.create_keep("0xb", &[], 150);
        ledger.create_keep("0xc", &[], 200);
        ledger.fail_next("0xb", 10);
        ledger.fail_next("0xc", 10);

        let outcome = EntityFetcher::new(ledger, 3)
            .fetch_all(
                vec![stub("0xc", 200), stub("0xa", 100), stub("0xb", 150)],
                &writer(Arc::new(MemoryKeepStore::new())),
            )
            .await
            .unwrap();
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.lowest_failed_block, Some(150));
        assert_eq!(outcome.persisted, vec!["0xa"]);
    }

    #[tokio::test]
    async fn in_flight_fetches_are_bounded() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_latency(Duration::from_millis(5));
        let stubs: Vec<_> = (0..10)
            .map(|i| {
                let addr = format!("0x{i:02}");
                ledger.create_keep(&addr, &[], 100 + i);
                stub(&addr, 100 + i)
            })
            .collect();

        let store = Arc::new(MemoryKeepStore::new());
        let outcome = EntityFetcher::new(ledger.clone(), 3)
            .fetch_all(stubs, &writer(store))
            .await
            .unwrap();

        assert_eq!(outcome.persisted.len(), 10);
        assert!(ledger.peak_in_flight() <= 3, "peak = {}", ledger.peak_in_flight());
        assert!(ledger.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn store_failure_aborts_the_batch() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_keep("0xa", &[], 100);

        let store = Arc::new(MemoryKeepStore::new());
        store.fail_writes(true);
        let err = EntityFetcher::new(ledger, 3)
            .fetch_all(vec![stub("0xa", 100)], &writer(store))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Persistence(_)));
    }
}

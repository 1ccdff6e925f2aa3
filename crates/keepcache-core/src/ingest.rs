//! Keep discovery: scans the factory for `BondedECDSAKeepCreated` events in
//! a reorg-safe window and emits stubs for keeps not yet cached.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::CacheError;
use crate::events::{decode_keep_created, KEEP_CREATED};
use crate::ledger::{EventSource, KeepLedger};
use crate::types::KeepStub;

/// Result of one ingestion scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// First block of the scanned window.
    pub scanned_from: u64,
    /// Number of creation events returned by the ledger.
    pub events_seen: usize,
    /// Events dropped because their payload could not be decoded.
    pub malformed: usize,
    /// Keeps not yet cached, in ledger order, without duplicates.
    pub new_keeps: Vec<KeepStub>,
    /// Highest block number among the scanned events; `None` for an empty
    /// scan.
    pub highest_block: Option<u64>,
}

pub struct EventIngester {
    ledger: Arc<dyn KeepLedger>,
    reorg_depth: u64,
}

impl EventIngester {
    pub fn new(ledger: Arc<dyn KeepLedger>, reorg_depth: u64) -> Self {
        Self { ledger, reorg_depth }
    }

    /// First block to scan for a given checkpoint.
    pub fn scan_start(&self, checkpoint: u64) -> u64 {
        checkpoint.saturating_sub(self.reorg_depth)
    }

    /// Scan from `checkpoint - reorg_depth` to the chain head.
    ///
    /// `is_cached` reports whether an address is already in the cache;
    /// re-observed keeps are skipped silently.
    pub async fn scan<F>(&self, checkpoint: u64, is_cached: F) -> Result<ScanOutcome, CacheError>
    where
        F: Fn(&str) -> bool,
    {
        let scanned_from = self.scan_start(checkpoint);
        tracing::info!(from = scanned_from, "looking for keeps created since block");

        let mut events = self
            .ledger
            .past_events(&EventSource::Factory, KEEP_CREATED, scanned_from)
            .await?;
        events.sort_by_key(|e| e.position());

        let mut outcome = ScanOutcome {
            scanned_from,
            events_seen: events.len(),
            highest_block: events.iter().map(|e| e.block_number).max(),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        for event in &events {
            let stub = match decode_keep_created(event) {
                Ok(stub) => stub,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping keep creation event");
                    outcome.malformed += 1;
                    continue;
                }
            };
            if is_cached(&stub.address) || !seen.insert(stub.address.clone()) {
                continue;
            }
            outcome.new_keeps.push(stub);
        }

        tracing::info!(
            from = scanned_from,
            events = outcome.events_seen,
            new = outcome.new_keeps.len(),
            "keep creation scan complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::types::LedgerEvent;
    use serde_json::json;

    #[tokio::test]
    async fn scan_window_is_clamped_at_zero() {
        let ledger = Arc::new(MemoryLedger::new());
        let ingester = EventIngester::new(ledger.clone(), 12);
        assert_eq!(ingester.scan_start(5), 0);
        assert_eq!(ingester.scan_start(100), 88);

        ingester.scan(5, |_| false).await.unwrap();
        assert_eq!(ledger.factory_scans(), vec![0]);
    }

    #[tokio::test]
    async fn skips_cached_and_repeated_addresses() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_keep("0xa", &["0x1"], 100);
        ledger.create_keep("0xb", &["0x2"], 101);
        ledger.create_keep("0xb", &["0x2"], 101);
        ledger.create_keep("0xc", &["0x3"], 105);

        let ingester = EventIngester::new(ledger, 12);
        let outcome = ingester.scan(90, |addr| addr == "0xa").await.unwrap();

        let addresses: Vec<_> = outcome.new_keeps.iter().map(|k| k.address.as_str()).collect();
        assert_eq!(addresses, vec!["0xb", "0xc"]);
        assert_eq!(outcome.events_seen, 4);
        assert_eq!(outcome.highest_block, Some(105));
    }

    #[tokio::test]
    async fn empty_scan_has_no_highest_block() {
        let ingester = EventIngester::new(Arc::new(MemoryLedger::new()), 12);
        let outcome = ingester.scan(1_000, |_| false).await.unwrap();
        assert_eq!(outcome.events_seen, 0);
        assert_eq!(outcome.highest_block, None);
        assert!(outcome.new_keeps.is_empty());
    }

    #[tokio::test]
    async fn new_keeps_follow_ledger_position() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_keep("0xa", &[], 100);
        ledger.create_keep("0xb", &[], 100);
        ledger.create_keep("0xc", &[], 101);
        ledger.reverse_event_order(true);

        let outcome = EventIngester::new(ledger, 12).scan(0, |_| false).await.unwrap();
        let addresses: Vec<_> = outcome.new_keeps.iter().map(|k| k.address.as_str()).collect();
        assert_eq!(addresses, vec!["0xa", "0xb", "0xc"]);
    }

    #[tokio::test]
    async fn malformed_events_are_skipped_but_counted() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_keep("0xa", &["0x1"], 100);
        ledger.push_factory_event(LedgerEvent {
            block_number: 110,
            log_index: 0,
            return_values: json!({"members": ["0x9"]}),
        });

        let outcome = EventIngester::new(ledger, 12).scan(0, |_| false).await.unwrap();
        assert_eq!(outcome.new_keeps.len(), 1);
        assert_eq!(outcome.malformed, 1);
        assert_eq!(outcome.highest_block, Some(110));
    }
}

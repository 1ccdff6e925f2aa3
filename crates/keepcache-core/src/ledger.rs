//! The ledger collaborator: event queries, block headers, and read-only
//! keep contract calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::CacheError;
use crate::events::{KEEP_CLOSED, KEEP_CREATED, KEEP_TERMINATED, SIGNATURE_REQUESTED};
use crate::types::{BlockHeader, LedgerEvent};

/// The contract whose events are queried.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// The keep factory (emits `BondedECDSAKeepCreated`).
    Factory,
    /// A single keep contract, by address.
    Keep(String),
}

impl EventSource {
    pub fn keep(address: impl Into<String>) -> Self {
        Self::Keep(address.into())
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Factory => write!(f, "factory"),
            Self::Keep(address) => write!(f, "keep {address}"),
        }
    }
}

/// Read access to the ledger the keeps live on.
///
/// Implementations should return [`CacheError::Rpc`] for transient failures
/// so that [`crate::retry::RetryingLedger`] can re-issue the call.
#[async_trait]
pub trait KeepLedger: Send + Sync {
    /// All `event` logs emitted by `source` from `from_block` (inclusive) to
    /// the current head, in ledger order.
    async fn past_events(
        &self,
        source: &EventSource,
        event: &str,
        from_block: u64,
    ) -> Result<Vec<LedgerEvent>, CacheError>;

    async fn block(&self, number: u64) -> Result<BlockHeader, CacheError>;

    /// Unix timestamp at which the keep was opened.
    async fn opened_timestamp(&self, keep: &str) -> Result<i64, CacheError>;

    /// The keep's group public key, `None` if key generation never completed.
    async fn public_key(&self, keep: &str) -> Result<Option<String>, CacheError>;

    /// Whether the keep still waits for a signature over `digest`.
    async fn is_awaiting_signature(&self, keep: &str, digest: &str) -> Result<bool, CacheError>;
}

#[async_trait]
impl<T: KeepLedger + ?Sized> KeepLedger for Arc<T> {
    async fn past_events(
        &self,
        source: &EventSource,
        event: &str,
        from_block: u64,
    ) -> Result<Vec<LedgerEvent>, CacheError> {
        (**self).past_events(source, event, from_block).await
    }

    async fn block(&self, number: u64) -> Result<BlockHeader, CacheError> {
        (**self).block(number).await
    }

    async fn opened_timestamp(&self, keep: &str) -> Result<i64, CacheError> {
        (**self).opened_timestamp(keep).await
    }

    async fn public_key(&self, keep: &str) -> Result<Option<String>, CacheError> {
        (**self).public_key(keep).await
    }

    async fn is_awaiting_signature(&self, keep: &str, digest: &str) -> Result<bool, CacheError> {
        (**self).is_awaiting_signature(keep, digest).await
    }
}

// ─── In-memory ledger (for tests and simulations) ────────────────────────────

/// Timestamp of block 0 in a [`MemoryLedger`] without explicit block times.
pub const GENESIS_TIMESTAMP: i64 = 1_600_000_000;
/// Seconds between consecutive blocks in a [`MemoryLedger`].
pub const BLOCK_INTERVAL_SECS: i64 = 12;

#[derive(Default)]
struct LedgerState {
    factory_events: Vec<LedgerEvent>,
    keep_events: HashMap<String, Vec<(&'static str, LedgerEvent)>>,
    block_times: HashMap<u64, i64>,
    opened: HashMap<String, i64>,
    public_keys: HashMap<String, String>,
    awaiting: HashSet<(String, String)>,
    /// Next log index per block.
    log_counts: HashMap<u64, u32>,
    /// Remaining transient failures per keep address.
    failures: HashMap<String, u32>,
    /// Remaining transient failures per scanned contract.
    scan_failures: HashMap<EventSource, u32>,
    /// Remaining transient failures per block lookup.
    block_failures: HashMap<u64, u32>,
    factory_scans: Vec<u64>,
    reversed: bool,
    latency: Option<Duration>,
}

/// Scriptable in-memory ledger.
///
/// Events are appended through the `create_keep` / `close_keep` / … helpers
/// and served back by [`KeepLedger::past_events`]. It also counts concurrent
/// calls, which lets callers observe how many requests were in flight.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block time used when none was set explicitly.
    pub fn default_block_time(number: u64) -> i64 {
        GENESIS_TIMESTAMP + number as i64 * BLOCK_INTERVAL_SECS
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn time_of(state: &LedgerState, number: u64) -> i64 {
        state
            .block_times
            .get(&number)
            .copied()
            .unwrap_or_else(|| Self::default_block_time(number))
    }

    fn next_log_index(state: &mut LedgerState, block: u64) -> u32 {
        let next = state.log_counts.entry(block).or_default();
        let index = *next;
        *next += 1;
        index
    }

    /// Take one pending failure from `counters[key]`, if any.
    fn take_failure<K: std::hash::Hash + Eq>(counters: &mut HashMap<K, u32>, key: &K) -> bool {
        match counters.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Emit `BondedECDSAKeepCreated` for a new keep at `block`.
    pub fn create_keep(&self, address: &str, members: &[&str], block: u64) {
        let mut state = self.state();
        let log_index = Self::next_log_index(&mut state, block);
        state.factory_events.push(LedgerEvent {
            block_number: block,
            log_index,
            return_values: json!({ "keepAddress": address, "members": members }),
        });
        let opened = Self::time_of(&state, block);
        state.opened.insert(address.to_string(), opened);
    }

    /// Append a raw factory event (e.g. a malformed payload), keeping its
    /// `log_index` as given.
    pub fn push_factory_event(&self, event: LedgerEvent) {
        self.state().factory_events.push(event);
    }

    pub fn close_keep(&self, address: &str, block: u64) {
        self.push_keep_event(address, KEEP_CLOSED, block, json!({}));
    }

    pub fn terminate_keep(&self, address: &str, block: u64) {
        self.push_keep_event(address, KEEP_TERMINATED, block, json!({}));
    }

    pub fn request_signature(&self, address: &str, digest: &str, block: u64) {
        self.push_keep_event(address, SIGNATURE_REQUESTED, block, json!({ "digest": digest }));
    }

    /// Append a raw `SignatureRequested` payload (e.g. a malformed one).
    pub fn push_signature_request(&self, address: &str, block: u64, values: serde_json::Value) {
        self.push_keep_event(address, SIGNATURE_REQUESTED, block, values);
    }

    fn push_keep_event(&self, address: &str, name: &'static str, block: u64, values: serde_json::Value) {
        let mut state = self.state();
        let log_index = Self::next_log_index(&mut state, block);
        state
            .keep_events
            .entry(address.to_string())
            .or_default()
            .push((
                name,
                LedgerEvent {
                    block_number: block,
                    log_index,
                    return_values: values,
                },
            ));
    }

    pub fn set_public_key(&self, address: &str, key: &str) {
        self.state().public_keys.insert(address.to_string(), key.to_string());
    }

    pub fn set_awaiting_signature(&self, address: &str, digest: &str, awaiting: bool) {
        let key = (address.to_string(), digest.to_string());
        let mut state = self.state();
        if awaiting {
            state.awaiting.insert(key);
        } else {
            state.awaiting.remove(&key);
        }
    }

    pub fn set_block_time(&self, number: u64, timestamp: i64) {
        self.state().block_times.insert(number, timestamp);
    }

    pub fn set_opened_timestamp(&self, address: &str, timestamp: i64) {
        self.state().opened.insert(address.to_string(), timestamp);
    }

    /// Make the next `times` calls concerning `address` fail with a
    /// transient RPC error.
    pub fn fail_next(&self, address: &str, times: u32) {
        self.state().failures.insert(address.to_string(), times);
    }

    /// Make the next `times` event scans of `source` fail with a transient
    /// RPC error.
    pub fn fail_scans(&self, source: &EventSource, times: u32) {
        self.state().scan_failures.insert(source.clone(), times);
    }

    /// Make the next `times` lookups of block `number` fail with a
    /// transient RPC error.
    pub fn fail_block(&self, number: u64, times: u32) {
        self.state().block_failures.insert(number, times);
    }

    /// Serve events in reverse ledger order.
    pub fn reverse_event_order(&self, reversed: bool) {
        self.state().reversed = reversed;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// `from_block` of every factory scan served so far.
    pub fn factory_scans(&self) -> Vec<u64> {
        self.state().factory_scans.clone()
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn check_failure(&self, address: &str) -> Result<(), CacheError> {
        if Self::take_failure(&mut self.state().failures, &address.to_string()) {
            return Err(CacheError::Rpc(format!("connection reset while querying {address}")));
        }
        Ok(())
    }
}

#[async_trait]
impl KeepLedger for MemoryLedger {
    async fn past_events(
        &self,
        source: &EventSource,
        event: &str,
        from_block: u64,
    ) -> Result<Vec<LedgerEvent>, CacheError> {
        let _guard = self.enter().await;
        let mut state = self.state();
        if Self::take_failure(&mut state.scan_failures, source) {
            return Err(CacheError::Rpc(format!("timed out fetching {event} events of {source}")));
        }
        let mut events: Vec<LedgerEvent> = match source {
            EventSource::Factory => {
                state.factory_scans.push(from_block);
                if event != KEEP_CREATED {
                    return Ok(vec![]);
                }
                state
                    .factory_events
                    .iter()
                    .filter(|e| e.block_number >= from_block)
                    .cloned()
                    .collect()
            }
            EventSource::Keep(address) => state
                .keep_events
                .get(address)
                .map(|events| {
                    events
                        .iter()
                        .filter(|(name, e)| *name == event && e.block_number >= from_block)
                        .map(|(_, e)| e.clone())
                        .collect()
                })
                .unwrap_or_default(),
        };
        if state.reversed {
            events.reverse();
        }
        Ok(events)
    }

    async fn block(&self, number: u64) -> Result<BlockHeader, CacheError> {
        let _guard = self.enter().await;
        let mut state = self.state();
        if Self::take_failure(&mut state.block_failures, &number) {
            return Err(CacheError::Rpc(format!("block {number} not available")));
        }
        Ok(BlockHeader {
            number,
            timestamp: Self::time_of(&state, number),
        })
    }

    async fn opened_timestamp(&self, keep: &str) -> Result<i64, CacheError> {
        let _guard = self.enter().await;
        self.check_failure(keep)?;
        self.state()
            .opened
            .get(keep)
            .copied()
            .ok_or_else(|| CacheError::Other(format!("no keep deployed at {keep}")))
    }

    async fn public_key(&self, keep: &str) -> Result<Option<String>, CacheError> {
        let _guard = self.enter().await;
        self.check_failure(keep)?;
        Ok(self.state().public_keys.get(keep).cloned())
    }

    async fn is_awaiting_signature(&self, keep: &str, digest: &str) -> Result<bool, CacheError> {
        let _guard = self.enter().await;
        self.check_failure(keep)?;
        Ok(self
            .state()
            .awaiting
            .contains(&(keep.to_string(), digest.to_string())))
    }
}

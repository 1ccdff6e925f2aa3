//! Status resolution: derives a keep's lifecycle status from its event
//! history on the ledger.
//!
//! Evaluation order (first match wins):
//! 1. any `KeepClosed` event      → `Closed` at the earliest such event
//! 2. any `KeepTerminated` event  → `Terminated` at the earliest such event
//! 3. otherwise                   → `Active` at the creation block
//!
//! Events are ordered by `(block_number, log_index)`, never by the order the
//! ledger returns them in. The status is never read back from the cache, so
//! re-resolving a keep always reproduces the same answer for the same history.

use std::sync::Arc;

use crate::error::CacheError;
use crate::events::{decode_signature_digest, KEEP_CLOSED, KEEP_TERMINATED, SIGNATURE_REQUESTED};
use crate::ledger::{EventSource, KeepLedger};
use crate::types::{KeepStatus, TerminationCause};

pub struct StatusResolver {
    ledger: Arc<dyn KeepLedger>,
}

impl StatusResolver {
    pub fn new(ledger: Arc<dyn KeepLedger>) -> Self {
        Self { ledger }
    }

    /// Resolve the current status of the keep at `address`, created at
    /// `creation_block`.
    pub async fn resolve(&self, address: &str, creation_block: u64) -> Result<KeepStatus, CacheError> {
        let source = EventSource::keep(address);

        if let Some(timestamp) = self.earliest_event_time(&source, KEEP_CLOSED, creation_block).await? {
            return Ok(KeepStatus::Closed { timestamp });
        }

        if let Some(timestamp) = self
            .earliest_event_time(&source, KEEP_TERMINATED, creation_block)
            .await?
        {
            let cause = self.termination_cause(&source, address, creation_block).await?;
            return Ok(KeepStatus::Terminated { timestamp, cause });
        }

        let timestamp = self.ledger.block(creation_block).await?.timestamp;
        Ok(KeepStatus::Active { timestamp })
    }

    /// Block time of the first `event` emitted since `from_block`.
    async fn earliest_event_time(
        &self,
        source: &EventSource,
        event: &str,
        from_block: u64,
    ) -> Result<Option<i64>, CacheError> {
        let events = self.ledger.past_events(source, event, from_block).await?;
        match events.iter().min_by_key(|e| e.position()) {
            Some(first) => Ok(Some(self.ledger.block(first.block_number).await?.timestamp)),
            None => Ok(None),
        }
    }

    async fn termination_cause(
        &self,
        source: &EventSource,
        address: &str,
        creation_block: u64,
    ) -> Result<TerminationCause, CacheError> {
        let public_key = self.ledger.public_key(address).await?;
        if public_key.as_deref().map_or(true, is_empty_key) {
            return Ok(TerminationCause::KeygenFail);
        }

        let mut requests = self
            .ledger
            .past_events(source, SIGNATURE_REQUESTED, creation_block)
            .await?;
        requests.sort_by_key(|e| e.position());

        let latest_digest = requests.iter().rev().find_map(|e| match decode_signature_digest(e) {
            Ok(digest) => Some(digest),
            Err(err) => {
                tracing::warn!(keep = address, error = %err, "skipping signature request");
                None
            }
        });

        if let Some(digest) = latest_digest {
            if self.ledger.is_awaiting_signature(address, &digest).await? {
                return Ok(TerminationCause::SignatureFail);
            }
        }

        Ok(TerminationCause::Other)
    }
}

fn is_empty_key(key: &str) -> bool {
    key.is_empty() || key == "0x"
}

//! Re-evaluates the status of every keep cached as `Active`.

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::error::{CacheError, KeepFailure};
use crate::ledger::KeepLedger;
use crate::status::StatusResolver;
use crate::types::Keep;
use crate::view::KeepWriter;

/// Result of an active-status refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub checked: usize,
    /// Keeps whose status kind changed and was persisted.
    pub changed: usize,
    pub failures: Vec<KeepFailure>,
}

pub struct ActiveStatusRefresher {
    resolver: StatusResolver,
    concurrency: usize,
}

impl ActiveStatusRefresher {
    pub fn new(ledger: Arc<dyn KeepLedger>, concurrency: usize) -> Self {
        Self {
            resolver: StatusResolver::new(ledger),
            concurrency: concurrency.max(1),
        }
    }

    /// Resolve the status of each keep in `active` and persist changes.
    ///
    /// Unchanged kinds are not written. A resolved status that would leave
    /// a terminal state is reported as a failure and never applied.
    pub async fn run(&self, active: Vec<Keep>, writer: &KeepWriter) -> Result<RefreshOutcome, CacheError> {
        tracing::info!(count = active.len(), "refreshing active keeps");

        let mut results = stream::iter(active)
            .map(|keep| async move {
                tracing::debug!(keep = %keep.address, "checking current status");
                let resolved = self.resolver.resolve(&keep.address, keep.creation_block).await;
                (keep, resolved)
            })
            .buffer_unordered(self.concurrency);

        let mut outcome = RefreshOutcome::default();
        while let Some((keep, resolved)) = results.next().await {
            outcome.checked += 1;
            let status = match resolved {
                Ok(status) => status,
                Err(err) => {
                    tracing::warn!(keep = %keep.address, error = %err, "failed to refresh keep status");
                    outcome.failures.push(KeepFailure::new(keep.address, &err));
                    continue;
                }
            };

            if status.kind() == keep.status.kind() {
                continue;
            }

            match writer.update_status(&keep.address, status).await {
                Ok(true) => {
                    tracing::info!(
                        keep = %keep.address,
                        from = %keep.status.kind(),
                        to = %status.kind(),
                        "updated keep status"
                    );
                    outcome.changed += 1;
                }
                Ok(false) => {}
                Err(err @ CacheError::StatusReversion { .. }) => {
                    tracing::error!(keep = %keep.address, error = %err, "refusing status reversion");
                    outcome.failures.push(KeepFailure::new(keep.address, &err));
                }
                Err(err) => return Err(err),
            }
        }

        Ok(outcome)
    }
}

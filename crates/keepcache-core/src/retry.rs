//! Exponential backoff retry for ledger calls.
//!
//! [`RetryingLedger`] wraps any [`KeepLedger`] and re-issues calls that fail
//! with a retryable error until the [`RetryPolicy`] is exhausted.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::ledger::{EventSource, KeepLedger};
use crate::types::{BlockHeader, LedgerEvent};

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries (not counting the first attempt).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor applied per retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Extra delay added on top of the capped backoff, as a fraction of it.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter_fraction() -> f64 { 0.1 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Stateless retry policy: computes the delay for a given attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th retry (1-based), or `None` once
    /// `max_retries` is exceeded.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff_ms as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        // Half the jitter band, applied deterministically.
        let jitter_ms = capped * self.config.jitter_fraction * 0.5;
        Some(Duration::from_millis((capped + jitter_ms) as u64))
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// policy runs out of retries. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = self.next_delay(attempt) else {
                        tracing::debug!(op, attempts = attempt, "retries exhausted");
                        return Err(err);
                    };
                    tracing::warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "ledger call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// A [`KeepLedger`] that applies a [`RetryPolicy`] to every call.
pub struct RetryingLedger<L> {
    inner: L,
    policy: RetryPolicy,
}

impl<L: KeepLedger> RetryingLedger<L> {
    pub fn new(inner: L, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<L: KeepLedger> KeepLedger for RetryingLedger<L> {
    async fn past_events(
        &self,
        source: &EventSource,
        event: &str,
        from_block: u64,
    ) -> Result<Vec<LedgerEvent>, CacheError> {
        self.policy
            .run(event, || self.inner.past_events(source, event, from_block))
            .await
    }

    async fn block(&self, number: u64) -> Result<BlockHeader, CacheError> {
        self.policy.run("getBlock", || self.inner.block(number)).await
    }

    async fn opened_timestamp(&self, keep: &str) -> Result<i64, CacheError> {
        self.policy
            .run("getOpenedTimestamp", || self.inner.opened_timestamp(keep))
            .await
    }

    async fn public_key(&self, keep: &str) -> Result<Option<String>, CacheError> {
        self.policy
            .run("getPublicKey", || self.inner.public_key(keep))
            .await
    }

    async fn is_awaiting_signature(&self, keep: &str, digest: &str) -> Result<bool, CacheError> {
        self.policy
            .run("isAwaitingSignature", || {
                self.inner.is_awaiting_signature(keep, digest)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        })
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        });
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            multiplier: 10.0,
            jitter_fraction: 0.0,
        });
        assert_eq!(policy.next_delay(6).unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn zero_retries_never_delays() {
        assert!(RetryPolicy::new(RetryConfig::none()).next_delay(1).is_none());
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = fast(3)
            .run("op", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CacheError::Rpc("flaky".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_after_exhaustion() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = fast(2)
            .run("op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CacheError::Rpc("down".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = fast(5)
            .run("op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CacheError::Other("reverted".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Other(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

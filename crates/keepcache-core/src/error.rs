//! Error types for the keep cache.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StatusKind;

/// A single keep that could not be fetched or refreshed during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepFailure {
    /// Keep address.
    pub address: String,
    /// Human-readable failure reason (the underlying error's message).
    pub reason: String,
}

impl KeepFailure {
    pub fn new(address: impl Into<String>, error: &CacheError) -> Self {
        Self {
            address: address.into(),
            reason: error.to_string(),
        }
    }
}

/// Errors that can occur while maintaining the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Transient ledger failure. Retried by the retry policy; once the
    /// policy is exhausted it becomes a per-keep failure.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Store read/write failure. Fatal to the current refresh cycle.
    #[error("Storage error: {0}")]
    Persistence(String),

    /// Some keeps failed during fetch or status refresh. Successes are
    /// already persisted; the failed keeps are retried next cycle.
    #[error("{} keep(s) could not be resolved", failures.len())]
    PartialBatch { failures: Vec<KeepFailure> },

    #[error("Malformed {event} event at block {block_number}: {reason}")]
    EventDecode {
        event: String,
        block_number: u64,
        reason: String,
    },

    #[error("Status of keep {address} cannot move from {from} to {to}")]
    StatusReversion {
        address: String,
        from: StatusKind,
        to: StatusKind,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl CacheError {
    /// Returns `true` if the retry policy should re-issue the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }

    /// Returns `true` if the error aborts a refresh cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Config(_))
    }

    /// Per-keep failures carried by a [`CacheError::PartialBatch`].
    pub fn failures(&self) -> &[KeepFailure] {
        match self {
            Self::PartialBatch { failures } => failures,
            _ => &[],
        }
    }
}

//! Cache configuration and its fluent builder.
//!
//! # Example
//!
//! ```rust
//! use keepcache_core::config::CacheConfigBuilder;
//!
//! let config = CacheConfigBuilder::new()
//!     .deployment_block(10_834_116)
//!     .reorg_depth(12)
//!     .concurrency(3)
//!     .max_retries(5)
//!     .build_config();
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::retry::RetryConfig;

/// Configuration for a [`crate::Cache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How many blocks before the checkpoint each scan starts, to absorb
    /// chain reorganizations near the previous tip.
    #[serde(default = "default_reorg_depth")]
    pub reorg_depth: u64,
    /// Maximum number of keeps fetched or refreshed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Checkpoint used before the first scan (the keep factory's
    /// deployment block).
    #[serde(default)]
    pub deployment_block: u64,
    /// Retry policy applied to every ledger call.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_reorg_depth() -> u64 { 12 }
fn default_concurrency() -> usize { 3 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reorg_depth: default_reorg_depth(),
            concurrency: default_concurrency(),
            deployment_block: 0,
            retry: RetryConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Reject settings the refresh cycle cannot run with.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.concurrency == 0 {
            return Err(CacheError::Config("concurrency must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(CacheError::Config(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }
}

/// Fluent builder for [`CacheConfig`].
#[derive(Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    pub fn reorg_depth(mut self, blocks: u64) -> Self {
        self.config.reorg_depth = blocks;
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.config.concurrency = limit;
        self
    }

    pub fn deployment_block(mut self, block: u64) -> Self {
        self.config.deployment_block = block;
        self
    }

    /// Replace the whole retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    pub fn build_config(self) -> CacheConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = CacheConfigBuilder::new().build_config();
        assert_eq!(cfg.reorg_depth, 12);
        assert_eq!(cfg.concurrency, 3);
        assert_eq!(cfg.deployment_block, 0);
        assert_eq!(cfg.retry.max_retries, 3);
    }

    #[test]
    fn deserializes_partial_config() {
        let cfg: CacheConfig =
            serde_json::from_str(r#"{"deployment_block": 500, "retry": {"max_retries": 7}}"#)
                .unwrap();
        assert_eq!(cfg.deployment_block, 500);
        assert_eq!(cfg.reorg_depth, 12);
        assert_eq!(cfg.retry.max_retries, 7);
        assert_eq!(cfg.retry.initial_backoff_ms, 100);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = CacheConfigBuilder::new().concurrency(0).build_config();
        assert!(matches!(cfg.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn shrinking_backoff_is_rejected() {
        let cfg = CacheConfigBuilder::new()
            .retry(RetryConfig {
                multiplier: 0.5,
                ..Default::default()
            })
            .build_config();
        assert!(cfg.validate().is_err());
    }
}

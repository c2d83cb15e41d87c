// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::time::Duration;

use serde_derive::Deserialize;
use serde_derive::Serialize;

/// Sleep budgets, in milliseconds, of the backoffers used by each 2PC phase.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct BackoffBudget {
    pub prewrite_ms: u64,
    pub commit_ms: u64,
    pub cleanup_ms: u64,
    pub pessimistic_lock_ms: u64,
    pub pessimistic_rollback_ms: u64,
    pub tso_ms: u64,
}

impl Default for BackoffBudget {
    fn default() -> Self {
        Self {
            prewrite_ms: 20_000,
            commit_ms: 41_000,
            cleanup_ms: 20_000,
            pessimistic_lock_ms: 20_000,
            pessimistic_rollback_ms: 20_000,
            tso_ms: 15_000,
        }
    }
}

/// The configuration of a [`TransactionClient`](crate::TransactionClient) and every
/// transaction it begins.
///
/// Thresholds are carried per client; two clients in one process may use different values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct TxnConfig {
    /// Timeout of a single store RPC.
    pub timeout: Duration,
    /// Upper bound of the accumulated key (and value, for prewrite) bytes of one batch.
    pub commit_batch_size: usize,
    /// Maximum number of batches in flight for one action.
    pub committer_concurrency: usize,
    /// TTL the heartbeat keeps extending; also the cap of the size-derived lock TTL.
    pub managed_lock_ttl: Duration,
    /// After this long the TTL manager gives up and lets the locks expire.
    pub max_txn_ttl: Duration,
    /// A transaction whose commit timestamp is further than this from its start fails.
    pub max_txn_time_use: Duration,
    /// Regions receiving at least this many mutations are split before prewrite.
    pub pre_split_detect_threshold: usize,
    /// Bytes of mutations per new region when pre-splitting.
    pub pre_split_size_threshold: usize,
    /// Write-conflict retries of the pessimistic lock taken for amended mutations.
    pub pessimistic_lock_max_retry_count: usize,
    pub txn_entry_size_limit: usize,
    pub txn_total_size_limit: usize,
    /// Transactions larger than this start the TTL manager after the primary prewrite.
    pub ttl_refreshed_txn_size: usize,
    pub backoff: BackoffBudget,
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_COMMIT_BATCH_SIZE: usize = 16 * 1024;
const DEFAULT_COMMITTER_CONCURRENCY: usize = 128;
const DEFAULT_MANAGED_LOCK_TTL: Duration = Duration::from_secs(20);
const DEFAULT_MAX_TXN_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_MAX_TXN_TIME_USE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_PRE_SPLIT_DETECT_THRESHOLD: usize = 100_000;
const DEFAULT_PRE_SPLIT_SIZE_THRESHOLD: usize = 32 << 20;
const DEFAULT_PESSIMISTIC_LOCK_MAX_RETRY_COUNT: usize = 256;
const DEFAULT_TXN_ENTRY_SIZE_LIMIT: usize = 6 << 20;
const DEFAULT_TXN_TOTAL_SIZE_LIMIT: usize = 100 << 20;
const DEFAULT_TTL_REFRESHED_TXN_SIZE: usize = 32 << 20;

impl Default for TxnConfig {
    fn default() -> Self {
        TxnConfig {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            commit_batch_size: DEFAULT_COMMIT_BATCH_SIZE,
            committer_concurrency: DEFAULT_COMMITTER_CONCURRENCY,
            managed_lock_ttl: DEFAULT_MANAGED_LOCK_TTL,
            max_txn_ttl: DEFAULT_MAX_TXN_TTL,
            max_txn_time_use: DEFAULT_MAX_TXN_TIME_USE,
            pre_split_detect_threshold: DEFAULT_PRE_SPLIT_DETECT_THRESHOLD,
            pre_split_size_threshold: DEFAULT_PRE_SPLIT_SIZE_THRESHOLD,
            pessimistic_lock_max_retry_count: DEFAULT_PESSIMISTIC_LOCK_MAX_RETRY_COUNT,
            txn_entry_size_limit: DEFAULT_TXN_ENTRY_SIZE_LIMIT,
            txn_total_size_limit: DEFAULT_TXN_TOTAL_SIZE_LIMIT,
            ttl_refreshed_txn_size: DEFAULT_TTL_REFRESHED_TXN_SIZE,
            backoff: BackoffBudget::default(),
        }
    }
}

impl TxnConfig {
    /// Set the timeout of a single store RPC.
    ///
    /// ```rust
    /// # use tikv_txn::TxnConfig;
    /// # use std::time::Duration;
    /// let config = TxnConfig::default().with_timeout(Duration::from_millis(500));
    /// ```
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the byte limit of one batch of mutations.
    #[must_use]
    pub fn with_commit_batch_size(mut self, size: usize) -> Self {
        self.commit_batch_size = size;
        self
    }

    /// Set how many batches of one action may be in flight.
    #[must_use]
    pub fn with_committer_concurrency(mut self, concurrency: usize) -> Self {
        self.committer_concurrency = concurrency;
        self
    }

    /// Set the managed lock TTL. The heartbeat ticks at half of it.
    ///
    /// ```rust
    /// # use tikv_txn::TxnConfig;
    /// # use std::time::Duration;
    /// let config = TxnConfig::default()
    ///     .with_managed_lock_ttl(Duration::from_secs(10))
    ///     .with_max_txn_ttl(Duration::from_secs(600));
    /// assert_eq!(config.managed_lock_ttl, Duration::from_secs(10));
    /// ```
    #[must_use]
    pub fn with_managed_lock_ttl(mut self, ttl: Duration) -> Self {
        self.managed_lock_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_txn_ttl(mut self, ttl: Duration) -> Self {
        self.max_txn_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_txn_time_use(mut self, time_use: Duration) -> Self {
        self.max_txn_time_use = time_use;
        self
    }

    /// Set when and how regions are split ahead of a large prewrite.
    #[must_use]
    pub fn with_pre_split(mut self, detect_threshold: usize, size_threshold: usize) -> Self {
        self.pre_split_detect_threshold = detect_threshold;
        self.pre_split_size_threshold = size_threshold;
        self
    }

    #[must_use]
    pub fn with_pessimistic_lock_max_retry_count(mut self, count: usize) -> Self {
        self.pessimistic_lock_max_retry_count = count;
        self
    }

    /// Set the per-entry and total size limits of a transaction.
    #[must_use]
    pub fn with_size_limits(mut self, entry_limit: usize, total_limit: usize) -> Self {
        self.txn_entry_size_limit = entry_limit;
        self.txn_total_size_limit = total_limit;
        self
    }

    #[must_use]
    pub fn with_ttl_refreshed_txn_size(mut self, size: usize) -> Self {
        self.ttl_refreshed_txn_size = size;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffBudget) -> Self {
        self.backoff = backoff;
        self
    }

    pub(crate) fn managed_lock_ttl_ms(&self) -> u64 {
        self.managed_lock_ttl.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_reads_kebab_case_and_fills_defaults() {
        let config: TxnConfig = serde_json::from_str(
            r#"{
                "commit-batch-size": 1024,
                "managed-lock-ttl": { "secs": 5, "nanos": 0 },
                "backoff": { "commit-ms": 100 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.commit_batch_size, 1024);
        assert_eq!(config.managed_lock_ttl, Duration::from_secs(5));
        assert_eq!(config.backoff.commit_ms, 100);
        assert_eq!(config.backoff.prewrite_ms, 20_000);
        assert_eq!(config.committer_concurrency, DEFAULT_COMMITTER_CONCURRENCY);
        assert_eq!(config.txn_total_size_limit, 100 << 20);
    }
}

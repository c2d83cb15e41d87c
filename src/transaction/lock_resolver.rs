// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

use async_trait::async_trait;

use crate::region::RegionVerId;
use crate::store::LockInfo;
use crate::Result;

/// The outcome of resolving locks met while acquiring pessimistic locks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolvedLocks {
    /// Milliseconds until the longest-living unresolved lock expires, `0` when all are gone.
    pub ms_before_txn_expired: i64,
    pub resolved_region: Option<RegionVerId>,
}

/// Checks the transactions owning conflicting locks and cleans up the ones that are finished
/// or expired.
#[async_trait]
pub trait LockResolver: Send + Sync + 'static {
    /// Resolve locks blocking a prewrite of the transaction `caller_start_ts`.
    ///
    /// Returns how long, in milliseconds, the caller should expect to wait before retrying;
    /// `0` means every lock was resolved.
    async fn resolve_for_write(&self, caller_start_ts: u64, locks: Vec<LockInfo>) -> Result<i64>;

    /// Resolve locks met by a pessimistic lock request.
    async fn resolve(&self, caller_start_ts: u64, locks: Vec<LockInfo>) -> Result<ResolvedLocks>;
}

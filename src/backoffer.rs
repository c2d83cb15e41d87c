// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! Sleep-budgeted backoff shared by every retry loop of the committer.
//!
//! A [`Backoffer`] sleeps for an exponentially growing, per-kind interval and fails once the
//! total sleep exceeds its budget. Backoffers carry a cancelable context: [`Backoffer::fork`]
//! derives a child that a sibling can cancel, [`Backoffer::clone_detached`] copies the budget for a
//! task that must outlive the caller.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand::thread_rng;
use rand::Rng;
use thiserror::Error;

use crate::stats;
use crate::store::RegionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Jitter {
    NoJitter,
    EqualJitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackoffFnCfg {
    base_ms: u64,
    cap_ms: u64,
    jitter: Jitter,
}

impl BackoffFnCfg {
    pub(crate) const fn new(base_ms: u64, cap_ms: u64, jitter: Jitter) -> Self {
        Self {
            base_ms,
            cap_ms,
            jitter,
        }
    }
}

/// The error class a backoffer reports once its budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffErrorKind {
    StoreServerTimeout,
    ResolveLockTimeout,
    RegionUnavailable,
    OracleServerTimeout,
}

impl std::fmt::Display for BackoffErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackoffErrorKind::StoreServerTimeout => "store server timeout",
            BackoffErrorKind::ResolveLockTimeout => "resolve lock timeout",
            BackoffErrorKind::RegionUnavailable => "region unavailable",
            BackoffErrorKind::OracleServerTimeout => "timestamp oracle timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackofferError {
    /// The context was canceled by a failing sibling; keeps the message of the retried error.
    #[error("canceled: {message}")]
    Canceled { message: String },

    /// Sleep budget exhausted; reports the kind that slept the longest.
    #[error("{kind}, last error: {message}")]
    MaxSleepExceeded {
        kind: BackoffErrorKind,
        message: String,
    },
}

impl BackofferError {
    pub fn kind(&self) -> Option<BackoffErrorKind> {
        match self {
            BackofferError::MaxSleepExceeded { kind, .. } => Some(*kind),
            BackofferError::Canceled { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackoffConfig {
    pub(crate) name: &'static str,
    fn_cfg: BackoffFnCfg,
    err_kind: BackoffErrorKind,
}

impl BackoffConfig {
    pub(crate) const fn new(
        name: &'static str,
        fn_cfg: BackoffFnCfg,
        err_kind: BackoffErrorKind,
    ) -> Self {
        Self {
            name,
            fn_cfg,
            err_kind,
        }
    }
}

pub(crate) const BO_STORE_RPC: BackoffConfig = BackoffConfig::new(
    "storeRPC",
    BackoffFnCfg::new(100, 2000, Jitter::EqualJitter),
    BackoffErrorKind::StoreServerTimeout,
);

pub(crate) const BO_REGION_MISS: BackoffConfig = BackoffConfig::new(
    "regionMiss",
    BackoffFnCfg::new(2, 500, Jitter::NoJitter),
    BackoffErrorKind::RegionUnavailable,
);

pub(crate) const BO_ORACLE_RPC: BackoffConfig = BackoffConfig::new(
    "oracleRPC",
    BackoffFnCfg::new(500, 3000, Jitter::EqualJitter),
    BackoffErrorKind::OracleServerTimeout,
);

pub(crate) const BO_TXN_LOCK: BackoffConfig = BackoffConfig::new(
    "txnLock",
    BackoffFnCfg::new(100, 3000, Jitter::EqualJitter),
    BackoffErrorKind::ResolveLockTimeout,
);

pub(crate) const BO_TXN_LOCK_FAST: BackoffConfig = BackoffConfig::new(
    "txnLockFast",
    BackoffFnCfg::new(10, 3000, Jitter::EqualJitter),
    BackoffErrorKind::ResolveLockTimeout,
);

/// Region errors retried without sleeping before the retries start to sleep.
pub(crate) const MAX_IMMEDIATE_REGION_RETRIES: u32 = 8;

#[derive(Debug)]
struct BackoffFnState {
    base_ms: u64,
    cap_ms: u64,
    jitter: Jitter,
    attempts: u32,
}

impl BackoffFnState {
    fn new(cfg: BackoffFnCfg) -> Self {
        // Keep jitter ranges non-empty.
        let base_ms = cfg.base_ms.max(2);
        Self {
            base_ms,
            cap_ms: cfg.cap_ms.max(base_ms),
            jitter: cfg.jitter,
            attempts: 0,
        }
    }

    fn backoff_ms(&mut self, max_sleep_ms: Option<u64>) -> u64 {
        let v = expo(self.base_ms, self.cap_ms, self.attempts);
        let sleep_ms = match self.jitter {
            Jitter::NoJitter => v,
            Jitter::EqualJitter => v / 2 + thread_rng().gen_range(0..v / 2),
        };
        self.attempts += 1;
        max_sleep_ms.map_or(sleep_ms, |max| sleep_ms.min(max))
    }
}

fn expo(base_ms: u64, cap_ms: u64, attempts: u32) -> u64 {
    let mul = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    base_ms.saturating_mul(mul).min(cap_ms)
}

#[derive(Debug)]
struct BackoffContextInner {
    parent: Option<Arc<BackoffContextInner>>,
    canceled: AtomicBool,
}

/// A cancelable context; canceling a context cancels every context forked from it.
#[derive(Debug, Clone)]
pub(crate) struct BackoffContext {
    inner: Arc<BackoffContextInner>,
}

impl BackoffContext {
    pub(crate) fn new() -> (Self, BackoffCancel) {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Arc<BackoffContextInner>>) -> (Self, BackoffCancel) {
        let inner = Arc::new(BackoffContextInner {
            parent,
            canceled: AtomicBool::new(false),
        });
        (
            Self {
                inner: inner.clone(),
            },
            BackoffCancel { inner },
        )
    }

    fn with_cancel(&self) -> (Self, BackoffCancel) {
        Self::with_parent(Some(self.inner.clone()))
    }

    fn is_canceled(&self) -> bool {
        let mut cursor = Some(&self.inner);
        while let Some(inner) = cursor {
            if inner.canceled.load(Ordering::Acquire) {
                return true;
            }
            cursor = inner.parent.as_ref();
        }
        false
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BackoffCancel {
    inner: Arc<BackoffContextInner>,
}

impl BackoffCancel {
    pub(crate) fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
    }
}

/// A total-sleep budget for one logical operation and all its retries.
#[derive(Debug)]
pub(crate) struct Backoffer {
    ctx: BackoffContext,
    max_sleep_ms: u64,
    total_sleep_ms: u64,

    errors: Vec<String>,
    configs: Vec<BackoffConfig>,
    backoff_sleep_ms: HashMap<&'static str, u64>,
    immediate_retries: u32,

    // Attempt counters are per backoffer and start over in forks and clones.
    fns: HashMap<&'static str, BackoffFnState>,
}

impl Backoffer {
    /// A backoffer rooted at a fresh context.
    pub(crate) fn new(max_sleep_ms: u64) -> Self {
        let (ctx, _) = BackoffContext::new();
        Self::with_context(ctx, max_sleep_ms)
    }

    pub(crate) fn with_context(ctx: BackoffContext, max_sleep_ms: u64) -> Self {
        Self {
            ctx,
            max_sleep_ms,
            total_sleep_ms: 0,
            errors: Vec::new(),
            configs: Vec::new(),
            backoff_sleep_ms: HashMap::new(),
            immediate_retries: 0,
            fns: HashMap::new(),
        }
    }

    /// An independent copy sharing the context, for work that must survive the caller.
    pub(crate) fn clone_detached(&self) -> Self {
        self.derive(self.ctx.clone())
    }

    /// A copy under a child context; the returned handle cancels the child and its descendants.
    pub(crate) fn fork(&self) -> (Self, BackoffCancel) {
        let (ctx, cancel) = self.ctx.with_cancel();
        (self.derive(ctx), cancel)
    }

    fn derive(&self, ctx: BackoffContext) -> Self {
        Self {
            ctx,
            max_sleep_ms: self.max_sleep_ms,
            total_sleep_ms: self.total_sleep_ms,
            errors: self.errors.clone(),
            configs: self.configs.clone(),
            backoff_sleep_ms: self.backoff_sleep_ms.clone(),
            immediate_retries: self.immediate_retries,
            fns: HashMap::new(),
        }
    }

    pub(crate) fn total_sleep_ms(&self) -> u64 {
        self.total_sleep_ms
    }

    /// Number of backoffs taken, i.e. how many errors were retried.
    pub(crate) fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub(crate) fn backoff_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.configs.iter().map(|cfg| cfg.name)
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.ctx.is_canceled()
    }

    fn longest_sleep_cfg(&self) -> Option<BackoffConfig> {
        let (name, _) = self
            .backoff_sleep_ms
            .iter()
            .max_by_key(|(name, sleep_ms)| (**sleep_ms, **name))?;
        self.configs.iter().copied().find(|cfg| cfg.name == *name)
    }

    pub(crate) async fn backoff(
        &mut self,
        cfg: &BackoffConfig,
        err_message: impl Into<String>,
    ) -> Result<(), BackofferError> {
        self.backoff_with_max_sleep(cfg, None, err_message).await
    }

    /// Sleep for the next interval of `cfg`, capped at `max_sleep_ms` when given.
    pub(crate) async fn backoff_with_max_sleep(
        &mut self,
        cfg: &BackoffConfig,
        max_sleep_ms: Option<u64>,
        err_message: impl Into<String>,
    ) -> Result<(), BackofferError> {
        let sleep_ms = self.next_sleep_ms(cfg, max_sleep_ms, err_message.into())?;
        debug!(
            "backoff {} for {}ms, total {}ms of {}ms",
            cfg.name, sleep_ms, self.total_sleep_ms, self.max_sleep_ms
        );
        stats::observe_backoff(cfg.name, sleep_ms);
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        Ok(())
    }

    /// Retry right away, as long as few enough retries went without a sleep. Past that, sleep
    /// like [`Backoffer::backoff`] so the retries stay bounded by the budget.
    pub(crate) async fn retry_immediately(
        &mut self,
        cfg: &BackoffConfig,
        err_message: impl Into<String>,
    ) -> Result<(), BackofferError> {
        let err_message = err_message.into();
        if self.immediate_retries >= MAX_IMMEDIATE_REGION_RETRIES {
            return self.backoff(cfg, err_message).await;
        }
        self.check_retry(cfg, &err_message)?;
        self.immediate_retries += 1;
        self.errors.push(err_message);
        Ok(())
    }

    fn check_retry(&self, cfg: &BackoffConfig, err_message: &str) -> Result<(), BackofferError> {
        if self.ctx.is_canceled() {
            return Err(BackofferError::Canceled {
                message: err_message.to_owned(),
            });
        }

        if self.max_sleep_ms > 0 && self.total_sleep_ms >= self.max_sleep_ms {
            let kind = self
                .longest_sleep_cfg()
                .map_or(cfg.err_kind, |cfg| cfg.err_kind);
            return Err(BackofferError::MaxSleepExceeded {
                kind,
                message: err_message.to_owned(),
            });
        }
        Ok(())
    }

    fn next_sleep_ms(
        &mut self,
        cfg: &BackoffConfig,
        max_sleep_ms: Option<u64>,
        err_message: String,
    ) -> Result<u64, BackofferError> {
        self.check_retry(cfg, &err_message)?;

        self.errors.push(err_message);
        self.configs.push(*cfg);

        let state = self
            .fns
            .entry(cfg.name)
            .or_insert_with(|| BackoffFnState::new(cfg.fn_cfg));
        let sleep_ms = state.backoff_ms(max_sleep_ms);

        self.total_sleep_ms += sleep_ms;
        *self.backoff_sleep_ms.entry(cfg.name).or_default() += sleep_ms;
        Ok(sleep_ms)
    }
}

/// Account for a region error before the request is retried.
///
/// An epoch mismatch that carries the current regions, and that the router caught up with,
/// is retried without sleeping. Everything else sleeps.
pub(crate) async fn may_backoff_for_region_error(
    region_err: &RegionError,
    router_caught_up: bool,
    bo: &mut Backoffer,
) -> Result<(), BackofferError> {
    match region_err {
        RegionError::EpochNotMatch { current_regions }
            if router_caught_up && !current_regions.is_empty() =>
        {
            bo.retry_immediately(&BO_REGION_MISS, region_err.to_string())
                .await
        }
        _ => bo.backoff(&BO_REGION_MISS, region_err.to_string()).await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::region::RegionVerId;

    #[test]
    fn test_backoff_with_max_sleep() {
        let mut b = Backoffer::new(2000);
        let slept = b
            .next_sleep_ms(&BO_TXN_LOCK_FAST, Some(5), "test".to_owned())
            .unwrap();
        assert_eq!(slept, 5);
        assert_eq!(b.total_sleep_ms(), 5);
        assert_eq!(b.error_count(), 1);
    }

    #[test]
    fn test_backoff_error_type_uses_longest_sleep_kind() {
        let mut b = Backoffer::new(800);
        b.next_sleep_ms(&BO_REGION_MISS, None, "region miss".to_owned())
            .unwrap();
        for _ in 0..20 {
            match b.next_sleep_ms(&BO_TXN_LOCK, None, "locked".to_owned()) {
                Ok(_) => {}
                Err(e) => {
                    assert_eq!(e.kind(), Some(BackoffErrorKind::ResolveLockTimeout));
                    return;
                }
            }
        }
        panic!("expected the backoff to exceed max sleep");
    }

    #[test]
    fn test_clone_and_fork_share_budget() {
        let mut b = Backoffer::new(4);
        for _ in 0..2 {
            b.next_sleep_ms(&BO_REGION_MISS, None, "region miss".to_owned())
                .unwrap();
        }

        let (forked, _cancel) = b.fork();
        let cloned = b.clone_detached();
        for mut bo in [forked, cloned] {
            let e = bo
                .next_sleep_ms(&BO_STORE_RPC, None, "rpc".to_owned())
                .unwrap_err();
            assert_eq!(e.kind(), Some(BackoffErrorKind::RegionUnavailable), "{e:?}");
        }
    }

    #[test]
    fn test_cancel_propagates_to_descendants_only() {
        let b = Backoffer::new(1000);
        let (parent, cancel) = b.fork();
        let (mut child, _child_cancel) = parent.fork();
        let mut cloned = parent.clone_detached();

        cancel.cancel();
        assert!(!b.is_canceled());
        assert!(parent.is_canceled());
        assert!(matches!(
            child.next_sleep_ms(&BO_REGION_MISS, None, "x".to_owned()),
            Err(BackofferError::Canceled { .. })
        ));
        assert!(cloned.is_canceled());
        assert!(cloned
            .next_sleep_ms(&BO_REGION_MISS, None, "x".to_owned())
            .is_err());
    }

    #[tokio::test]
    async fn test_may_backoff_for_region_error() {
        let mut b = Backoffer::new(100);
        let err = RegionError::EpochNotMatch {
            current_regions: vec![RegionVerId {
                id: 1,
                conf_ver: 1,
                ver: 2,
            }],
        };
        may_backoff_for_region_error(&err, true, &mut b).await.unwrap();
        assert_eq!(b.total_sleep_ms(), 0);
        assert_eq!(b.error_count(), 1);

        // The router is still behind the store.
        may_backoff_for_region_error(&err, false, &mut b).await.unwrap();
        assert!(b.total_sleep_ms() > 0);

        for err in [
            RegionError::EpochNotMatch {
                current_regions: vec![],
            },
            RegionError::NotLeader {
                region_id: 1,
                leader_store_id: None,
            },
            RegionError::RegionNotFound { region_id: 1 },
        ] {
            let before = b.total_sleep_ms();
            may_backoff_for_region_error(&err, true, &mut b).await.unwrap();
            assert!(b.total_sleep_ms() > before, "{err:?}");
        }
    }

    #[tokio::test]
    async fn test_repeated_epoch_mismatch_exhausts_the_budget() {
        let mut b = Backoffer::new(100);
        let err = RegionError::EpochNotMatch {
            current_regions: vec![RegionVerId {
                id: 1,
                conf_ver: 1,
                ver: 2,
            }],
        };
        for _ in 0..MAX_IMMEDIATE_REGION_RETRIES {
            may_backoff_for_region_error(&err, true, &mut b).await.unwrap();
        }
        assert_eq!(b.total_sleep_ms(), 0);

        let mut retries = 0;
        let e = loop {
            match may_backoff_for_region_error(&err, true, &mut b).await {
                Ok(()) => retries += 1,
                Err(e) => break e,
            }
            assert!(retries < 100, "the budget never ran out");
        };
        assert_eq!(e.kind(), Some(BackoffErrorKind::RegionUnavailable));
        assert!(b.total_sleep_ms() >= 100);
    }

    #[tokio::test]
    async fn test_immediate_retries_stop_once_canceled() {
        let b = Backoffer::new(100);
        let (mut forked, cancel) = b.fork();
        cancel.cancel();
        assert!(matches!(
            forked.retry_immediately(&BO_REGION_MISS, "epoch").await,
            Err(BackofferError::Canceled { .. })
        ));
    }
}

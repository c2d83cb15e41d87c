// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! Points where tests can inject faults into the commit protocol.

use std::time::Duration;

use crate::region::RegionVerId;
use crate::store::LockInfo;
use crate::store::RegionError;
use crate::Key;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcKind {
    Prewrite,
    Commit,
    BatchRollback,
    PessimisticLock,
    PessimisticRollback,
    TxnHeartBeat,
}

impl RpcKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            RpcKind::Prewrite => "prewrite",
            RpcKind::Commit => "commit",
            RpcKind::BatchRollback => "batch_rollback",
            RpcKind::PessimisticLock => "pessimistic_lock",
            RpcKind::PessimisticRollback => "pessimistic_rollback",
            RpcKind::TxnHeartBeat => "txn_heart_beat",
        }
    }
}

/// What to do with an RPC about to be sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaultAction {
    Continue,
    /// Sleep, then send.
    Sleep(Duration),
    /// Do not send; answer with this region error.
    RegionError(RegionError),
    /// Do not send; fail as if the connection broke.
    TransportError(String),
}

/// A fault-injection seam. Every method defaults to doing nothing.
pub trait FaultHooks: Send + Sync + 'static {
    fn before_send(
        &self,
        kind: RpcKind,
        region: RegionVerId,
        is_primary: bool,
        keys: &[Key],
    ) -> FaultAction {
        let _ = (kind, region, is_primary, keys);
        FaultAction::Continue
    }

    /// Called before conflicting locks are handed to the lock resolver. May delay it.
    fn before_resolve_locks(&self, start_ts: u64, locks: &[LockInfo]) -> Option<Duration> {
        let _ = (start_ts, locks);
        None
    }

    /// Called once the commit timestamp is known, before the primary batch is committed.
    fn before_commit_primary(&self, start_ts: u64, commit_ts: u64) -> Option<Duration> {
        let _ = (start_ts, commit_ts);
        None
    }

    /// Overrides the configured batch size limit.
    fn batch_size_limit(&self) -> Option<usize> {
        None
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

impl FaultHooks for NoopHooks {}

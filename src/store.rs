// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! Requests and responses of the transactional shard RPCs, and the client that sends them.
//!
//! Every response carries either a [`RegionError`] (the addressed region is stale) or logical
//! [`KeyError`]s. Transport failures are reported as [`Error::Transport`](crate::Error).

use async_trait::async_trait;
use thiserror::Error;

use crate::region::RegionId;
use crate::region::RegionVerId;
use crate::Key;
use crate::Result;
use crate::Value;

/// The kind of a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Put,
    Del,
    Lock,
    /// A put that asserts the key does not exist yet.
    Insert,
    /// Only checks the key does not exist; writes no lock and needs no commit.
    CheckNotExists,
    PessimisticLock,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Assertion {
    #[default]
    None,
    NotExist,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub op: Op,
    pub key: Key,
    pub value: Value,
    pub assertion: Assertion,
}

/// A lock left by a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockInfo {
    pub primary_lock: Key,
    pub lock_version: u64,
    pub key: Key,
    pub lock_ttl: u64,
    pub txn_size: u64,
    pub lock_type: Op,
    pub lock_for_update_ts: u64,
    pub min_commit_ts: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteConflict {
    pub start_ts: u64,
    pub conflict_ts: u64,
    pub conflict_commit_ts: u64,
    pub key: Key,
    pub primary: Key,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlreadyExist {
    pub key: Key,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitForEntry {
    pub txn: u64,
    pub wait_for_txn: u64,
    pub key_hash: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deadlock {
    pub lock_ts: u64,
    pub lock_key: Key,
    pub deadlock_key_hash: u64,
    pub wait_chain: Vec<WaitForEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitTsExpired {
    pub start_ts: u64,
    pub attempted_commit_ts: u64,
    pub key: Key,
    pub min_commit_ts: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnLockNotFound {
    pub start_ts: u64,
    pub key: Key,
}

/// A logical, per-key error. At most one field is set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyError {
    pub locked: Option<LockInfo>,
    pub retryable: String,
    pub abort: String,
    pub conflict: Option<WriteConflict>,
    pub already_exist: Option<AlreadyExist>,
    pub deadlock: Option<Deadlock>,
    pub commit_ts_expired: Option<CommitTsExpired>,
    pub txn_lock_not_found: Option<TxnLockNotFound>,
}

impl KeyError {
    pub fn locked(lock: LockInfo) -> KeyError {
        KeyError {
            locked: Some(lock),
            ..Default::default()
        }
    }
}

/// The addressed region no longer matches the store's view.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("not leader, region_id={region_id}, leader_store_id={leader_store_id:?}")]
    NotLeader {
        region_id: RegionId,
        leader_store_id: Option<u64>,
    },
    #[error("epoch not match, current_regions={current_regions:?}")]
    EpochNotMatch { current_regions: Vec<RegionVerId> },
    #[error("region {region_id} not found")]
    RegionNotFound { region_id: RegionId },
    #[error("key {key:?} not in region {region_id}")]
    KeyNotInRegion { key: Key, region_id: RegionId },
    #[error("server is busy: {reason}")]
    ServerIsBusy { reason: String },
    #[error("stale command")]
    StaleCommand,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrewriteRequest {
    pub mutations: Vec<Mutation>,
    pub is_pessimistic_lock: Vec<bool>,
    pub primary_lock: Key,
    pub start_version: u64,
    pub lock_ttl: u64,
    pub for_update_ts: u64,
    pub txn_size: u64,
    pub min_commit_ts: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrewriteResponse {
    pub region_error: Option<RegionError>,
    pub errors: Vec<KeyError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitRequest {
    pub start_version: u64,
    pub keys: Vec<Key>,
    pub commit_version: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitResponse {
    pub region_error: Option<RegionError>,
    pub error: Option<KeyError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchRollbackRequest {
    pub start_version: u64,
    pub keys: Vec<Key>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchRollbackResponse {
    pub region_error: Option<RegionError>,
    pub error: Option<KeyError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PessimisticLockRequest {
    pub mutations: Vec<Mutation>,
    pub primary_lock: Key,
    pub start_version: u64,
    pub for_update_ts: u64,
    pub lock_ttl: u64,
    pub is_first_lock: bool,
    /// Milliseconds to wait for a conflicting lock, `0` waits the store's default, `-1` never waits.
    pub wait_timeout: i64,
    pub return_values: bool,
    pub min_commit_ts: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PessimisticLockResponse {
    pub region_error: Option<RegionError>,
    pub errors: Vec<KeyError>,
    /// One entry per mutation when values were requested, `None` for a missing key.
    pub values: Vec<Option<Value>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PessimisticRollbackRequest {
    pub start_version: u64,
    pub for_update_ts: u64,
    pub keys: Vec<Key>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PessimisticRollbackResponse {
    pub region_error: Option<RegionError>,
    pub errors: Vec<KeyError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnHeartBeatRequest {
    pub primary_lock: Key,
    pub start_version: u64,
    pub advise_lock_ttl: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnHeartBeatResponse {
    pub region_error: Option<RegionError>,
    pub error: Option<KeyError>,
    pub lock_ttl: u64,
}

pub trait HasRegionError {
    /// Take the region error out of the response.
    fn region_error(&mut self) -> Option<RegionError>;
}

pub trait SetRegionError {
    fn set_region_error(&mut self, error: RegionError);
}

macro_rules! has_region_error {
    ($($type:ty),* $(,)?) => {
        $(
            impl HasRegionError for $type {
                fn region_error(&mut self) -> Option<RegionError> {
                    self.region_error.take()
                }
            }

            impl SetRegionError for $type {
                fn set_region_error(&mut self, error: RegionError) {
                    self.region_error = Some(error);
                }
            }
        )*
    };
}

has_region_error!(
    PrewriteResponse,
    CommitResponse,
    BatchRollbackResponse,
    PessimisticLockResponse,
    PessimisticRollbackResponse,
    TxnHeartBeatResponse,
);

/// Sends transactional RPCs to the store serving a region.
///
/// Implementations return `Err` only for transport failures; logical failures travel in the
/// response.
#[async_trait]
pub trait KvClient: Send + Sync + 'static {
    async fn prewrite(&self, region: RegionVerId, req: PrewriteRequest) -> Result<PrewriteResponse>;

    async fn commit(&self, region: RegionVerId, req: CommitRequest) -> Result<CommitResponse>;

    async fn batch_rollback(
        &self,
        region: RegionVerId,
        req: BatchRollbackRequest,
    ) -> Result<BatchRollbackResponse>;

    async fn pessimistic_lock(
        &self,
        region: RegionVerId,
        req: PessimisticLockRequest,
    ) -> Result<PessimisticLockResponse>;

    async fn pessimistic_rollback(
        &self,
        region: RegionVerId,
        req: PessimisticRollbackRequest,
    ) -> Result<PessimisticRollbackResponse>;

    async fn txn_heart_beat(
        &self,
        region: RegionVerId,
        req: TxnHeartBeatRequest,
    ) -> Result<TxnHeartBeatResponse>;
}

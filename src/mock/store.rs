// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! An in-memory multi-version store speaking the transactional RPCs.
//!
//! Writes are kept per key, newest commit first. Locks live beside them; a pessimistic lock
//! request blocked by another transaction waits for a release, consulting the deadlock
//! detector first. Reads only see committed data and ignore locks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use super::deadlock_detector::DeadlockDetector;
use super::router::MockCluster;
use crate::kv::key_hash;
use crate::region::RegionVerId;
use crate::store::AlreadyExist;
use crate::store::Assertion;
use crate::store::BatchRollbackRequest;
use crate::store::BatchRollbackResponse;
use crate::store::CommitRequest;
use crate::store::CommitResponse;
use crate::store::CommitTsExpired;
use crate::store::Deadlock;
use crate::store::KeyError;
use crate::store::KvClient;
use crate::store::LockInfo;
use crate::store::Op;
use crate::store::PessimisticLockRequest;
use crate::store::PessimisticLockResponse;
use crate::store::PessimisticRollbackRequest;
use crate::store::PessimisticRollbackResponse;
use crate::store::PrewriteRequest;
use crate::store::PrewriteResponse;
use crate::store::RegionError;
use crate::store::TxnHeartBeatRequest;
use crate::store::TxnHeartBeatResponse;
use crate::store::TxnLockNotFound;
use crate::store::WriteConflict;
use crate::transaction::LockResolver;
use crate::transaction::ResolvedLocks;
use crate::transaction::RpcKind;
use crate::transaction::Snapshot;
use crate::transaction::LOCK_ALWAYS_WAIT;
use crate::transaction::LOCK_NO_WAIT;
use crate::Key;
use crate::Result;
use crate::Value;

/// How long a pessimistic lock request waits when the client allows waiting indefinitely.
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(1);

/// One RPC as received by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcRecord {
    pub kind: RpcKind,
    pub region: RegionVerId,
    pub keys: Vec<Key>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteKind {
    Put,
    Delete,
    Lock,
    Rollback,
}

#[derive(Clone, Debug)]
struct Write {
    start_ts: u64,
    commit_ts: u64,
    kind: WriteKind,
    value: Value,
}

#[derive(Clone, Debug)]
struct MvccLock {
    primary: Key,
    start_ts: u64,
    for_update_ts: u64,
    ttl: u64,
    op: Op,
    value: Value,
    min_commit_ts: u64,
    txn_size: u64,
    created: Instant,
}

impl MvccLock {
    fn is_pessimistic(&self) -> bool {
        self.op == Op::PessimisticLock
    }

    fn ms_before_expired(&self) -> i64 {
        self.ttl as i64 - self.created.elapsed().as_millis() as i64
    }

    fn info(&self, key: &Key) -> LockInfo {
        LockInfo {
            primary_lock: self.primary.clone(),
            lock_version: self.start_ts,
            key: key.clone(),
            lock_ttl: self.ttl,
            txn_size: self.txn_size,
            lock_type: self.op,
            lock_for_update_ts: self.for_update_ts,
            min_commit_ts: self.min_commit_ts,
        }
    }

    fn write_kind(&self) -> WriteKind {
        match self.op {
            Op::Del => WriteKind::Delete,
            Op::Lock | Op::PessimisticLock => WriteKind::Lock,
            Op::Put | Op::Insert | Op::CheckNotExists => WriteKind::Put,
        }
    }
}

enum TxnStatus {
    Committed(u64),
    RolledBack,
    Locked { ms_before_expired: i64 },
}

enum LockAttempt {
    Failed(KeyError),
    Blocked { key: Key, lock: MvccLock },
}

#[derive(Default)]
struct MvccState {
    locks: BTreeMap<Key, MvccLock>,
    /// Newest commit first.
    writes: BTreeMap<Key, Vec<Write>>,
}

impl MvccState {
    fn push_write(&mut self, key: &Key, write: Write) {
        let writes = self.writes.entry(key.clone()).or_default();
        let pos = writes
            .iter()
            .position(|w| w.commit_ts < write.commit_ts)
            .unwrap_or(writes.len());
        writes.insert(pos, write);
    }

    fn txn_write(&self, key: &Key, start_ts: u64) -> Option<&Write> {
        self.writes
            .get(key)?
            .iter()
            .find(|w| w.start_ts == start_ts)
    }

    fn latest_commit(&self, key: &Key) -> Option<&Write> {
        self.writes
            .get(key)?
            .iter()
            .find(|w| w.kind != WriteKind::Rollback)
    }

    fn value_at(&self, key: &Key, ts: u64) -> Option<Value> {
        for write in self.writes.get(key)?.iter().filter(|w| w.commit_ts <= ts) {
            match write.kind {
                WriteKind::Put => return Some(write.value.clone()),
                WriteKind::Delete => return None,
                WriteKind::Lock | WriteKind::Rollback => {}
            }
        }
        None
    }

    fn own_lock(&self, key: &Key, start_ts: u64) -> Option<&MvccLock> {
        self.locks.get(key).filter(|l| l.start_ts == start_ts)
    }

    /// Returns whether a lock was released.
    fn commit_key(&mut self, key: &Key, start_ts: u64, commit_ts: u64) -> bool {
        let Some(lock) = self.own_lock(key, start_ts).cloned() else {
            return false;
        };
        self.locks.remove(key);
        if !lock.is_pessimistic() {
            self.push_write(
                key,
                Write {
                    start_ts,
                    commit_ts,
                    kind: lock.write_kind(),
                    value: lock.value,
                },
            );
        }
        true
    }

    /// Returns whether a lock was released.
    fn rollback_key(&mut self, key: &Key, start_ts: u64) -> bool {
        let released = self.own_lock(key, start_ts).is_some();
        if released {
            self.locks.remove(key);
        }
        if self.txn_write(key, start_ts).is_none() {
            self.push_write(
                key,
                Write {
                    start_ts,
                    commit_ts: start_ts,
                    kind: WriteKind::Rollback,
                    value: Value::new(),
                },
            );
        }
        released
    }

    fn txn_status(&self, primary: &Key, start_ts: u64) -> TxnStatus {
        match self.txn_write(primary, start_ts) {
            Some(w) if w.kind == WriteKind::Rollback => return TxnStatus::RolledBack,
            Some(w) => return TxnStatus::Committed(w.commit_ts),
            None => {}
        }
        match self.own_lock(primary, start_ts) {
            Some(lock) => TxnStatus::Locked {
                ms_before_expired: lock.ms_before_expired(),
            },
            None => TxnStatus::RolledBack,
        }
    }

    /// Returns whether the mutation writes a lock.
    fn check_prewrite(
        &self,
        req: &PrewriteRequest,
        op: Op,
        key: &Key,
        is_pessimistic_lock: bool,
    ) -> std::result::Result<bool, KeyError> {
        match self.locks.get(key) {
            Some(lock) if lock.start_ts != req.start_version => {
                return Err(KeyError::locked(lock.info(key)))
            }
            Some(lock) if !lock.is_pessimistic() => return Ok(false),
            Some(_) => {}
            None if is_pessimistic_lock => return Err(abort("pessimistic lock not found")),
            None => {}
        }
        match self.txn_write(key, req.start_version) {
            Some(w) if w.kind == WriteKind::Rollback => {
                return Err(abort("transaction already rolled back"))
            }
            Some(_) => return Ok(false),
            None => {}
        }
        if !is_pessimistic_lock {
            if let Some(w) = self.latest_commit(key) {
                if w.commit_ts >= req.start_version {
                    return Err(KeyError {
                        conflict: Some(WriteConflict {
                            start_ts: req.start_version,
                            conflict_ts: w.start_ts,
                            conflict_commit_ts: w.commit_ts,
                            key: key.clone(),
                            primary: req.primary_lock.clone(),
                        }),
                        ..Default::default()
                    });
                }
            }
        }
        if matches!(op, Op::Insert | Op::CheckNotExists) && self.value_at(key, u64::MAX).is_some()
        {
            return Err(already_exist(key));
        }
        Ok(op != Op::CheckNotExists)
    }

    fn try_pessimistic_lock(
        &mut self,
        req: &PessimisticLockRequest,
    ) -> std::result::Result<Vec<Option<Value>>, LockAttempt> {
        for m in &req.mutations {
            if let Some(lock) = self.locks.get(&m.key) {
                if lock.start_ts != req.start_version {
                    return Err(LockAttempt::Blocked {
                        key: m.key.clone(),
                        lock: lock.clone(),
                    });
                }
                continue;
            }
            if self.txn_write(&m.key, req.start_version).is_some() {
                return Err(LockAttempt::Failed(abort("transaction already finished")));
            }
            if let Some(w) = self.latest_commit(&m.key) {
                if w.commit_ts > req.for_update_ts {
                    return Err(LockAttempt::Failed(KeyError {
                        conflict: Some(WriteConflict {
                            start_ts: req.start_version,
                            conflict_ts: w.start_ts,
                            conflict_commit_ts: w.commit_ts,
                            key: m.key.clone(),
                            primary: req.primary_lock.clone(),
                        }),
                        ..Default::default()
                    }));
                }
            }
            if m.assertion == Assertion::NotExist && self.value_at(&m.key, u64::MAX).is_some() {
                return Err(LockAttempt::Failed(already_exist(&m.key)));
            }
        }

        let mut values = Vec::new();
        for m in &req.mutations {
            match self.locks.get_mut(&m.key) {
                Some(lock) => {
                    if lock.is_pessimistic() {
                        lock.for_update_ts = lock.for_update_ts.max(req.for_update_ts);
                    }
                }
                None => {
                    self.locks.insert(
                        m.key.clone(),
                        MvccLock {
                            primary: req.primary_lock.clone(),
                            start_ts: req.start_version,
                            for_update_ts: req.for_update_ts,
                            ttl: req.lock_ttl,
                            op: Op::PessimisticLock,
                            value: Value::new(),
                            min_commit_ts: req.min_commit_ts,
                            txn_size: 0,
                            created: Instant::now(),
                        },
                    );
                }
            }
            if req.return_values {
                values.push(self.value_at(&m.key, u64::MAX));
            }
        }
        Ok(values)
    }
}

fn abort(message: &str) -> KeyError {
    KeyError {
        abort: message.to_owned(),
        ..Default::default()
    }
}

fn already_exist(key: &Key) -> KeyError {
    KeyError {
        already_exist: Some(AlreadyExist { key: key.clone() }),
        ..Default::default()
    }
}

fn lock_not_found(key: &Key, start_ts: u64) -> KeyError {
    KeyError {
        txn_lock_not_found: Some(TxnLockNotFound {
            start_ts,
            key: key.clone(),
        }),
        ..Default::default()
    }
}

/// The mock store. Implements the shard RPCs, snapshot reads and lock resolution.
pub struct MockStore {
    cluster: Arc<MockCluster>,
    state: Mutex<MvccState>,
    released: watch::Sender<u64>,
    detector: DeadlockDetector,
    rpc_log: Mutex<Vec<RpcRecord>>,
}

impl MockStore {
    pub fn new(cluster: Arc<MockCluster>) -> MockStore {
        let (released, _) = watch::channel(0);
        MockStore {
            cluster,
            state: Mutex::new(MvccState::default()),
            released,
            detector: DeadlockDetector::default(),
            rpc_log: Mutex::new(Vec::new()),
        }
    }

    pub fn rpc_log(&self) -> Vec<RpcRecord> {
        self.rpc_log.lock().unwrap().clone()
    }

    pub fn rpc_count(&self, kind: RpcKind) -> usize {
        self.rpc_log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    pub fn clear_rpc_log(&self) {
        self.rpc_log.lock().unwrap().clear();
    }

    /// The lock currently held on `key`, if any.
    pub fn lock_info(&self, key: &Key) -> Option<LockInfo> {
        self.state
            .lock()
            .unwrap()
            .locks
            .get(key)
            .map(|lock| lock.info(key))
    }

    /// Commit `value` for `key` directly, as if a transaction had written it.
    pub fn put_committed(&self, key: impl Into<Key>, value: Value, start_ts: u64, commit_ts: u64) {
        self.state.lock().unwrap().push_write(
            &key.into(),
            Write {
                start_ts,
                commit_ts,
                kind: WriteKind::Put,
                value,
            },
        );
    }

    /// Raise the min commit ts of the lock on `key`, as a concurrent reader would.
    pub fn bump_min_commit_ts(&self, key: &Key, min_commit_ts: u64) {
        if let Some(lock) = self.state.lock().unwrap().locks.get_mut(key) {
            lock.min_commit_ts = lock.min_commit_ts.max(min_commit_ts);
        }
    }

    fn record(&self, kind: RpcKind, region: RegionVerId, keys: &[Key]) -> Option<RegionError> {
        self.rpc_log.lock().unwrap().push(RpcRecord {
            kind,
            region,
            keys: keys.to_vec(),
        });
        self.cluster.check_epoch(region, keys)
    }

    fn notify_released(&self) {
        self.released.send_modify(|v| *v += 1);
    }

    fn resolve_locks(&self, locks: Vec<LockInfo>) -> i64 {
        let mut ms_before_expired = 0;
        let mut released = false;
        {
            let mut state = self.state.lock().unwrap();
            for lock in locks {
                let start_ts = lock.lock_version;
                match state.txn_status(&lock.primary_lock, start_ts) {
                    TxnStatus::Committed(commit_ts) => {
                        released |= state.commit_key(&lock.key, start_ts, commit_ts);
                    }
                    TxnStatus::RolledBack => {
                        state.rollback_key(&lock.primary_lock, start_ts);
                        released |= state.rollback_key(&lock.key, start_ts);
                    }
                    TxnStatus::Locked {
                        ms_before_expired: ms,
                    } if ms > 0 => {
                        ms_before_expired = ms_before_expired.max(ms);
                    }
                    TxnStatus::Locked { .. } => {
                        released |= state.rollback_key(&lock.primary_lock, start_ts);
                        released |= state.rollback_key(&lock.key, start_ts);
                    }
                }
            }
        }
        if released {
            self.notify_released();
        }
        ms_before_expired
    }
}

#[async_trait]
impl KvClient for MockStore {
    async fn prewrite(&self, region: RegionVerId, req: PrewriteRequest) -> Result<PrewriteResponse> {
        let keys: Vec<Key> = req.mutations.iter().map(|m| m.key.clone()).collect();
        if let Some(e) = self.record(RpcKind::Prewrite, region, &keys) {
            return Ok(PrewriteResponse {
                region_error: Some(e),
                ..Default::default()
            });
        }

        let mut state = self.state.lock().unwrap();
        let mut errors = Vec::new();
        let mut to_write = Vec::new();
        for (i, m) in req.mutations.iter().enumerate() {
            let is_pessimistic_lock = req.is_pessimistic_lock.get(i).copied().unwrap_or(false);
            match state.check_prewrite(&req, m.op, &m.key, is_pessimistic_lock) {
                Ok(true) => to_write.push(m),
                Ok(false) => {}
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            return Ok(PrewriteResponse {
                errors,
                ..Default::default()
            });
        }
        for m in to_write {
            let op = match m.op {
                Op::Insert => Op::Put,
                op => op,
            };
            state.locks.insert(
                m.key.clone(),
                MvccLock {
                    primary: req.primary_lock.clone(),
                    start_ts: req.start_version,
                    for_update_ts: req.for_update_ts,
                    ttl: req.lock_ttl,
                    op,
                    value: m.value.clone(),
                    min_commit_ts: req.min_commit_ts,
                    txn_size: req.txn_size,
                    created: Instant::now(),
                },
            );
        }
        Ok(PrewriteResponse::default())
    }

    async fn commit(&self, region: RegionVerId, req: CommitRequest) -> Result<CommitResponse> {
        if let Some(e) = self.record(RpcKind::Commit, region, &req.keys) {
            return Ok(CommitResponse {
                region_error: Some(e),
                ..Default::default()
            });
        }

        {
            let mut state = self.state.lock().unwrap();
            for key in &req.keys {
                let error = match state.own_lock(key, req.start_version) {
                    Some(lock) if !lock.is_pessimistic() => {
                        (req.commit_version < lock.min_commit_ts).then(|| KeyError {
                            commit_ts_expired: Some(CommitTsExpired {
                                start_ts: req.start_version,
                                attempted_commit_ts: req.commit_version,
                                key: key.clone(),
                                min_commit_ts: lock.min_commit_ts,
                            }),
                            ..Default::default()
                        })
                    }
                    _ => match state.txn_write(key, req.start_version) {
                        // Committed before; committing again is a no-op.
                        Some(w) if w.kind != WriteKind::Rollback => None,
                        _ => Some(lock_not_found(key, req.start_version)),
                    },
                };
                if let Some(error) = error {
                    return Ok(CommitResponse {
                        error: Some(error),
                        ..Default::default()
                    });
                }
            }
            for key in &req.keys {
                state.commit_key(key, req.start_version, req.commit_version);
            }
        }
        self.notify_released();
        Ok(CommitResponse::default())
    }

    async fn batch_rollback(
        &self,
        region: RegionVerId,
        req: BatchRollbackRequest,
    ) -> Result<BatchRollbackResponse> {
        if let Some(e) = self.record(RpcKind::BatchRollback, region, &req.keys) {
            return Ok(BatchRollbackResponse {
                region_error: Some(e),
                ..Default::default()
            });
        }
        {
            let mut state = self.state.lock().unwrap();
            let committed = req.keys.iter().any(|key| {
                state
                    .txn_write(key, req.start_version)
                    .is_some_and(|w| w.kind != WriteKind::Rollback)
            });
            if committed {
                return Ok(BatchRollbackResponse {
                    error: Some(abort("transaction already committed")),
                    ..Default::default()
                });
            }
            for key in &req.keys {
                state.rollback_key(key, req.start_version);
            }
        }
        self.notify_released();
        Ok(BatchRollbackResponse::default())
    }

    async fn pessimistic_lock(
        &self,
        region: RegionVerId,
        req: PessimisticLockRequest,
    ) -> Result<PessimisticLockResponse> {
        let keys: Vec<Key> = req.mutations.iter().map(|m| m.key.clone()).collect();
        if let Some(e) = self.record(RpcKind::PessimisticLock, region, &keys) {
            return Ok(PessimisticLockResponse {
                region_error: Some(e),
                ..Default::default()
            });
        }

        let wait = match req.wait_timeout {
            LOCK_NO_WAIT => None,
            LOCK_ALWAYS_WAIT => Some(DEFAULT_LOCK_WAIT),
            ms => Some(Duration::from_millis(ms.max(0) as u64)),
        };
        let deadline = wait.map(|wait| Instant::now() + wait);
        loop {
            let mut released = self.released.subscribe();
            let (key, lock) = match self.state.lock().unwrap().try_pessimistic_lock(&req) {
                Ok(values) => {
                    return Ok(PessimisticLockResponse {
                        values,
                        ..Default::default()
                    })
                }
                Err(LockAttempt::Failed(e)) => {
                    return Ok(PessimisticLockResponse {
                        errors: vec![e],
                        ..Default::default()
                    })
                }
                Err(LockAttempt::Blocked { key, lock }) => (key, lock),
            };
            let locked = PessimisticLockResponse {
                errors: vec![KeyError::locked(lock.info(&key))],
                ..Default::default()
            };
            let Some(deadline) = deadline else {
                return Ok(locked);
            };

            let hash = key_hash(key.as_bytes());
            if let Err(cycle_hash) = self.detector.detect(req.start_version, lock.start_ts, hash) {
                return Ok(PessimisticLockResponse {
                    errors: vec![KeyError {
                        deadlock: Some(Deadlock {
                            lock_ts: lock.start_ts,
                            lock_key: key,
                            deadlock_key_hash: cycle_hash,
                            wait_chain: Vec::new(),
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                });
            }
            let woken = tokio::time::timeout_at(deadline, released.changed())
                .await
                .is_ok();
            self.detector
                .clean_up_wait_for(req.start_version, lock.start_ts, hash);
            if !woken {
                return Ok(locked);
            }
        }
    }

    async fn pessimistic_rollback(
        &self,
        region: RegionVerId,
        req: PessimisticRollbackRequest,
    ) -> Result<PessimisticRollbackResponse> {
        if let Some(e) = self.record(RpcKind::PessimisticRollback, region, &req.keys) {
            return Ok(PessimisticRollbackResponse {
                region_error: Some(e),
                ..Default::default()
            });
        }
        {
            let mut state = self.state.lock().unwrap();
            for key in &req.keys {
                if state
                    .own_lock(key, req.start_version)
                    .is_some_and(MvccLock::is_pessimistic)
                {
                    state.locks.remove(key);
                }
            }
        }
        self.detector.clean_up(req.start_version);
        self.notify_released();
        Ok(PessimisticRollbackResponse::default())
    }

    async fn txn_heart_beat(
        &self,
        region: RegionVerId,
        req: TxnHeartBeatRequest,
    ) -> Result<TxnHeartBeatResponse> {
        if let Some(e) = self.record(
            RpcKind::TxnHeartBeat,
            region,
            std::slice::from_ref(&req.primary_lock),
        ) {
            return Ok(TxnHeartBeatResponse {
                region_error: Some(e),
                ..Default::default()
            });
        }
        let mut state = self.state.lock().unwrap();
        match state.locks.get_mut(&req.primary_lock) {
            Some(lock) if lock.start_ts == req.start_version => {
                lock.ttl = lock.ttl.max(req.advise_lock_ttl);
                Ok(TxnHeartBeatResponse {
                    lock_ttl: lock.ttl,
                    ..Default::default()
                })
            }
            _ => Ok(TxnHeartBeatResponse {
                error: Some(lock_not_found(&req.primary_lock, req.start_version)),
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl Snapshot for MockStore {
    async fn get(&self, key: &Key, version: u64) -> Result<Option<Value>> {
        Ok(self.state.lock().unwrap().value_at(key, version))
    }
}

#[async_trait]
impl LockResolver for MockStore {
    async fn resolve_for_write(&self, _caller_start_ts: u64, locks: Vec<LockInfo>) -> Result<i64> {
        Ok(self.resolve_locks(locks))
    }

    async fn resolve(&self, _caller_start_ts: u64, locks: Vec<LockInfo>) -> Result<ResolvedLocks> {
        Ok(ResolvedLocks {
            ms_before_txn_expired: self.resolve_locks(locks),
            resolved_region: None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::Mutation;

    fn region(store: &MockStore, key: &str) -> RegionVerId {
        store.cluster.locate(&Key::from(key.to_owned())).region
    }

    fn put(key: &str, value: &str) -> Mutation {
        Mutation {
            op: Op::Put,
            key: Key::from(key.to_owned()),
            value: value.as_bytes().to_vec(),
            assertion: Assertion::None,
        }
    }

    fn prewrite_req(start_ts: u64, mutations: Vec<Mutation>) -> PrewriteRequest {
        PrewriteRequest {
            primary_lock: mutations[0].key.clone(),
            is_pessimistic_lock: vec![false; mutations.len()],
            mutations,
            start_version: start_ts,
            lock_ttl: 3000,
            min_commit_ts: start_ts + 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn prewrite_commit_read() {
        let store = MockStore::new(MockCluster::new());
        let r = region(&store, "a");
        let resp = store
            .prewrite(r, prewrite_req(10, vec![put("a", "1")]))
            .await
            .unwrap();
        assert!(resp.errors.is_empty());
        assert_eq!(store.lock_info(&Key::from("a")).unwrap().lock_version, 10);
        assert_eq!(store.get(&Key::from("a"), 20).await.unwrap(), None);

        let commit = CommitRequest {
            start_version: 10,
            keys: vec![Key::from("a")],
            commit_version: 11,
        };
        let resp = store.commit(r, commit.clone()).await.unwrap();
        assert_eq!(resp.error, None);
        // Committing again is harmless.
        let resp = store.commit(r, commit).await.unwrap();
        assert_eq!(resp.error, None);

        assert_eq!(store.get(&Key::from("a"), 10).await.unwrap(), None);
        assert_eq!(store.get(&Key::from("a"), 11).await.unwrap(), Some(b"1".to_vec()));
        assert!(store.lock_info(&Key::from("a")).is_none());
    }

    #[tokio::test]
    async fn prewrite_reports_conflicts_and_locks() {
        let store = MockStore::new(MockCluster::new());
        let r = region(&store, "a");
        store.put_committed("a", b"0".to_vec(), 5, 15);

        let resp = store
            .prewrite(r, prewrite_req(10, vec![put("a", "1")]))
            .await
            .unwrap();
        assert!(resp.errors[0].conflict.is_some());

        store
            .prewrite(r, prewrite_req(20, vec![put("b", "1")]))
            .await
            .unwrap();
        let resp = store
            .prewrite(r, prewrite_req(21, vec![put("b", "2")]))
            .await
            .unwrap();
        assert_eq!(resp.errors[0].locked.as_ref().unwrap().lock_version, 20);
    }

    #[tokio::test]
    async fn commit_below_min_commit_ts_is_rejected() {
        let store = MockStore::new(MockCluster::new());
        let r = region(&store, "a");
        store
            .prewrite(r, prewrite_req(10, vec![put("a", "1")]))
            .await
            .unwrap();
        store.bump_min_commit_ts(&Key::from("a"), 30);
        let resp = store
            .commit(
                r,
                CommitRequest {
                    start_version: 10,
                    keys: vec![Key::from("a")],
                    commit_version: 11,
                },
            )
            .await
            .unwrap();
        let expired = resp.error.unwrap().commit_ts_expired.unwrap();
        assert_eq!(expired.min_commit_ts, 30);
    }

    #[tokio::test]
    async fn stale_epoch_is_a_region_error() {
        let store = MockStore::new(MockCluster::new());
        let stale = region(&store, "z");
        store.cluster.split("m");
        let resp = store
            .prewrite(stale, prewrite_req(10, vec![put("z", "1")]))
            .await
            .unwrap();
        assert!(matches!(resp.region_error, Some(RegionError::EpochNotMatch { .. })));
        assert_eq!(store.rpc_count(RpcKind::Prewrite), 1);
    }

    #[tokio::test]
    async fn expired_locks_are_rolled_back_by_the_resolver() {
        let store = MockStore::new(MockCluster::new());
        let r = region(&store, "a");
        let mut req = prewrite_req(10, vec![put("a", "1")]);
        req.lock_ttl = 0;
        store.prewrite(r, req).await.unwrap();

        let lock = store.lock_info(&Key::from("a")).unwrap();
        assert_eq!(store.resolve_for_write(20, vec![lock]).await.unwrap(), 0);
        assert!(store.lock_info(&Key::from("a")).is_none());

        // The rolled back transaction can no longer commit.
        let resp = store
            .commit(
                r,
                CommitRequest {
                    start_version: 10,
                    keys: vec![Key::from("a")],
                    commit_version: 11,
                },
            )
            .await
            .unwrap();
        assert!(resp.error.unwrap().txn_lock_not_found.is_some());
    }
}

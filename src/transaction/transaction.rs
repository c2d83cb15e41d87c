// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::atomic;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use log::trace;
use log::warn;

use super::buffer::BufferedValue;
use super::buffer::MemBuffer;
use super::committer::CommitDetails;
use super::committer::CommitterShared;
use super::committer::Services;
use super::committer::TwoPhaseCommitter;
use super::key_flags::FlagsOp;
use super::key_flags::KeyFlags;
use super::lock_ctx::LockCtx;
use super::lock_ctx::LockRequest;
use super::lock_ctx::ReturnedValue;
use super::mutations::MutationSet;
use crate::backoffer::Backoffer;
use crate::common::KeyExistsError;
use crate::kv::key_hash;
use crate::store::Op;
use crate::timestamp::get_timestamp_with_retry;
use crate::util::BackgroundTasks;
use crate::Error;
use crate::Key;
use crate::Result;
use crate::Value;

/// How long a statement that lost a deadlock waits before it is retried.
const DEADLOCK_RETRY_DELAY: Duration = Duration::from_millis(5);

/// An undo-able set of actions on the dataset.
///
/// Create a transaction using a [`TransactionClient`](crate::TransactionClient), then run actions
/// (such as `get`, or `put`) on the transaction. Reads are executed immediately, writes are
/// buffered locally. Once complete, `commit` the transaction. Behind the scenes, the client will
/// perform a two phase commit and return success as soon as the writes are guaranteed to be
/// committed (some finalisation may continue in the background after the return, but no data
/// can be lost).
///
/// In a pessimistic transaction every write first takes a pessimistic lock on its key, so
/// conflicts show up at the statement instead of at commit.
///
/// # Examples
/// ```rust,no_run
/// # use tikv_txn::{Result, TransactionClient};
/// # async fn example(client: TransactionClient) -> Result<()> {
/// let mut txn = client.begin_optimistic().await?;
/// let foo = txn.get("foo".to_owned()).await?;
/// txn.put("bar".to_owned(), foo.unwrap_or_default()).await?;
/// txn.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction {
    status: Arc<AtomicU8>,
    start_ts: u64,
    services: Services,
    options: TransactionOptions,
    buffer: MemBuffer,
    /// Keys locked by this transaction, in locking order.
    lock_keys: Vec<Key>,
    committer: TwoPhaseCommitter,
    schema_version: Option<i64>,
}

impl Transaction {
    pub(crate) fn new(start_ts: u64, services: Services, options: TransactionOptions) -> Transaction {
        let shared = Arc::new(CommitterShared::new(
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            BackgroundTasks::default(),
        ));
        let committer = TwoPhaseCommitter::new(
            services.clone(),
            start_ts,
            options.is_pessimistic(),
            Instant::now(),
            shared,
        );
        Transaction {
            status: Arc::new(AtomicU8::new(TransactionStatus::Active as u8)),
            start_ts,
            services,
            options,
            buffer: MemBuffer::default(),
            lock_keys: Vec::new(),
            committer,
            schema_version: None,
        }
    }

    /// The timestamp the transaction reads at.
    pub fn start_timestamp(&self) -> u64 {
        self.start_ts
    }

    /// Create a new 'get' request.
    ///
    /// Writes buffered by this transaction are returned first; other keys are read from the
    /// snapshot at the start timestamp. Returning `Ok(None)` indicates the key does not exist.
    pub async fn get(&mut self, key: impl Into<Key>) -> Result<Option<Value>> {
        trace!("invoking transactional get request");
        self.check_allow_operation()?;
        let key = key.into();
        match self.buffer.get(&key) {
            BufferedValue::Value(value) => Ok(Some(value)),
            BufferedValue::Deleted => Ok(None),
            BufferedValue::NotBuffered => self.services.snapshot.get(&key, self.start_ts).await,
        }
    }

    /// Read several keys, returning the pairs that exist ordered by key.
    pub async fn batch_get(
        &mut self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<Vec<(Key, Value)>> {
        trace!("invoking transactional batch_get request");
        self.check_allow_operation()?;
        let mut pairs = Vec::new();
        let mut missing = Vec::new();
        for key in keys.into_iter().map(Into::into) {
            match self.buffer.get(&key) {
                BufferedValue::Value(value) => pairs.push((key, value)),
                BufferedValue::Deleted => {}
                BufferedValue::NotBuffered => missing.push(key),
            }
        }
        if !missing.is_empty() {
            pairs.extend(
                self.services
                    .snapshot
                    .batch_get(&missing, self.start_ts)
                    .await?,
            );
        }
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(pairs)
    }

    /// Lock `key` and read its latest committed value.
    ///
    /// Only valid in pessimistic transactions.
    pub async fn get_for_update(&mut self, key: impl Into<Key>) -> Result<Option<Value>> {
        debug!("invoking transactional get_for_update request");
        self.check_allow_operation()?;
        if !self.is_pessimistic() {
            return Err(Error::InvalidTransactionType);
        }
        let key = key.into();
        let for_update_ts = self.current_timestamp().await?;
        let mut lock_ctx = LockCtx::new(for_update_ts).with_return_values();
        self.lock_keys_with_ctx(&mut lock_ctx, vec![key.clone()])
            .await?;
        if self.buffer.has_write(&key) {
            return self.get(key).await;
        }
        match lock_ctx.values.remove(&key) {
            Some(ReturnedValue {
                value,
                already_locked: false,
            }) => Ok(value),
            _ => self.get(key).await,
        }
    }

    /// Buffer a write of `value` to `key`.
    ///
    /// An empty value deletes the key.
    pub async fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        trace!("invoking transactional put request");
        self.check_allow_operation()?;
        let key = key.into();
        if self.is_pessimistic() {
            self.pessimistic_lock(vec![key.clone()], false).await?;
        }
        self.buffer.put(key, value.into());
        Ok(())
    }

    /// Buffer a write of `value` to `key`, failing if the key already exists.
    ///
    /// In an optimistic transaction existence is checked by the prewrite. A pessimistic
    /// transaction checks it while locking the key.
    pub async fn insert(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        debug!("invoking transactional insert request");
        self.check_allow_operation()?;
        let key = key.into();
        match self.buffer.get(&key) {
            BufferedValue::Value(_) => return Err(Error::DuplicateKeyInsertion),
            // Deleted by us, so it does not exist any more.
            BufferedValue::Deleted => {
                if self.is_pessimistic() {
                    self.pessimistic_lock(vec![key.clone()], false).await?;
                }
                self.buffer.put(key, value.into());
                return Ok(());
            }
            BufferedValue::NotBuffered => {}
        }
        if self.is_pessimistic() {
            self.buffer
                .update_flags(key.clone(), FlagsOp::SetPresumeKeyNotExists);
            self.pessimistic_lock(vec![key.clone()], true).await?;
        }
        self.buffer.insert(key, value.into());
        Ok(())
    }

    /// Buffer a deletion of `key`.
    pub async fn delete(&mut self, key: impl Into<Key>) -> Result<()> {
        trace!("invoking transactional delete request");
        self.check_allow_operation()?;
        let key = key.into();
        if self.is_pessimistic() {
            self.pessimistic_lock(vec![key.clone()], false).await?;
        }
        self.buffer.delete(key);
        Ok(())
    }

    /// Lock `keys` so no other transaction can write them before this one ends.
    ///
    /// A pessimistic transaction locks them on the store right away, with a fresh
    /// `for_update_ts`. An optimistic transaction only remembers them and locks them during
    /// prewrite.
    pub async fn lock_keys(&mut self, keys: impl IntoIterator<Item = impl Into<Key>>) -> Result<()> {
        debug!("invoking transactional lock_keys request");
        self.check_allow_operation()?;
        let for_update_ts = if self.is_pessimistic() {
            self.current_timestamp().await?
        } else {
            0
        };
        let mut lock_ctx = LockCtx::new(for_update_ts);
        self.lock_keys_with_ctx(&mut lock_ctx, keys).await
    }

    /// Lock `keys` as described by `lock_ctx`, recording what the store returned into it.
    ///
    /// Keys this transaction already locked are skipped. If locking fails, the keys of this call
    /// are unlocked again in the background. On a retryable deadlock that unlock is awaited
    /// before returning, so the statement can be retried right away.
    pub async fn lock_keys_with_ctx(
        &mut self,
        lock_ctx: &mut LockCtx,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<()> {
        self.check_allow_operation()?;
        let start = Instant::now();

        let mut keys_to_lock = Vec::new();
        for key in keys.into_iter().map(Into::into) {
            let flags = self.buffer.flags(&key);
            if flags.has_locked() {
                if lock_ctx.check_key_exists.contains(&key) && flags.has_locked_value_exists() {
                    return Err(Error::KeyExists(KeyExistsError { key: key.into() }));
                }
                if lock_ctx.return_values {
                    // The value has to be read some other way.
                    lock_ctx.values.insert(
                        key,
                        ReturnedValue {
                            value: None,
                            already_locked: true,
                        },
                    );
                }
                continue;
            }
            keys_to_lock.push(key);
        }
        keys_to_lock.sort();
        keys_to_lock.dedup();
        if keys_to_lock.is_empty() {
            return Ok(());
        }

        if self.is_pessimistic() && lock_ctx.for_update_ts > 0 {
            self.acquire_pessimistic_locks(lock_ctx, &keys_to_lock)
                .await?;
        }

        for key in keys_to_lock {
            let value_exists = lock_ctx
                .values
                .get(&key)
                .map_or(true, |returned| returned.value.is_some());
            self.buffer
                .update_flags(key.clone(), FlagsOp::SetLocked { value_exists });
            self.lock_keys.push(key);
        }
        if lock_ctx.pessimistic_lock_waited {
            lock_ctx.lock_keys_duration = start.elapsed();
        }
        Ok(())
    }

    async fn acquire_pessimistic_locks(&mut self, lock_ctx: &mut LockCtx, keys: &[Key]) -> Result<()> {
        let assigned_primary = self.committer.primary_key().is_none();
        if assigned_primary {
            self.committer.set_primary_key(Some(keys[0].clone()));
        }
        self.committer.set_for_update_ts(lock_ctx.for_update_ts);
        self.committer
            .set_is_first_lock(self.lock_keys.is_empty() && keys.len() == 1);
        self.committer.set_lock_wait_time(lock_ctx.lock_wait_time);

        let mut mutations = MutationSet::with_capacity(keys.len());
        for key in keys {
            let op = if self.buffer.flags(key).has_presume_key_not_exists() {
                Op::Insert
            } else {
                Op::Lock
            };
            mutations.push(op, key.clone(), Value::new(), true);
        }
        let lock = Arc::new(LockRequest::new(lock_ctx));
        let mut bo = Backoffer::new(self.services.config.backoff.pessimistic_lock_ms);
        let res = self
            .committer
            .pessimistic_lock_mutations(&mut bo, &lock, mutations)
            .await;
        lock.finish(lock_ctx);
        self.committer
            .shared()
            .killed
            .store(false, atomic::Ordering::Release);

        let mut err = match res {
            Ok(()) => {
                if assigned_primary {
                    self.committer.run_ttl_manager();
                }
                return Ok(());
            }
            Err(e) => e,
        };

        for key in keys {
            self.buffer
                .update_flags(key.clone(), FlagsOp::DelPresumeKeyNotExists);
        }
        // A single key failing on a conflict or an existence check was never locked.
        let needs_rollback = keys.len() > 1 || !(err.is_write_conflict() || err.is_key_exists());
        let rollback = needs_rollback.then(|| self.committer.spawn_pessimistic_rollback(keys.to_vec()));
        if let Error::Deadlock(deadlock) = &mut err {
            let hash = deadlock.deadlock_key_hash;
            deadlock.is_retryable = keys
                .iter()
                .chain(&self.lock_keys)
                .any(|key| key_hash(key.as_bytes()) == hash);
        }
        match rollback {
            Some(handle) if err.retryable_deadlock().is_some() => {
                info!(
                    "deadlock is retryable, wait for the pessimistic rollback, start_ts: {}",
                    self.start_ts
                );
                let _ = handle.await;
                tokio::time::sleep(DEADLOCK_RETRY_DELAY).await;
            }
            Some(handle) => self.committer.shared().background.push(handle),
            None => {}
        }
        if assigned_primary {
            self.committer.set_primary_key(None);
        }
        Err(err)
    }

    async fn pessimistic_lock(&mut self, keys: Vec<Key>, check_exists: bool) -> Result<()> {
        let for_update_ts = self.current_timestamp().await?;
        let mut lock_ctx = LockCtx::new(for_update_ts);
        if check_exists {
            lock_ctx = lock_ctx.with_check_key_exists(keys.clone());
        }
        self.lock_keys_with_ctx(&mut lock_ctx, keys).await
    }

    /// Commit the transaction, returning its commit timestamp.
    ///
    /// Returns `Ok(None)` if there was nothing to write. If the fate of the primary key cannot be
    /// known the error is [`Error::UndeterminedError`]; the transaction may or may not have
    /// committed and must not be treated as rolled back.
    pub async fn commit(&mut self) -> Result<Option<u64>> {
        debug!("committing transaction, start_ts: {}", self.start_ts);
        if !self.transit_status(
            |status| status == TransactionStatus::Active,
            TransactionStatus::StartedCommit,
        ) {
            return Err(Error::OperationAfterCommitError);
        }

        let res = self.commit_inner().await;
        self.committer.close_ttl_manager();
        let commit_ts = res?;
        self.set_status(TransactionStatus::Committed);
        Ok(commit_ts)
    }

    async fn commit_inner(&mut self) -> Result<Option<u64>> {
        if self.is_lock_expired() {
            return Err(Error::LockExpired);
        }
        self.committer.init_keys_and_mutations(&mut self.buffer)?;
        if self.committer.mutations().is_empty() {
            return Ok(None);
        }
        self.committer
            .execute(self.schema_version)
            .await
            .map(Some)
    }

    /// Abandon the transaction, releasing the pessimistic locks it holds.
    ///
    /// Locks left by a failed commit are already being cleaned up in the background.
    pub async fn rollback(&mut self) -> Result<()> {
        debug!("rolling back transaction, start_ts: {}", self.start_ts);
        if !self.transit_status(
            |status| {
                matches!(
                    status,
                    TransactionStatus::StartedRollback
                        | TransactionStatus::Active
                        | TransactionStatus::StartedCommit
                )
            },
            TransactionStatus::StartedRollback,
        ) {
            return Err(Error::OperationAfterCommitError);
        }

        self.committer.close_ttl_manager();
        if self.is_pessimistic() && !self.lock_keys.is_empty() {
            let mut bo = Backoffer::new(self.services.config.backoff.pessimistic_rollback_ms);
            self.committer
                .pessimistic_rollback_keys(&mut bo, self.lock_keys.clone())
                .await?;
        }
        self.set_status(TransactionStatus::Rolledback);
        Ok(())
    }

    /// The flag that interrupts a pessimistic lock wait when set.
    ///
    /// It is cleared again after every lock call.
    pub fn killed_flag(&self) -> Arc<AtomicBool> {
        self.committer.shared().killed.clone()
    }

    /// Whether the TTL manager gave up keeping the pessimistic locks alive.
    pub fn is_lock_expired(&self) -> bool {
        self.committer
            .shared()
            .lock_expired
            .load(atomic::Ordering::Acquire)
    }

    /// Check the schema against `version` before committing.
    pub fn set_schema_version(&mut self, version: i64) {
        self.schema_version = Some(version);
    }

    pub fn commit_details(&self) -> CommitDetails {
        self.committer.shared().details()
    }

    pub fn key_flags(&self, key: impl Into<Key>) -> KeyFlags {
        self.buffer.flags(&key.into())
    }

    /// Wait for the secondary commits and rollbacks still running in the background.
    ///
    /// This includes the lock heartbeat, which only stops once the transaction is committed or
    /// rolled back.
    pub async fn wait_background_tasks(&self) {
        self.committer.shared().background.wait().await;
    }

    async fn current_timestamp(&self) -> Result<u64> {
        let mut bo = Backoffer::new(self.services.config.backoff.tso_ms);
        get_timestamp_with_retry(self.services.oracle.as_ref(), &mut bo).await
    }

    /// Checks if the transaction can perform arbitrary operations.
    fn check_allow_operation(&self) -> Result<()> {
        match self.get_status() {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Committed
            | TransactionStatus::Rolledback
            | TransactionStatus::StartedCommit
            | TransactionStatus::StartedRollback
            | TransactionStatus::Dropped => Err(Error::OperationAfterCommitError),
        }
    }

    fn is_pessimistic(&self) -> bool {
        self.options.is_pessimistic()
    }

    fn get_status(&self) -> TransactionStatus {
        self.status.load(atomic::Ordering::Acquire).into()
    }

    fn set_status(&self, status: TransactionStatus) {
        self.status.store(status as u8, atomic::Ordering::Release);
    }

    fn transit_status<F>(&self, check_status: F, next: TransactionStatus) -> bool
    where
        F: Fn(TransactionStatus) -> bool,
    {
        let mut current = self.get_status();
        while check_status(current) {
            if current == next {
                return true;
            }
            match self.status.compare_exchange_weak(
                current as u8,
                next as u8,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(x) => current = x.into(),
            }
        }
        false
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        debug!("dropping transaction");
        self.committer.close_ttl_manager();
        if std::thread::panicking() {
            return;
        }
        if self.get_status() == TransactionStatus::Active {
            match self.options.check_level {
                CheckLevel::Panic => {
                    panic!("Dropping an active transaction. Consider commit or rollback it.")
                }
                CheckLevel::Warn => {
                    warn!("Dropping an active transaction. Consider commit or rollback it.")
                }

                CheckLevel::None => {}
            }
        }
        self.set_status(TransactionStatus::Dropped);
    }
}

/// Optimistic or pessimistic transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransactionKind {
    Optimistic,
    Pessimistic,
}

/// Options for configuring a transaction.
///
/// `TransactionOptions` has a builder-style API.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TransactionOptions {
    /// Optimistic or pessimistic (default) transaction.
    kind: TransactionKind,
    /// What to do if the transaction is dropped without an attempt to commit or rollback.
    check_level: CheckLevel,
}

impl Default for TransactionOptions {
    fn default() -> TransactionOptions {
        Self::new_pessimistic()
    }
}

impl TransactionOptions {
    /// Default options for an optimistic transaction.
    pub fn new_optimistic() -> TransactionOptions {
        TransactionOptions {
            kind: TransactionKind::Optimistic,
            check_level: CheckLevel::Panic,
        }
    }

    /// Default options for a pessimistic transaction.
    pub fn new_pessimistic() -> TransactionOptions {
        TransactionOptions {
            kind: TransactionKind::Pessimistic,
            check_level: CheckLevel::Panic,
        }
    }

    /// Set the behavior when dropping a transaction without an attempt to commit or rollback it.
    #[must_use]
    pub fn drop_check(mut self, level: CheckLevel) -> TransactionOptions {
        self.check_level = level;
        self
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    // Returns true if these options describe a pessimistic transaction.
    pub fn is_pessimistic(&self) -> bool {
        self.kind == TransactionKind::Pessimistic
    }
}

/// Determines what happens when a transaction is dropped without being rolled back or committed.
///
/// The default is to panic.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum CheckLevel {
    /// The program will panic.
    ///
    /// Note that if the thread is already panicking, then we will not double-panic and abort, but
    /// just ignore the issue.
    Panic,
    /// Log a warning.
    Warn,
    /// Do nothing
    None,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[repr(u8)]
enum TransactionStatus {
    /// The transaction have not been committed or rolled back.
    Active = 0,
    /// The transaction has committed.
    Committed = 1,
    /// The transaction has tried to commit. Only `rollback` is allowed.
    StartedCommit = 2,
    /// The transaction has rolled back.
    Rolledback = 3,
    /// The transaction has tried to rollback. Only `rollback` is allowed.
    StartedRollback = 4,
    /// The transaction has been dropped.
    Dropped = 5,
}

impl From<u8> for TransactionStatus {
    fn from(num: u8) -> Self {
        match num {
            0 => TransactionStatus::Active,
            1 => TransactionStatus::Committed,
            2 => TransactionStatus::StartedCommit,
            3 => TransactionStatus::Rolledback,
            4 => TransactionStatus::StartedRollback,
            _ => TransactionStatus::Dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;
    use std::time::Instant;

    use async_trait::async_trait;

    use crate::backoffer::BackoffErrorKind;
    use crate::kv::key_hash;
    use crate::mock::MockCluster;
    use crate::mock::MockEnv;
    use crate::mock::MockOracle;
    use crate::mock::MockStore;
    use crate::region::RegionVerId;
    use crate::store::Op;
    use crate::store::RegionError;
    use crate::timestamp::MAX_COMMIT_TS_SKEW;
    use crate::transaction::CheckLevel;
    use crate::transaction::FaultAction;
    use crate::transaction::FaultHooks;
    use crate::transaction::LockCtx;
    use crate::transaction::MutationSet;
    use crate::transaction::RelatedSchemaChange;
    use crate::transaction::RpcKind;
    use crate::transaction::SchemaAmender;
    use crate::transaction::SchemaChecker;
    use crate::transaction::Snapshot;
    use crate::transaction::LOCK_ALWAYS_WAIT;
    use crate::transaction::LOCK_NO_WAIT;
    use crate::BackoffBudget;
    use crate::Error;
    use crate::Key;
    use crate::Result;
    use crate::TransactionOptions;
    use crate::TxnConfig;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    async fn read(store: &MockStore, key: &'static str, ts: u64) -> Option<Vec<u8>> {
        store.get(&Key::from(key), ts).await.unwrap()
    }

    /// Fails the primary commit as if the connection broke after sending it.
    struct FailPrimaryCommit;

    impl FaultHooks for FailPrimaryCommit {
        fn before_send(
            &self,
            kind: RpcKind,
            _region: RegionVerId,
            is_primary: bool,
            _keys: &[Key],
        ) -> FaultAction {
            if kind == RpcKind::Commit && is_primary {
                FaultAction::TransportError("connection reset by peer".to_owned())
            } else {
                FaultAction::Continue
            }
        }
    }

    /// Fails every secondary commit as if the store were unreachable.
    struct FailSecondaryCommits;

    impl FaultHooks for FailSecondaryCommits {
        fn before_send(
            &self,
            kind: RpcKind,
            _region: RegionVerId,
            is_primary: bool,
            _keys: &[Key],
        ) -> FaultAction {
            if kind == RpcKind::Commit && !is_primary {
                FaultAction::TransportError("store unreachable".to_owned())
            } else {
                FaultAction::Continue
            }
        }
    }

    /// Answers every prewrite with an epoch mismatch naming the region it was sent to.
    struct StaleEpochOnPrewrite;

    impl FaultHooks for StaleEpochOnPrewrite {
        fn before_send(
            &self,
            kind: RpcKind,
            region: RegionVerId,
            _is_primary: bool,
            _keys: &[Key],
        ) -> FaultAction {
            if kind == RpcKind::Prewrite {
                FaultAction::RegionError(RegionError::EpochNotMatch {
                    current_regions: vec![region],
                })
            } else {
                FaultAction::Continue
            }
        }
    }

    /// Splits the cluster at `m` right before the first prewrite is sent.
    struct SplitOnFirstPrewrite {
        cluster: Arc<MockCluster>,
        done: Mutex<bool>,
    }

    impl FaultHooks for SplitOnFirstPrewrite {
        fn before_send(
            &self,
            kind: RpcKind,
            _region: RegionVerId,
            _is_primary: bool,
            _keys: &[Key],
        ) -> FaultAction {
            let mut done = self.done.lock().unwrap();
            if kind == RpcKind::Prewrite && !*done {
                *done = true;
                self.cluster.split("m");
            }
            FaultAction::Continue
        }
    }

    /// Pushes the primary's min commit ts past the commit ts, once.
    struct BumpMinCommitTs {
        store: Arc<MockStore>,
        by: u64,
        done: Mutex<bool>,
    }

    impl FaultHooks for BumpMinCommitTs {
        fn before_commit_primary(&self, _start_ts: u64, commit_ts: u64) -> Option<Duration> {
            let mut done = self.done.lock().unwrap();
            if !*done {
                *done = true;
                self.store
                    .bump_min_commit_ts(&Key::from("a"), commit_ts + self.by);
            }
            None
        }
    }

    #[tokio::test]
    async fn simple_transaction() {
        let env = MockEnv::new(MockCluster::new(), MockOracle::with_counter(100));
        let client = env.client();
        let mut txn = client.begin_optimistic().await.unwrap();
        assert_eq!(txn.start_timestamp(), 100);
        txn.put("a", "1").await.unwrap();
        assert_eq!(txn.commit().await.unwrap(), Some(101));
        assert!(txn.committer.shared().is_committed());
        assert_eq!(read(&env.store, "a", 102).await, Some(b"1".to_vec()));
        assert_eq!(read(&env.store, "a", 100).await, None);

        let details = txn.commit_details();
        assert_eq!(details.write_keys, 1);
        assert_eq!(details.write_size, 2);
        assert_eq!(details.prewrite_region_num, 1);
    }

    #[tokio::test]
    async fn reads_see_own_writes() {
        let env = MockEnv::single_region();
        env.store.put_committed("a", b"old".to_vec(), 1, 2);
        env.store.put_committed("b", b"old".to_vec(), 1, 2);
        let client = env.client();
        let mut txn = client.begin_optimistic().await.unwrap();

        assert_eq!(txn.get("a").await.unwrap(), Some(b"old".to_vec()));
        txn.put("a", "new").await.unwrap();
        txn.delete("b").await.unwrap();
        txn.put("c", "3").await.unwrap();
        assert_eq!(txn.get("a").await.unwrap(), Some(b"new".to_vec()));
        assert_eq!(txn.get("b").await.unwrap(), None);

        let pairs = txn.batch_get(["c", "b", "a", "d"]).await.unwrap();
        assert_eq!(
            pairs,
            vec![(Key::from("a"), b"new".to_vec()), (Key::from("c"), b"3".to_vec())]
        );
        txn.rollback().await.unwrap();
        assert!(env.store.rpc_log().is_empty());
    }

    #[tokio::test]
    async fn operations_after_commit_fail() {
        let env = MockEnv::single_region();
        let client = env.client();
        let mut txn = client.begin_optimistic().await.unwrap();
        assert_eq!(txn.commit().await.unwrap(), None);
        assert!(matches!(
            txn.put("a", "1").await,
            Err(Error::OperationAfterCommitError)
        ));
        assert!(matches!(
            txn.commit().await,
            Err(Error::OperationAfterCommitError)
        ));
        assert!(matches!(
            txn.rollback().await,
            Err(Error::OperationAfterCommitError)
        ));
    }

    #[tokio::test]
    async fn writes_across_regions_commit_together() {
        let env = MockEnv::new(MockCluster::with_splits(["h", "p"]), MockOracle::new());
        let client = env.client();
        let mut txn = client.begin_optimistic().await.unwrap();
        for key in ["a", "i", "q", "z"] {
            txn.put(key, key).await.unwrap();
        }
        let commit_ts = txn.commit().await.unwrap().unwrap();
        txn.wait_background_tasks().await;

        for key in ["a", "i", "q", "z"] {
            assert_eq!(read(&env.store, key, commit_ts).await, Some(key.as_bytes().to_vec()));
            assert_eq!(read(&env.store, key, commit_ts - 1).await, None);
        }
        assert_eq!(txn.commit_details().prewrite_region_num, 3);
    }

    #[tokio::test]
    async fn primary_batch_goes_first() {
        let env = MockEnv::new(MockCluster::with_splits(["m"]), MockOracle::new());
        let client = env.client();
        let mut txn = client.begin_optimistic().await.unwrap();
        for key in ["a", "b", "x", "y"] {
            txn.put(key, "v").await.unwrap();
        }
        txn.commit().await.unwrap();
        txn.wait_background_tasks().await;

        let log = env.store.rpc_log();
        for kind in [RpcKind::Prewrite, RpcKind::Commit] {
            let batches: Vec<_> = log.iter().filter(|r| r.kind == kind).collect();
            assert_eq!(batches.len(), 2, "{:?}", kind);
            assert!(batches[0].keys.contains(&Key::from("a")));
            assert!(!batches[1].keys.contains(&Key::from("a")));
        }
        // Every prewrite happens before any commit.
        let last_prewrite = log.iter().rposition(|r| r.kind == RpcKind::Prewrite);
        let first_commit = log.iter().position(|r| r.kind == RpcKind::Commit);
        assert!(last_prewrite < first_commit);
    }

    #[tokio::test]
    async fn committing_a_secondary_again_is_harmless() {
        let env = MockEnv::new(MockCluster::with_splits(["m"]), MockOracle::new());
        let client = env.client();
        let mut txn = client.begin_optimistic().await.unwrap();
        txn.put("a", "1").await.unwrap();
        txn.put("x", "2").await.unwrap();
        let commit_ts = txn.commit().await.unwrap().unwrap();
        txn.wait_background_tasks().await;

        let secondary = env.cluster.locate(&Key::from("x")).region;
        let resp = crate::store::KvClient::commit(
            env.store.as_ref(),
            secondary,
            crate::store::CommitRequest {
                start_version: txn.start_timestamp(),
                keys: vec![Key::from("x")],
                commit_version: commit_ts,
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.error, None);
        assert_eq!(read(&env.store, "x", commit_ts).await, Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn primary_commit_transport_failure_is_undetermined() {
        init_logger();
        let env = MockEnv::new(MockCluster::with_splits(["m"]), MockOracle::new());
        let client = env.client().with_fault_hooks(Arc::new(FailPrimaryCommit));
        let mut txn = client.begin_optimistic().await.unwrap();
        txn.put("a", "1").await.unwrap();
        txn.put("x", "2").await.unwrap();

        let err = txn.commit().await.unwrap_err();
        assert!(err.is_undetermined(), "{err}");
        assert!(!txn.committer.shared().is_committed());
        txn.wait_background_tasks().await;
        // Nothing may be rolled back, and nothing became visible.
        assert_eq!(env.store.rpc_count(RpcKind::BatchRollback), 0);
        assert_eq!(read(&env.store, "a", u64::MAX).await, None);
        assert_eq!(read(&env.store, "x", u64::MAX).await, None);
        assert!(env.store.lock_info(&Key::from("x")).is_some());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_transaction_fails_before_any_rpc() {
        let env = MockEnv::single_region();
        let client = env
            .client()
            .with_config(TxnConfig::default().with_size_limits(1024, 16));
        let mut txn = client.begin_optimistic().await.unwrap();
        txn.put("a", "0123456789").await.unwrap();
        txn.put("b", "0123456789").await.unwrap();
        assert!(matches!(
            txn.commit().await,
            Err(Error::TxnTooLarge { size: 22, limit: 16 })
        ));

        let mut txn = client.begin_optimistic().await.unwrap();
        txn.put("a", vec![0; 2048]).await.unwrap();
        assert!(matches!(
            txn.commit().await,
            Err(Error::EntryTooLarge { size: 2049, .. })
        ));
        assert!(env.store.rpc_log().is_empty());
    }

    #[tokio::test]
    async fn optimistic_write_conflict() {
        let env = MockEnv::single_region();
        let client = env.client();
        let mut t1 = client.begin_optimistic().await.unwrap();
        let mut t2 = client.begin_optimistic().await.unwrap();
        t1.put("k", "1").await.unwrap();
        t2.put("k", "2").await.unwrap();
        t2.commit().await.unwrap();

        let err = t1.commit().await.unwrap_err();
        assert!(err.is_write_conflict(), "{err}");
        t1.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn insert_checks_existence() {
        let env = MockEnv::single_region();
        env.store.put_committed("k", b"v".to_vec(), 1, 2);
        let client = env.client();

        let mut txn = client.begin_optimistic().await.unwrap();
        txn.insert("k", "1").await.unwrap();
        assert!(matches!(
            txn.insert("k", "2").await,
            Err(Error::DuplicateKeyInsertion)
        ));
        assert!(txn.commit().await.unwrap_err().is_key_exists());
        txn.rollback().await.unwrap();

        let mut txn = client.begin_pessimistic().await.unwrap();
        assert!(txn.insert("k", "1").await.unwrap_err().is_key_exists());
        assert!(!txn.key_flags("k").has_presume_key_not_exists());
        assert!(env.store.lock_info(&Key::from("k")).is_none());
        txn.insert("fresh", "1").await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(read(&env.store, "fresh", u64::MAX).await, Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn deleted_insert_only_checks_existence() {
        let env = MockEnv::single_region();
        let client = env.client();
        let mut txn = client.begin_optimistic().await.unwrap();
        txn.insert("k", "1").await.unwrap();
        txn.delete("k").await.unwrap();
        txn.put("other", "v").await.unwrap();
        txn.commit().await.unwrap();
        txn.wait_background_tasks().await;

        assert!(txn.key_flags("k").has_prewrite_only());
        let commits: Vec<_> = env
            .store
            .rpc_log()
            .into_iter()
            .filter(|r| r.kind == RpcKind::Commit)
            .collect();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].keys, vec![Key::from("other")]);
        assert!(env.store.lock_info(&Key::from("k")).is_none());
    }

    #[tokio::test]
    async fn pessimistic_writes_lock_first() {
        let env = MockEnv::single_region();
        let client = env.client();
        let mut txn = client.begin_pessimistic().await.unwrap();
        txn.put("b", "1").await.unwrap();
        txn.put("a", "2").await.unwrap();

        let lock = env.store.lock_info(&Key::from("a")).unwrap();
        assert_eq!(lock.lock_type, Op::PessimisticLock);
        // The first locked key is the primary.
        assert_eq!(lock.primary_lock, Key::from("b"));
        assert!(txn.key_flags("a").has_locked());

        txn.commit().await.unwrap();
        assert_eq!(read(&env.store, "a", u64::MAX).await, Some(b"2".to_vec()));
        assert_eq!(read(&env.store, "b", u64::MAX).await, Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn get_for_update_returns_latest_value() {
        let env = MockEnv::new(MockCluster::new(), MockOracle::with_counter(100));
        let client = env.client();
        let mut txn = client.begin_pessimistic().await.unwrap();
        // Committed after the transaction started.
        let start_ts = client.current_timestamp().await.unwrap();
        let commit_ts = client.current_timestamp().await.unwrap();
        env.store
            .put_committed("k", b"new".to_vec(), start_ts, commit_ts);
        assert_eq!(txn.get("k").await.unwrap(), None);
        assert_eq!(txn.get_for_update("k").await.unwrap(), Some(b"new".to_vec()));
        assert!(txn.key_flags("k").has_locked_value_exists());
        txn.rollback().await.unwrap();
        assert!(env.store.lock_info(&Key::from("k")).is_none());

        let mut txn = client.begin_optimistic().await.unwrap();
        assert!(matches!(
            txn.get_for_update("k").await,
            Err(Error::InvalidTransactionType)
        ));
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn no_wait_lock_fails_fast() {
        let env = MockEnv::single_region();
        let client = env.client();
        let mut t1 = client.begin_pessimistic().await.unwrap();
        t1.lock_keys(["k"]).await.unwrap();

        let mut t2 = client.begin_pessimistic().await.unwrap();
        let for_update_ts = client.current_timestamp().await.unwrap();
        let mut ctx = LockCtx::new(for_update_ts).with_lock_wait_time(LOCK_NO_WAIT);
        assert!(matches!(
            t2.lock_keys_with_ctx(&mut ctx, ["k"]).await,
            Err(Error::LockAcquireFailAndNoWaitSet)
        ));
        // The failed call does not keep the primary.
        assert!(t2.committer.primary_key().is_none());

        t1.rollback().await.unwrap();
        t2.lock_keys(["k"]).await.unwrap();
        t2.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn locking_in_opposite_order_reports_a_retryable_deadlock() {
        let env = MockEnv::single_region();
        let client = env.client();
        let mut t1 = client.begin_pessimistic().await.unwrap();
        let mut t2 = client.begin_pessimistic().await.unwrap();
        t1.lock_keys(["a"]).await.unwrap();
        t2.lock_keys(["b"]).await.unwrap();

        let waiter = tokio::spawn(async move {
            let res = t1.lock_keys(["b"]).await;
            (t1, res)
        });
        // Let t1 start waiting for b.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = t2.lock_keys(["a"]).await.unwrap_err();
        let deadlock = err.retryable_deadlock().expect("retryable deadlock");
        assert_eq!(deadlock.deadlock_key_hash, key_hash(b"b"));

        t2.rollback().await.unwrap();
        let (mut t1, res) = waiter.await.unwrap();
        res.unwrap();
        t1.commit().await.unwrap();
    }

    #[tokio::test]
    async fn region_split_during_prewrite_regroups() {
        init_logger();
        let cluster = MockCluster::new();
        let env = MockEnv::new(cluster.clone(), MockOracle::new());
        let client = env.client().with_fault_hooks(Arc::new(SplitOnFirstPrewrite {
            cluster,
            done: Mutex::new(false),
        }));
        let mut txn = client.begin_optimistic().await.unwrap();
        for key in ["a", "m", "z"] {
            txn.put(key, key).await.unwrap();
        }
        let commit_ts = txn.commit().await.unwrap().unwrap();
        txn.wait_background_tasks().await;

        // One rejected prewrite, then one per region.
        assert_eq!(env.store.rpc_count(RpcKind::Prewrite), 3);
        assert_eq!(env.cluster.regions().len(), 2);
        for key in ["a", "m", "z"] {
            assert_eq!(read(&env.store, key, commit_ts).await, Some(key.as_bytes().to_vec()));
        }
    }

    #[tokio::test]
    async fn rejected_commit_ts_is_retried() {
        let env = MockEnv::new(MockCluster::new(), MockOracle::with_counter(100));
        let client = env.client().with_fault_hooks(Arc::new(BumpMinCommitTs {
            store: env.store.clone(),
            by: 3,
            done: Mutex::new(false),
        }));
        let mut txn = client.begin_optimistic().await.unwrap();
        txn.put("a", "1").await.unwrap();
        assert_eq!(txn.commit().await.unwrap(), Some(104));
        assert_eq!(read(&env.store, "a", 104).await, Some(b"1".to_vec()));
        assert_eq!(read(&env.store, "a", 103).await, None);
    }

    #[tokio::test]
    async fn commit_ts_too_far_ahead_is_fatal() {
        let env = MockEnv::new(MockCluster::new(), MockOracle::with_counter(100));
        let client = env.client().with_fault_hooks(Arc::new(BumpMinCommitTs {
            store: env.store.clone(),
            by: MAX_COMMIT_TS_SKEW + 1,
            done: Mutex::new(false),
        }));
        let mut txn = client.begin_optimistic().await.unwrap();
        txn.put("a", "1").await.unwrap();
        assert!(matches!(
            txn.commit().await,
            Err(Error::CommitTsExpired { .. })
        ));
        txn.wait_background_tasks().await;
        assert_eq!(env.store.rpc_count(RpcKind::BatchRollback), 1);
        assert!(env.store.lock_info(&Key::from("a")).is_none());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_stops_at_max_txn_ttl() {
        init_logger();
        let env = MockEnv::single_region();
        let client = env.client().with_config(
            TxnConfig::default()
                .with_managed_lock_ttl(Duration::from_millis(100))
                .with_max_txn_ttl(Duration::from_millis(300)),
        );
        let mut txn = client.begin_pessimistic().await.unwrap();
        txn.lock_keys(["k"]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert!(env.store.rpc_count(RpcKind::TxnHeartBeat) >= 1);
        assert!(txn.is_lock_expired());
        assert!(matches!(txn.commit().await, Err(Error::LockExpired)));
        txn.rollback().await.unwrap();
    }

    struct VersionedSchema {
        amendable: bool,
    }

    #[async_trait]
    impl SchemaChecker for VersionedSchema {
        async fn check_by_version(
            &self,
            _check_ts: u64,
            start_version: i64,
        ) -> Result<Option<RelatedSchemaChange>> {
            Ok((start_version < 2).then(|| RelatedSchemaChange {
                latest_version: 2,
                table_ids: vec![7],
                amendable: self.amendable,
            }))
        }
    }

    /// Adds an index entry for every put.
    struct IndexAmender;

    #[async_trait]
    impl SchemaAmender for IndexAmender {
        async fn amend(
            &self,
            _start_version: i64,
            _change: &RelatedSchemaChange,
            mutations: &MutationSet,
        ) -> Result<MutationSet> {
            let mut added = MutationSet::new();
            for i in 0..mutations.len() {
                if mutations.op(i) == Op::Put {
                    let mut key: Vec<u8> = b"idx_".to_vec();
                    key.extend_from_slice(mutations.key(i).as_bytes());
                    added.push(Op::Put, Key::from(key), mutations.value(i).clone(), true);
                }
            }
            Ok(added)
        }
    }

    #[tokio::test]
    async fn schema_change_is_amended() {
        let env = MockEnv::single_region();
        let client = env
            .client()
            .with_schema_checker(Arc::new(VersionedSchema { amendable: true }))
            .with_schema_amender(Arc::new(IndexAmender));
        let mut txn = client.begin_pessimistic().await.unwrap();
        txn.set_schema_version(1);
        txn.put("row", "v").await.unwrap();
        let commit_ts = txn.commit().await.unwrap().unwrap();
        txn.wait_background_tasks().await;

        assert_eq!(read(&env.store, "row", commit_ts).await, Some(b"v".to_vec()));
        assert_eq!(read(&env.store, "idx_row", commit_ts).await, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn unamendable_schema_change_fails() {
        let env = MockEnv::single_region();
        let client = env
            .client()
            .with_schema_checker(Arc::new(VersionedSchema { amendable: false }));
        let mut txn = client.begin_optimistic().await.unwrap();
        txn.set_schema_version(1);
        txn.put("row", "v").await.unwrap();
        assert!(matches!(
            txn.commit().await,
            Err(Error::SchemaChanged { .. })
        ));
        txn.wait_background_tasks().await;
        assert!(env.store.lock_info(&Key::from("row")).is_none());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn killed_flag_is_reset_after_locking() {
        let env = MockEnv::single_region();
        let client = env.client();
        let mut txn = client.begin_pessimistic().await.unwrap();
        let killed = txn.killed_flag();
        killed.store(true, Ordering::Release);
        txn.lock_keys(["k"]).await.unwrap();
        assert!(!killed.load(Ordering::Acquire));
        txn.rollback().await.unwrap();
    }

    #[test]
    #[should_panic(expected = "Dropping an active transaction")]
    fn dropping_an_active_transaction_panics() {
        let env = MockEnv::single_region();
        let _txn = env
            .client()
            .begin_with_start_timestamp(1, TransactionOptions::new_optimistic());
    }

    #[test]
    fn drop_check_can_be_relaxed() {
        let env = MockEnv::single_region();
        let _txn = env.client().begin_with_start_timestamp(
            1,
            TransactionOptions::new_optimistic().drop_check(CheckLevel::None),
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn endless_epoch_mismatch_ends_with_a_backoff_error() {
        init_logger();
        let env = MockEnv::single_region();
        let client = env
            .client()
            .with_config(TxnConfig::default().with_backoff(BackoffBudget {
                prewrite_ms: 100,
                ..Default::default()
            }))
            .with_fault_hooks(Arc::new(StaleEpochOnPrewrite));
        let mut txn = client.begin_optimistic().await.unwrap();
        txn.put("a", "1").await.unwrap();

        let start = Instant::now();
        let (mut txn, res) = tokio::spawn(async move {
            let res = txn.commit().await;
            (txn, res)
        })
        .await
        .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        match res {
            Err(Error::Backoff(e)) => {
                assert_eq!(e.kind(), Some(BackoffErrorKind::RegionUnavailable))
            }
            other => panic!("unexpected commit result: {:?}", other),
        }
        txn.wait_background_tasks().await;
        assert!(env.store.lock_info(&Key::from("a")).is_none());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn lock_wait_gives_up_after_its_budget() {
        let env = MockEnv::single_region();
        let client = env.client();
        let mut t1 = client.begin_pessimistic().await.unwrap();
        t1.lock_keys(["k"]).await.unwrap();

        let mut t2 = client.begin_pessimistic().await.unwrap();
        let for_update_ts = client.current_timestamp().await.unwrap();
        let mut ctx = LockCtx::new(for_update_ts).with_lock_wait_time(100);
        let start = Instant::now();
        assert!(matches!(
            t2.lock_keys_with_ctx(&mut ctx, ["k"]).await,
            Err(Error::LockWaitTimeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(100));

        t1.rollback().await.unwrap();
        t2.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn killing_a_waiting_lock_interrupts_it() {
        let env = MockEnv::single_region();
        let client = env.client();
        let mut t1 = client.begin_pessimistic().await.unwrap();
        t1.lock_keys(["k"]).await.unwrap();

        let mut t2 = client.begin_pessimistic().await.unwrap();
        let killed = t2.killed_flag();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            killed.store(true, Ordering::Release);
        });
        let for_update_ts = client.current_timestamp().await.unwrap();
        let mut ctx = LockCtx::new(for_update_ts).with_lock_wait_time(LOCK_ALWAYS_WAIT);
        assert!(matches!(
            t2.lock_keys_with_ctx(&mut ctx, ["k"]).await,
            Err(Error::QueryInterrupted)
        ));
        assert_eq!(
            env.store.lock_info(&Key::from("k")).unwrap().lock_version,
            t1.start_timestamp()
        );

        t1.rollback().await.unwrap();
        t2.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn failed_secondary_commit_does_not_fail_the_transaction() {
        init_logger();
        let env = MockEnv::new(MockCluster::with_splits(["m"]), MockOracle::new());
        let client = env
            .client()
            .with_config(TxnConfig::default().with_backoff(BackoffBudget {
                commit_ms: 200,
                ..Default::default()
            }))
            .with_fault_hooks(Arc::new(FailSecondaryCommits));
        let mut txn = client.begin_optimistic().await.unwrap();
        txn.put("a", "1").await.unwrap();
        txn.put("x", "2").await.unwrap();
        let commit_ts = txn.commit().await.unwrap().unwrap();
        txn.wait_background_tasks().await;

        assert_eq!(read(&env.store, "a", commit_ts).await, Some(b"1".to_vec()));
        // Left for readers to resolve through the committed primary.
        let lock = env.store.lock_info(&Key::from("x")).unwrap();
        assert_eq!(lock.lock_version, txn.start_timestamp());
        assert_eq!(lock.primary_lock, Key::from("a"));
    }

    #[tokio::test]
    async fn amend_lock_retries_are_capped() {
        let env = MockEnv::single_region();
        // Newer than any for_update_ts the oracle can hand out.
        env.store
            .put_committed("idx_row", b"other".to_vec(), u64::MAX - 2, u64::MAX - 1);
        let client = env
            .client()
            .with_config(TxnConfig::default().with_pessimistic_lock_max_retry_count(2))
            .with_schema_checker(Arc::new(VersionedSchema { amendable: true }))
            .with_schema_amender(Arc::new(IndexAmender));
        let mut txn = client.begin_pessimistic().await.unwrap();
        txn.set_schema_version(1);
        txn.put("row", "v").await.unwrap();

        let err = txn.commit().await.unwrap_err();
        txn.wait_background_tasks().await;
        assert!(err.is_write_conflict(), "{:?}", err);
        let amend_locks = env
            .store
            .rpc_log()
            .into_iter()
            .filter(|r| {
                r.kind == RpcKind::PessimisticLock && r.keys.contains(&Key::from("idx_row"))
            })
            .count();
        assert_eq!(amend_locks, 2);
        assert!(env.store.lock_info(&Key::from("row")).is_none());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_is_a_background_task() {
        let env = MockEnv::single_region();
        let client = env
            .client()
            .with_config(TxnConfig::default().with_managed_lock_ttl(Duration::from_millis(40)));
        let mut txn = client.begin_pessimistic().await.unwrap();
        txn.lock_keys(["k"]).await.unwrap();
        assert_eq!(txn.committer.shared().background.pending(), 1);

        txn.rollback().await.unwrap();
        txn.wait_background_tasks().await;
        assert_eq!(txn.committer.shared().background.pending(), 0);
        let sent = env.store.rpc_count(RpcKind::TxnHeartBeat);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(env.store.rpc_count(RpcKind::TxnHeartBeat), sent);
    }
}

// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! The two-phase committer: prewrite every mutation, take a commit timestamp, commit the primary
//! and let the secondaries follow.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;
use log::info;
use log::warn;
use tokio::task::JoinHandle;

use super::action::do_action_on_mutations;
use super::action::Action;
use super::action::ActionCtx;
use super::buffer::MemBuffer;
use super::key_flags::FlagsOp;
use super::hooks::FaultHooks;
use super::lock_ctx::LockCtx;
use super::lock_ctx::LockRequest;
use super::lock_resolver::LockResolver;
use super::mutations::MutationSet;
use super::schema::RelatedSchemaChange;
use super::schema::SchemaAmender;
use super::schema::SchemaChecker;
use super::snapshot::Snapshot;
use super::ttl_manager::TtlManager;
use crate::backoffer::Backoffer;
use crate::config::TxnConfig;
use crate::kv::HexRepr;
use crate::region::RegionRouter;
use crate::stats;
use crate::store::KvClient;
use crate::store::Op;
use crate::timestamp::get_timestamp_with_retry;
use crate::timestamp::physical_elapsed;
use crate::timestamp::TimestampOracle;
use crate::util::BackgroundTasks;
use crate::Error;
use crate::Key;
use crate::Result;
use crate::Value;

/// The default TTL of a lock in milliseconds.
const DEFAULT_LOCK_TTL: u64 = 3000;
/// Transactions at least this large get a TTL that grows with their size.
const TTL_SIZE_THRESHOLD: usize = 16 * 1024;
const TTL_FACTOR: f64 = 6000.0;
const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

const BIG_TXN_LOG_KEYS: usize = 10_000;
const BIG_TXN_LOG_SIZE: usize = 4 << 20;

/// The TTL of the locks a transaction writes.
///
/// Large transactions get `TTL_FACTOR * sqrt(size in MiB)` milliseconds, clamped between the
/// default TTL and the managed lock TTL. Time already spent reading is added on top, so a
/// transaction that read for long is not resolved right after its prewrite.
pub(crate) fn txn_lock_ttl(elapsed: Duration, txn_size: usize, config: &TxnConfig) -> u64 {
    let mut lock_ttl = DEFAULT_LOCK_TTL;
    if txn_size >= TTL_SIZE_THRESHOLD {
        let size_mib = txn_size as f64 / BYTES_PER_MIB;
        lock_ttl = ((TTL_FACTOR * size_mib.sqrt()) as u64)
            .min(config.managed_lock_ttl_ms())
            .max(DEFAULT_LOCK_TTL);
    }
    lock_ttl + elapsed.as_millis() as u64
}

/// The collaborators a transaction talks to, shared by every transaction of a client.
#[derive(Clone)]
pub(crate) struct Services {
    pub(crate) kv: Arc<dyn KvClient>,
    pub(crate) router: Arc<dyn RegionRouter>,
    pub(crate) oracle: Arc<dyn TimestampOracle>,
    pub(crate) resolver: Arc<dyn LockResolver>,
    pub(crate) snapshot: Arc<dyn Snapshot>,
    pub(crate) schema_checker: Option<Arc<dyn SchemaChecker>>,
    pub(crate) schema_amender: Option<Arc<dyn SchemaAmender>>,
    pub(crate) hooks: Arc<dyn FaultHooks>,
    pub(crate) config: Arc<TxnConfig>,
}

/// Timings and counters of one commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitDetails {
    pub prewrite_time: Duration,
    pub get_commit_ts_time: Duration,
    pub commit_time: Duration,
    pub commit_backoff_time: Duration,
    pub backoff_types: Vec<&'static str>,
    pub resolve_lock_time: Duration,
    pub prewrite_region_num: usize,
    pub write_keys: usize,
    pub write_size: usize,
}

#[derive(Debug, Default)]
struct CommitState {
    committed: bool,
    /// Set when the primary commit RPC failed in transport.
    undetermined: Option<Error>,
    commit_ts: u64,
}

/// State shared between a committer, its in-flight batches and its background tasks.
pub(crate) struct CommitterShared {
    state: Mutex<CommitState>,
    details: Mutex<CommitDetails>,
    pub(crate) ttl_manager: TtlManager,
    pub(crate) killed: Arc<AtomicBool>,
    pub(crate) lock_expired: Arc<AtomicBool>,
    pub(crate) background: BackgroundTasks,
}

impl CommitterShared {
    pub(crate) fn new(
        killed: Arc<AtomicBool>,
        lock_expired: Arc<AtomicBool>,
        background: BackgroundTasks,
    ) -> Self {
        CommitterShared {
            state: Mutex::new(CommitState::default()),
            details: Mutex::new(CommitDetails::default()),
            ttl_manager: TtlManager::default(),
            killed,
            lock_expired,
            background,
        }
    }

    fn state(&self) -> MutexGuard<'_, CommitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.state().committed
    }

    pub(crate) fn mark_committed(&self) {
        self.state().committed = true;
    }

    pub(crate) fn set_undetermined(&self, err: Error) {
        self.state().undetermined = Some(err);
    }

    fn take_undetermined(&self) -> Option<Error> {
        self.state().undetermined.take()
    }

    pub(crate) fn commit_ts(&self) -> u64 {
        self.state().commit_ts
    }

    pub(crate) fn set_commit_ts(&self, commit_ts: u64) {
        self.state().commit_ts = commit_ts;
    }

    pub(crate) fn update_details(&self, f: impl FnOnce(&mut CommitDetails)) {
        f(&mut self.details.lock().unwrap_or_else(|e| e.into_inner()));
    }

    pub(crate) fn details(&self) -> CommitDetails {
        self.details
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record_backoff(&self, bo: &Backoffer) {
        if bo.total_sleep_ms() > 0 {
            let types: Vec<_> = bo.backoff_types().collect();
            self.update_details(|d| {
                d.commit_backoff_time += Duration::from_millis(bo.total_sleep_ms());
                d.backoff_types.extend(types);
            });
        }
    }
}

/// Drives one attempt to commit a transaction.
///
/// The committer is created for the first pessimistic lock or at commit time, whichever comes
/// first, and lives until the transaction ends.
pub(crate) struct TwoPhaseCommitter {
    services: Services,
    start_ts: u64,
    for_update_ts: u64,
    primary_key: Option<Key>,
    mutations: MutationSet,
    lock_ttl: u64,
    txn_size: usize,
    is_pessimistic: bool,
    is_first_lock: bool,
    /// The lock wait budget of the latest statement, reused when amending.
    lock_wait_time: i64,
    start_instant: Instant,
    shared: Arc<CommitterShared>,
}

impl TwoPhaseCommitter {
    pub(crate) fn new(
        services: Services,
        start_ts: u64,
        is_pessimistic: bool,
        start_instant: Instant,
        shared: Arc<CommitterShared>,
    ) -> Self {
        TwoPhaseCommitter {
            services,
            start_ts,
            for_update_ts: 0,
            primary_key: None,
            mutations: MutationSet::new(),
            lock_ttl: 0,
            txn_size: 0,
            is_pessimistic,
            is_first_lock: false,
            lock_wait_time: 0,
            start_instant,
            shared,
        }
    }

    pub(crate) fn primary_key(&self) -> Option<&Key> {
        self.primary_key.as_ref()
    }

    pub(crate) fn set_primary_key(&mut self, key: Option<Key>) {
        self.primary_key = key;
    }

    pub(crate) fn set_for_update_ts(&mut self, for_update_ts: u64) {
        self.for_update_ts = for_update_ts;
    }

    pub(crate) fn set_is_first_lock(&mut self, is_first_lock: bool) {
        self.is_first_lock = is_first_lock;
    }

    pub(crate) fn set_lock_wait_time(&mut self, lock_wait_time: i64) {
        self.lock_wait_time = lock_wait_time;
    }

    pub(crate) fn mutations(&self) -> &MutationSet {
        &self.mutations
    }

    pub(crate) fn shared(&self) -> &Arc<CommitterShared> {
        &self.shared
    }

    pub(crate) fn action_ctx(&self, commit_ts: u64) -> Arc<ActionCtx> {
        Arc::new(ActionCtx {
            services: self.services.clone(),
            start_ts: self.start_ts,
            for_update_ts: self.for_update_ts,
            commit_ts,
            primary_key: self.primary_key.clone().unwrap_or_default(),
            lock_ttl: self.lock_ttl,
            txn_size: self.txn_size as u64,
            is_pessimistic: self.is_pessimistic,
            is_first_lock: self.is_first_lock,
            start_instant: self.start_instant,
            region_txn_size: Arc::default(),
            shared: self.shared.clone(),
        })
    }

    /// Turn the write buffer into the mutation set, checking size limits before any RPC.
    ///
    /// Keys that only prove non-existence are flagged prewrite-only in the buffer.
    pub(crate) fn init_keys_and_mutations(&mut self, buffer: &mut MemBuffer) -> Result<()> {
        let config = &self.services.config;
        let mut mutations = MutationSet::new();
        let mut size = 0;
        let (mut put_cnt, mut del_cnt, mut lock_cnt) = (0, 0, 0);
        let mut prewrite_only = Vec::new();
        for (key, value, flags) in buffer.iter() {
            let op = match value {
                Some(v) if !v.is_empty() => {
                    put_cnt += 1;
                    if flags.has_presume_key_not_exists() {
                        Op::Insert
                    } else {
                        Op::Put
                    }
                }
                // Deleting an insert of an optimistic transaction still has to prove the key
                // did not exist. Pessimistic locks already proved it.
                Some(_) if !self.is_pessimistic && flags.has_presume_key_not_exists() => {
                    prewrite_only.push(key.clone());
                    Op::CheckNotExists
                }
                Some(_) => {
                    del_cnt += 1;
                    Op::Del
                }
                None if flags.has_locked() => {
                    lock_cnt += 1;
                    Op::Lock
                }
                None => continue,
            };
            let value = value.cloned().unwrap_or_default();
            let entry_size = key.len() + value.len();
            if entry_size > config.txn_entry_size_limit {
                return Err(Error::EntryTooLarge {
                    key: key.clone().into(),
                    size: entry_size,
                    limit: config.txn_entry_size_limit,
                });
            }
            size += entry_size;
            let is_pessimistic_lock = self.is_pessimistic && flags.has_locked();
            mutations.push(op, key.clone(), value, is_pessimistic_lock);
        }
        let check_cnt = prewrite_only.len();
        for key in prewrite_only {
            buffer.update_flags(key, FlagsOp::SetPrewriteOnly);
        }

        if mutations.is_empty() {
            return Ok(());
        }
        if size > config.txn_total_size_limit {
            return Err(Error::TxnTooLarge {
                size,
                limit: config.txn_total_size_limit,
            });
        }
        if mutations.len() > BIG_TXN_LOG_KEYS || size > BIG_TXN_LOG_SIZE {
            info!(
                "[BIG_TXN] start_ts: {}, keys: {}, size: {}, puts: {}, dels: {}, locks: {}, checks: {}",
                self.start_ts,
                mutations.len(),
                size,
                put_cnt,
                del_cnt,
                lock_cnt,
                check_cnt
            );
        }

        if self.primary_key.is_none() {
            self.primary_key = (0..mutations.len())
                .find(|&i| mutations.op(i) != Op::CheckNotExists)
                .or(Some(0))
                .map(|i| mutations.key(i).clone());
        }
        stats::observe_txn_write(mutations.len(), size);
        self.shared.update_details(|d| {
            d.write_keys = mutations.len();
            d.write_size = size;
        });
        self.txn_size = size;
        self.lock_ttl = txn_lock_ttl(self.start_instant.elapsed(), size, config);
        self.mutations = mutations;
        Ok(())
    }

    /// Run the protocol and return the commit timestamp.
    ///
    /// Unless the transaction committed or its outcome is undetermined, the written locks are
    /// rolled back in the background.
    pub(crate) async fn execute(&mut self, schema_version: Option<i64>) -> Result<u64> {
        let res = self.execute_inner(schema_version).await;

        let committed = self.shared.is_committed();
        let undetermined = self.shared.take_undetermined();
        if !committed && undetermined.is_none() {
            self.spawn_cleanup();
        }

        match res {
            Ok(commit_ts) => {
                stats::inc_txn_commit("ok");
                Ok(commit_ts)
            }
            Err(e) => {
                if let Some(cause) = undetermined {
                    error!(
                        "2PC commit result undetermined, start_ts: {}, error: {}, cause: {}",
                        self.start_ts, e, cause
                    );
                    stats::inc_txn_commit("undetermined");
                    return Err(Error::UndeterminedError(Box::new(e)));
                }
                if !committed {
                    debug!("2PC failed, start_ts: {}, error: {}", self.start_ts, e);
                    stats::inc_txn_commit("err");
                    return Err(e);
                }
                debug!(
                    "got some exceptions, but 2PC was still successful, start_ts: {}, error: {}",
                    self.start_ts, e
                );
                stats::inc_txn_commit("ok");
                Ok(self.shared.commit_ts())
            }
        }
    }

    async fn execute_inner(&mut self, schema_version: Option<i64>) -> Result<u64> {
        let config = self.services.config.clone();

        let mut prewrite_bo = Backoffer::new(config.backoff.prewrite_ms);
        let start = Instant::now();
        let res = do_action_on_mutations(
            &self.action_ctx(0),
            &mut prewrite_bo,
            Action::Prewrite,
            self.mutations.clone(),
        )
        .await;
        let elapsed = start.elapsed();
        self.shared.update_details(|d| d.prewrite_time = elapsed);
        self.shared.record_backoff(&prewrite_bo);
        if let Err(e) = res {
            debug!("2PC failed on prewrite, start_ts: {}, error: {}", self.start_ts, e);
            return Err(e);
        }

        let start = Instant::now();
        let commit_ts = self.get_timestamp().await.map_err(|e| {
            warn!("2PC get commit ts failed, start_ts: {}, error: {}", self.start_ts, e);
            e
        })?;
        let elapsed = start.elapsed();
        self.shared.update_details(|d| d.get_commit_ts_time = elapsed);
        if commit_ts <= self.start_ts {
            error!(
                "invalid transaction tso, start_ts: {}, commit_ts: {}",
                self.start_ts, commit_ts
            );
            return Err(Error::InvalidTxnTso {
                start_ts: self.start_ts,
                commit_ts,
            });
        }
        self.shared.set_commit_ts(commit_ts);

        let commit_ts = self.check_schema_valid(commit_ts, schema_version).await?;

        if physical_elapsed(self.start_ts, commit_ts) > config.max_txn_time_use {
            return Err(Error::TxnTakesTooLong {
                start_ts: self.start_ts,
                commit_ts,
            });
        }

        let commit_mutations = self.mutations.without_op(Op::CheckNotExists);
        if commit_mutations.is_empty() {
            // Only existence checks were prewritten; there is nothing to make visible.
            self.shared.mark_committed();
            return Ok(commit_ts);
        }
        let mut commit_bo = Backoffer::new(config.backoff.commit_ms);
        let start = Instant::now();
        let res = do_action_on_mutations(
            &self.action_ctx(commit_ts),
            &mut commit_bo,
            Action::Commit { retry: false },
            commit_mutations,
        )
        .await;
        let elapsed = start.elapsed();
        self.shared.update_details(|d| d.commit_time = elapsed);
        self.shared.record_backoff(&commit_bo);
        res?;
        Ok(self.shared.commit_ts())
    }

    async fn get_timestamp(&self) -> Result<u64> {
        let mut bo = Backoffer::new(self.services.config.backoff.tso_ms);
        get_timestamp_with_retry(self.services.oracle.as_ref(), &mut bo).await
    }

    /// Check the schema did not change between start and `commit_ts`, amending the mutations
    /// when possible. Returns the commit ts to use.
    async fn check_schema_valid(&mut self, commit_ts: u64, schema_version: Option<i64>) -> Result<u64> {
        let (Some(checker), Some(start_version)) =
            (self.services.schema_checker.clone(), schema_version)
        else {
            return Ok(commit_ts);
        };
        let Some(change) = checker.check_by_version(commit_ts, start_version).await? else {
            return Ok(commit_ts);
        };
        if self.is_pessimistic && change.amendable {
            if let Some(amender) = self.services.schema_amender.clone() {
                return self
                    .try_amend(amender.as_ref(), checker.as_ref(), start_version, change)
                    .await;
            }
        }
        Err(schema_changed(start_version, &change))
    }

    async fn try_amend(
        &mut self,
        amender: &dyn SchemaAmender,
        checker: &dyn SchemaChecker,
        start_version: i64,
        change: RelatedSchemaChange,
    ) -> Result<u64> {
        let added = amender.amend(start_version, &change, &self.mutations).await?;
        if !added.is_empty() {
            self.amend_pessimistic_lock(&added).await.map_err(|e| {
                info!("amend pessimistic lock failed, start_ts: {}, error: {}", self.start_ts, e);
                e
            })?;
            let mut bo = Backoffer::new(self.services.config.backoff.prewrite_ms);
            do_action_on_mutations(&self.action_ctx(0), &mut bo, Action::Prewrite, added.clone())
                .await
                .map_err(|e| {
                    warn!("amend prewrite failed, start_ts: {}, error: {}", self.start_ts, e);
                    e
                })?;
            info!(
                "amend prewrite finished, start_ts: {}, keys: {}",
                self.start_ts,
                added.len()
            );
            self.txn_size += added.size();
            self.mutations.merge(added);
        }

        // The amended mutations are only valid if nothing changed again since.
        let commit_ts = self.get_timestamp().await?;
        if let Some(again) = checker
            .check_by_version(commit_ts, change.latest_version)
            .await?
        {
            return Err(schema_changed(change.latest_version, &again));
        }
        self.shared.set_commit_ts(commit_ts);
        Ok(commit_ts)
    }

    /// Lock the amended keys that need a pessimistic lock, refreshing `for_update_ts` on write
    /// conflicts.
    ///
    /// All attempts share one wait budget, started when the amendment starts.
    async fn amend_pessimistic_lock(&mut self, added: &MutationSet) -> Result<()> {
        let mut keys_to_lock = MutationSet::new();
        for i in 0..added.len() {
            if added.is_pessimistic_lock(i) {
                keys_to_lock.push(added.op(i), added.key(i).clone(), added.value(i).clone(), true);
            }
        }
        if keys_to_lock.is_empty() {
            return Ok(());
        }

        let mut lock_ctx =
            LockCtx::new(self.for_update_ts).with_lock_wait_time(self.lock_wait_time);
        let retry_limit = self.services.config.pessimistic_lock_max_retry_count;
        let mut try_times = 0;
        loop {
            let mut bo = Backoffer::new(self.services.config.backoff.pessimistic_lock_ms);
            let lock = Arc::new(LockRequest::new(&lock_ctx));
            match self
                .pessimistic_lock_mutations(&mut bo, &lock, keys_to_lock.clone())
                .await
            {
                Ok(()) => {
                    info!(
                        "amend pessimistic lock finished, start_ts: {}, for_update_ts: {}, keys: {}",
                        self.start_ts,
                        self.for_update_ts,
                        keys_to_lock.len()
                    );
                    return Ok(());
                }
                Err(e) if e.is_write_conflict() => {
                    try_times += 1;
                    if try_times >= retry_limit {
                        warn!(
                            "amend pessimistic lock failed after retry, start_ts: {}, tries: {}",
                            self.start_ts, try_times
                        );
                        return Err(e);
                    }
                    let for_update_ts = self.get_timestamp().await?;
                    info!(
                        "amend pessimistic lock retry, start_ts: {}, tries: {}, for_update_ts: {}",
                        self.start_ts, try_times, for_update_ts
                    );
                    lock_ctx.for_update_ts = for_update_ts;
                    self.for_update_ts = for_update_ts;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) async fn pessimistic_lock_mutations(
        &self,
        bo: &mut Backoffer,
        lock: &Arc<LockRequest>,
        mutations: MutationSet,
    ) -> Result<()> {
        do_action_on_mutations(
            &self.action_ctx(0),
            bo,
            Action::PessimisticLock(lock.clone()),
            mutations,
        )
        .await
    }

    pub(crate) async fn pessimistic_rollback_keys(
        &self,
        bo: &mut Backoffer,
        keys: Vec<Key>,
    ) -> Result<()> {
        do_action_on_mutations(
            &self.action_ctx(0),
            bo,
            Action::PessimisticRollback,
            lock_mutations(keys),
        )
        .await
    }

    /// Release pessimistic locks in the background.
    pub(crate) fn spawn_pessimistic_rollback(&self, keys: Vec<Key>) -> JoinHandle<()> {
        let ctx = self.action_ctx(0);
        let mut bo = Backoffer::new(self.services.config.backoff.pessimistic_rollback_ms);
        let mutations = lock_mutations(keys);
        tokio::spawn(async move {
            if let Err(e) =
                do_action_on_mutations(&ctx, &mut bo, Action::PessimisticRollback, mutations).await
            {
                warn!(
                    "pessimistic rollback failed, start_ts: {}, error: {}",
                    ctx.start_ts, e
                );
            }
        })
    }

    fn spawn_cleanup(&self) {
        if self.mutations.is_empty() {
            return;
        }
        let ctx = self.action_ctx(0);
        let mut bo = Backoffer::new(self.services.config.backoff.cleanup_ms);
        let mutations = self.mutations.clone();
        let handle = tokio::spawn(async move {
            match do_action_on_mutations(&ctx, &mut bo, Action::Cleanup, mutations).await {
                Ok(()) => info!("2PC clean up done, start_ts: {}", ctx.start_ts),
                Err(e) => {
                    stats::inc_secondary_lock_cleanup_failure("rollback");
                    info!(
                        "2PC cleanup failed, start_ts: {}, primary: {}, error: {}",
                        ctx.start_ts,
                        HexRepr(ctx.primary_key.as_bytes()),
                        e
                    );
                }
            }
        });
        self.shared.background.push(handle);
    }

    pub(crate) fn run_ttl_manager(&self) {
        self.shared.ttl_manager.run(self.action_ctx(0));
    }

    pub(crate) fn close_ttl_manager(&self) {
        self.shared.ttl_manager.close();
    }
}

fn lock_mutations(mut keys: Vec<Key>) -> MutationSet {
    keys.sort();
    keys.dedup();
    let mut mutations = MutationSet::with_capacity(keys.len());
    for key in keys {
        mutations.push(Op::Lock, key, Value::new(), true);
    }
    mutations
}

fn schema_changed(start_version: i64, change: &RelatedSchemaChange) -> Error {
    Error::SchemaChanged {
        message: format!(
            "schema version changed from {} to {}, related tables: {:?}",
            start_version, change.latest_version, change.table_ids
        ),
    }
}

// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! The per-batch actions of the commit protocol and the machinery that fans them out over
//! regions.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use log::debug;
use log::error;
use log::info;
use log::warn;

use super::batch_executor::BatchExecutor;
use super::committer::CommitterShared;
use super::committer::Services;
use super::hooks::FaultAction;
use super::hooks::RpcKind;
use super::lock_ctx::LockRequest;
use super::lock_ctx::LOCK_ALWAYS_WAIT;
use super::lock_ctx::LOCK_NO_WAIT;
use super::mutations::key_size;
use super::mutations::key_value_size;
use super::mutations::BatchBuilder;
use super::mutations::BatchMutations;
use super::mutations::GroupedMutations;
use super::mutations::MutationSet;
use crate::backoffer::may_backoff_for_region_error;
use crate::backoffer::Backoffer;
use crate::backoffer::BO_STORE_RPC;
use crate::backoffer::BO_TXN_LOCK_FAST;
use crate::kv::HexRepr;
use crate::region::RegionId;
use crate::region::RegionVerId;
use crate::stats;
use crate::store::Assertion;
use crate::store::BatchRollbackRequest;
use crate::store::CommitRequest;
use crate::store::Mutation;
use crate::store::Op;
use crate::store::PessimisticLockRequest;
use crate::store::PessimisticRollbackRequest;
use crate::store::PrewriteRequest;
use crate::store::RegionError;
use crate::store::SetRegionError;
use crate::timestamp::get_timestamp_with_retry;
use crate::timestamp::MAX_COMMIT_TS_SKEW;
use crate::Error;
use crate::Key;
use crate::Result;
use crate::Value;

/// One step of the protocol, applied batch by batch.
#[derive(Clone, Debug)]
pub(crate) enum Action {
    Prewrite,
    /// `retry` is set when re-committing after a region error or a rejected commit ts.
    Commit {
        retry: bool,
    },
    Cleanup,
    PessimisticLock(Arc<LockRequest>),
    PessimisticRollback,
}

impl Action {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Action::Prewrite => "prewrite",
            Action::Commit { .. } => "commit",
            Action::Cleanup => "cleanup",
            Action::PessimisticLock(_) => "pessimistic_lock",
            Action::PessimisticRollback => "pessimistic_rollback",
        }
    }

    fn size_fn(&self) -> fn(&Key, &Value) -> usize {
        match self {
            Action::Prewrite => key_value_size,
            _ => key_size,
        }
    }

    /// Whether the primary batch has to finish before the others start.
    fn primary_first(&self) -> bool {
        !matches!(self, Action::PessimisticRollback)
    }

    pub(crate) fn records_details(&self) -> bool {
        matches!(
            self,
            Action::Prewrite | Action::Commit { .. } | Action::Cleanup
        )
    }
}

/// Everything a batch needs to build and send its request.
///
/// A context is immutable once batches fan out. Phases that change a timestamp derive a new one.
#[derive(Clone)]
pub(crate) struct ActionCtx {
    pub(crate) services: Services,
    pub(crate) start_ts: u64,
    pub(crate) for_update_ts: u64,
    pub(crate) commit_ts: u64,
    pub(crate) primary_key: Key,
    pub(crate) lock_ttl: u64,
    pub(crate) txn_size: u64,
    pub(crate) is_pessimistic: bool,
    pub(crate) is_first_lock: bool,
    pub(crate) start_instant: Instant,
    pub(crate) region_txn_size: Arc<HashMap<RegionId, u64>>,
    pub(crate) shared: Arc<CommitterShared>,
}

impl ActionCtx {
    fn with_commit_ts(&self, commit_ts: u64) -> Arc<ActionCtx> {
        let mut ctx = self.clone();
        ctx.commit_ts = commit_ts;
        Arc::new(ctx)
    }

    /// This context, or a copy carrying the commit ts a rejected commit moved on to.
    fn refreshed(self: &Arc<Self>) -> Arc<ActionCtx> {
        let commit_ts = self.shared.commit_ts();
        if commit_ts != 0 && commit_ts != self.commit_ts {
            self.with_commit_ts(commit_ts)
        } else {
            self.clone()
        }
    }

    fn min_commit_ts(&self) -> u64 {
        self.start_ts.max(self.for_update_ts) + 1
    }
}

/// Apply `action` to `mutations`, regrouping them by their current regions.
pub(crate) async fn do_action_on_mutations(
    ctx: &Arc<ActionCtx>,
    bo: &mut Backoffer,
    action: Action,
    mutations: MutationSet,
) -> Result<()> {
    if mutations.is_empty() {
        return Ok(());
    }
    let groups = group_mutations(ctx, &mutations).await?;
    do_action_on_groups(ctx, bo, action, groups).await
}

async fn group_mutations(ctx: &ActionCtx, mutations: &MutationSet) -> Result<Vec<GroupedMutations>> {
    let router = ctx.services.router.as_ref();
    let groups = mutations.group_by_region(router).await?;

    let threshold = ctx.services.config.pre_split_detect_threshold;
    let mut did_pre_split = false;
    for group in &groups {
        if group.mutations.len() >= threshold {
            info!(
                "2PC detect large amount of mutations on a single region, region: {:?}, mutations: {}, start_ts: {}",
                group.region,
                group.mutations.len(),
                ctx.start_ts
            );
            if pre_split_region(ctx, group).await {
                did_pre_split = true;
            }
        }
    }
    if did_pre_split {
        return mutations.group_by_region(router).await;
    }
    Ok(groups)
}

/// Split a region about to receive too many mutations. Failures only cost the optimization.
async fn pre_split_region(ctx: &ActionCtx, group: &GroupedMutations) -> bool {
    let limit = ctx.services.config.pre_split_size_threshold;
    let mut split_keys = Vec::new();
    let mut size = 0;
    for i in 0..group.mutations.len() {
        size += key_value_size(group.mutations.key(i), group.mutations.value(i));
        if size >= limit {
            split_keys.push(group.mutations.key(i).clone());
            size = 0;
        }
    }
    if split_keys.is_empty() {
        return false;
    }
    info!(
        "2PC pre-split region, region: {:?}, split keys: {}, start_ts: {}",
        group.region,
        split_keys.len(),
        ctx.start_ts
    );
    let router = &ctx.services.router;
    let region_ids = match router.split_regions(split_keys, true).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!("2PC split regions failed, region: {:?}, error: {}", group.region, e);
            return false;
        }
    };
    for region_id in region_ids {
        if let Err(e) = router.wait_scatter_region_finish(region_id).await {
            warn!("2PC wait scatter region failed, region_id: {}, error: {}", region_id, e);
        }
    }
    router.invalidate_region(group.region).await;
    true
}

async fn do_action_on_groups(
    ctx: &Arc<ActionCtx>,
    bo: &mut Backoffer,
    action: Action,
    groups: Vec<GroupedMutations>,
) -> Result<()> {
    stats::observe_txn_regions(action.name(), groups.len());

    let mut ctx = ctx.clone();
    if let Action::Prewrite = action {
        let sizes = groups
            .iter()
            .map(|g| (g.region.id, g.mutations.len() as u64))
            .collect();
        let mut with_sizes = (*ctx).clone();
        with_sizes.region_txn_size = Arc::new(sizes);
        ctx = Arc::new(with_sizes);
        ctx.shared.update_details(|d| d.prewrite_region_num += groups.len());
    }

    let mut batches = build_batches(&ctx, &action, groups);

    let first_is_primary = batches.first().is_some_and(|b| b.is_primary);
    if first_is_primary && action.primary_first() {
        let primary = batches.remove(0);
        do_action_on_batches(&ctx, bo, action.clone(), vec![primary]).await?;
        if batches.is_empty() {
            return Ok(());
        }
    }

    // The primary commit may have moved the commit ts forward.
    let ctx = ctx.refreshed();
    if let Action::Commit { retry: false } = action {
        // Secondaries are committed in the background; the primary already decided the outcome.
        let mut secondary_bo = bo.clone_detached();
        let secondary_ctx = ctx.clone();
        let start_ts = ctx.start_ts;
        let handle = tokio::spawn(
            async move {
                do_action_on_batches(&secondary_ctx, &mut secondary_bo, action, batches).await
            }
            .map(move |res| {
                if let Err(e) = res {
                    warn!("2PC async commit secondaries failed, start_ts: {}, error: {}", start_ts, e);
                    stats::inc_secondary_lock_cleanup_failure("commit");
                }
            }),
        );
        ctx.shared.background.push(handle);
        return Ok(());
    }
    do_action_on_batches(&ctx, bo, action, batches).await
}

/// Cut region groups into batches, the primary batch first.
fn build_batches(
    ctx: &ActionCtx,
    action: &Action,
    groups: Vec<GroupedMutations>,
) -> Vec<BatchMutations> {
    let limit = ctx
        .services
        .hooks
        .batch_size_limit()
        .unwrap_or(ctx.services.config.commit_batch_size);
    let mut builder = BatchBuilder::new(&ctx.primary_key);
    for group in groups {
        builder.append_by_size(group, action.size_fn(), limit);
    }
    builder.finish()
}

async fn do_action_on_batches(
    ctx: &Arc<ActionCtx>,
    bo: &mut Backoffer,
    action: Action,
    batches: Vec<BatchMutations>,
) -> Result<()> {
    if batches.is_empty() {
        return Ok(());
    }
    if batches.len() == 1 || matches!(action, Action::Commit { retry: true }) {
        for batch in batches {
            handle_single_batch(ctx, bo, &action, batch).await?;
        }
        return Ok(());
    }
    let concurrency = ctx
        .services
        .config
        .committer_concurrency
        .clamp(1, batches.len());
    BatchExecutor::new(ctx.clone(), action, concurrency)
        .process(bo, batches)
        .await
}

/// How one RPC for a batch ended.
enum BatchOutcome {
    Done,
    /// The region layout changed under the batch; its mutations are sent again, regrouped.
    Regroup(MutationSet),
    /// The store rejected the commit ts; the mutations are committed again under `ctx`.
    Recommit(Arc<ActionCtx>, MutationSet),
}

/// Apply `action` to `batch`, regrouping and resending its mutations until all of them succeed.
///
/// Every resend follows a retry accounted on `bo`, so its budget bounds the loop.
pub(crate) async fn handle_single_batch(
    ctx: &Arc<ActionCtx>,
    bo: &mut Backoffer,
    action: &Action,
    batch: BatchMutations,
) -> Result<()> {
    let mut ctx = ctx.clone();
    let mut pending = VecDeque::from([batch]);
    while let Some(batch) = pending.pop_front() {
        let mutations = match send_single_batch(&ctx, bo, action, batch).await? {
            BatchOutcome::Done => continue,
            BatchOutcome::Regroup(mutations) => mutations,
            BatchOutcome::Recommit(recommit_ctx, mutations) => {
                ctx = recommit_ctx;
                mutations
            }
        };
        let groups = group_mutations(&ctx, &mutations).await?;
        if let Action::Prewrite = action {
            ctx.shared.update_details(|d| d.prewrite_region_num += groups.len());
        }
        // Ahead of the remaining batches, keeping the primary first.
        for batch in build_batches(&ctx, action, groups).into_iter().rev() {
            pending.push_front(batch);
        }
    }
    Ok(())
}

async fn send_single_batch(
    ctx: &Arc<ActionCtx>,
    bo: &mut Backoffer,
    action: &Action,
    batch: BatchMutations,
) -> Result<BatchOutcome> {
    match action {
        Action::Prewrite => prewrite_single_batch(ctx, bo, batch).await,
        Action::Commit { .. } => commit_single_batch(ctx, bo, batch).await,
        Action::Cleanup => cleanup_single_batch(ctx, bo, batch).await,
        Action::PessimisticLock(lock) => {
            pessimistic_lock_single_batch(ctx, bo, lock.clone(), batch).await
        }
        Action::PessimisticRollback => pessimistic_rollback_single_batch(ctx, bo, batch).await,
    }
}

/// Send one RPC through the fault hooks, bounded by the request timeout.
pub(crate) async fn send<Resp, F, Fut>(
    ctx: &ActionCtx,
    kind: RpcKind,
    region: RegionVerId,
    is_primary: bool,
    keys: &[Key],
    rpc: F,
) -> Result<Resp>
where
    Resp: Default + SetRegionError,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Resp>>,
{
    match ctx
        .services
        .hooks
        .before_send(kind, region, is_primary, keys)
    {
        FaultAction::Continue => {}
        FaultAction::Sleep(duration) => tokio::time::sleep(duration).await,
        FaultAction::RegionError(e) => {
            let mut resp = Resp::default();
            resp.set_region_error(e);
            return Ok(resp);
        }
        FaultAction::TransportError(message) => return Err(Error::Transport { message }),
    }

    let stats = stats::store_stats(kind.as_str());
    let res = match tokio::time::timeout(ctx.services.config.timeout, rpc()).await {
        Ok(res) => res,
        Err(_) => Err(Error::Transport {
            message: format!("{} request timed out", kind.as_str()),
        }),
    };
    stats.done(res)
}

pub(crate) async fn on_region_error(
    ctx: &ActionCtx,
    bo: &mut Backoffer,
    region: RegionVerId,
    err: RegionError,
) -> Result<()> {
    debug!("2PC region error, region: {:?}, error: {}", region, err);
    let router = &ctx.services.router;
    let caught_up = match &err {
        RegionError::EpochNotMatch { current_regions } => {
            router.on_epoch_not_match(region, current_regions).await
        }
        _ => {
            router.invalidate_region(region).await;
            false
        }
    };
    may_backoff_for_region_error(&err, caught_up, bo).await?;
    Ok(())
}

async fn on_send_fail(
    ctx: &ActionCtx,
    bo: &mut Backoffer,
    region: RegionVerId,
    err: Error,
) -> Result<()> {
    warn!("2PC send request failed, region: {:?}, error: {}", region, err);
    ctx.services.router.invalidate_region(region).await;
    bo.backoff(&BO_STORE_RPC, err.to_string()).await?;
    Ok(())
}

fn to_mutations(set: &MutationSet) -> Vec<Mutation> {
    (0..set.len())
        .map(|i| Mutation {
            op: set.op(i),
            key: set.key(i).clone(),
            value: set.value(i).clone(),
            assertion: Assertion::None,
        })
        .collect()
}

async fn prewrite_single_batch(
    ctx: &Arc<ActionCtx>,
    bo: &mut Backoffer,
    batch: BatchMutations,
) -> Result<BatchOutcome> {
    // After a retry the region layout is unknown; the size only hints the store anyway.
    let txn_size = if bo.error_count() > 0 {
        u64::MAX
    } else {
        ctx.region_txn_size
            .get(&batch.region.id)
            .copied()
            .unwrap_or_default()
    };
    let req = PrewriteRequest {
        mutations: to_mutations(&batch.mutations),
        is_pessimistic_lock: (0..batch.mutations.len())
            .map(|i| batch.mutations.is_pessimistic_lock(i))
            .collect(),
        primary_lock: ctx.primary_key.clone(),
        start_version: ctx.start_ts,
        lock_ttl: ctx.lock_ttl,
        for_update_ts: ctx.for_update_ts,
        txn_size,
        min_commit_ts: ctx.min_commit_ts(),
    };

    loop {
        let kv = &ctx.services.kv;
        let region = batch.region;
        let resp = send(
            ctx,
            RpcKind::Prewrite,
            region,
            batch.is_primary,
            batch.mutations.keys(),
            || kv.prewrite(region, req.clone()),
        )
        .await;
        let mut resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                on_send_fail(ctx, bo, region, e).await?;
                return Ok(BatchOutcome::Regroup(batch.mutations));
            }
        };
        if let Some(e) = resp.region_error.take() {
            on_region_error(ctx, bo, region, e).await?;
            return Ok(BatchOutcome::Regroup(batch.mutations));
        }

        if resp.errors.is_empty() {
            if batch.is_primary && ctx.txn_size > ctx.services.config.ttl_refreshed_txn_size as u64 {
                ctx.shared.ttl_manager.run(ctx.clone());
            }
            return Ok(BatchOutcome::Done);
        }

        let mut locks = Vec::with_capacity(resp.errors.len());
        for mut key_err in resp.errors {
            match key_err.locked.take() {
                Some(lock) => {
                    info!(
                        "2PC prewrite encounters lock, start_ts: {}, lock_version: {}, key: {}",
                        ctx.start_ts,
                        lock.lock_version,
                        HexRepr(lock.key.as_bytes())
                    );
                    locks.push(lock);
                }
                None => return Err(key_err.into()),
            }
        }
        if let Some(delay) = ctx
            .services
            .hooks
            .before_resolve_locks(ctx.start_ts, &locks)
        {
            tokio::time::sleep(delay).await;
        }
        let lock_count = locks.len();
        let start = Instant::now();
        let ms_before_expired = ctx
            .services
            .resolver
            .resolve_for_write(ctx.start_ts, locks)
            .await?;
        let elapsed = start.elapsed();
        ctx.shared.update_details(|d| d.resolve_lock_time += elapsed);
        if ms_before_expired > 0 {
            bo.backoff_with_max_sleep(
                &BO_TXN_LOCK_FAST,
                Some(ms_before_expired as u64),
                format!("2PC prewrite locked keys: {lock_count}"),
            )
            .await?;
        }
    }
}

async fn commit_single_batch(
    ctx: &Arc<ActionCtx>,
    bo: &mut Backoffer,
    batch: BatchMutations,
) -> Result<BatchOutcome> {
    if batch.is_primary {
        if let Some(delay) = ctx
            .services
            .hooks
            .before_commit_primary(ctx.start_ts, ctx.commit_ts)
        {
            tokio::time::sleep(delay).await;
        }
    }

    let req = CommitRequest {
        start_version: ctx.start_ts,
        keys: batch.mutations.keys().to_vec(),
        commit_version: ctx.commit_ts,
    };
    let kv = &ctx.services.kv;
    let region = batch.region;
    let resp = send(
        ctx,
        RpcKind::Commit,
        region,
        batch.is_primary,
        batch.mutations.keys(),
        || kv.commit(region, req),
    )
    .await;
    let mut resp = match resp {
        Ok(resp) => resp,
        Err(e) if batch.is_primary && e.is_transport_error() => {
            // The store may or may not have committed the primary. Retrying could commit twice
            // and failing could drop a commit.
            error!(
                "2PC commit primary result undetermined, start_ts: {}, commit_ts: {}, error: {}",
                ctx.start_ts, ctx.commit_ts, e
            );
            ctx.shared.set_undetermined(Error::Transport {
                message: e.to_string(),
            });
            return Err(e);
        }
        Err(e) => {
            on_send_fail(ctx, bo, region, e).await?;
            return Ok(BatchOutcome::Regroup(batch.mutations));
        }
    };
    if let Some(e) = resp.region_error.take() {
        on_region_error(ctx, bo, region, e).await?;
        return Ok(BatchOutcome::Regroup(batch.mutations));
    }

    if let Some(mut key_err) = resp.error.take() {
        let committed = ctx.shared.is_committed();
        // Once the primary is committed the commit ts is final.
        let rejected = if committed {
            None
        } else {
            key_err.commit_ts_expired.take()
        };
        if let Some(rejected) = rejected {
            info!(
                "2PC commit ts rejected by the store, retry with a newer commit ts, start_ts: {}, attempted: {}, min_commit_ts: {}",
                ctx.start_ts, rejected.attempted_commit_ts, rejected.min_commit_ts
            );
            if rejected.min_commit_ts.saturating_sub(rejected.attempted_commit_ts) > MAX_COMMIT_TS_SKEW
            {
                return Err(Error::CommitTsExpired {
                    start_ts: ctx.start_ts,
                    attempted_commit_ts: rejected.attempted_commit_ts,
                    min_commit_ts: rejected.min_commit_ts,
                });
            }
            let commit_ts = get_timestamp_with_retry(ctx.services.oracle.as_ref(), bo).await?;
            ctx.shared.set_commit_ts(commit_ts);
            return Ok(BatchOutcome::Recommit(ctx.with_commit_ts(commit_ts), batch.mutations));
        }
        let err = Error::from(key_err);
        if committed {
            // Nothing can reject a secondary once the primary is committed.
            error!(
                "2PC failed to commit key after primary key committed, start_ts: {}, commit_ts: {}, error: {}",
                ctx.start_ts, ctx.commit_ts, err
            );
        } else {
            debug!(
                "2PC failed to commit primary key, start_ts: {}, error: {}",
                ctx.start_ts, err
            );
        }
        return Err(err);
    }

    // The first successful batch is the primary one.
    ctx.shared.mark_committed();
    Ok(BatchOutcome::Done)
}

async fn cleanup_single_batch(
    ctx: &Arc<ActionCtx>,
    bo: &mut Backoffer,
    batch: BatchMutations,
) -> Result<BatchOutcome> {
    let req = BatchRollbackRequest {
        start_version: ctx.start_ts,
        keys: batch.mutations.keys().to_vec(),
    };
    let kv = &ctx.services.kv;
    let region = batch.region;
    let resp = send(
        ctx,
        RpcKind::BatchRollback,
        region,
        batch.is_primary,
        batch.mutations.keys(),
        || kv.batch_rollback(region, req),
    )
    .await;
    let mut resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            on_send_fail(ctx, bo, region, e).await?;
            return Ok(BatchOutcome::Regroup(batch.mutations));
        }
    };
    if let Some(e) = resp.region_error.take() {
        on_region_error(ctx, bo, region, e).await?;
        return Ok(BatchOutcome::Regroup(batch.mutations));
    }
    if let Some(key_err) = resp.error.take() {
        debug!(
            "2PC failed to clean up keys, start_ts: {}, error: {:?}",
            ctx.start_ts, key_err
        );
        return Err(key_err.into());
    }
    Ok(BatchOutcome::Done)
}

async fn pessimistic_lock_single_batch(
    ctx: &Arc<ActionCtx>,
    bo: &mut Backoffer,
    lock: Arc<LockRequest>,
    batch: BatchMutations,
) -> Result<BatchOutcome> {
    let mutations = (0..batch.mutations.len())
        .map(|i| Mutation {
            op: Op::PessimisticLock,
            key: batch.mutations.key(i).clone(),
            value: Value::new(),
            // Inserted keys must not exist when the lock is taken.
            assertion: if batch.mutations.op(i) == Op::Insert {
                Assertion::NotExist
            } else {
                Assertion::None
            },
        })
        .collect();
    let elapsed_ms = ctx.start_instant.elapsed().as_millis() as u64;
    let mut req = PessimisticLockRequest {
        mutations,
        primary_lock: ctx.primary_key.clone(),
        start_version: ctx.start_ts,
        for_update_ts: lock.for_update_ts,
        lock_ttl: elapsed_ms + ctx.services.config.managed_lock_ttl_ms(),
        is_first_lock: ctx.is_first_lock,
        wait_timeout: lock.lock_wait_time,
        return_values: lock.return_values,
        min_commit_ts: lock.for_update_ts + 1,
    };

    loop {
        if lock.lock_wait_time > 0 {
            let time_left =
                lock.lock_wait_time - lock.wait_start_time.elapsed().as_millis() as i64;
            req.wait_timeout = if time_left <= 0 { LOCK_NO_WAIT } else { time_left };
        }

        let kv = &ctx.services.kv;
        let region = batch.region;
        let resp = send(
            ctx,
            RpcKind::PessimisticLock,
            region,
            batch.is_primary,
            batch.mutations.keys(),
            || kv.pessimistic_lock(region, req.clone()),
        )
        .await;
        let mut resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                on_send_fail(ctx, bo, region, e).await?;
                return Ok(BatchOutcome::Regroup(batch.mutations));
            }
        };
        if let Some(e) = resp.region_error.take() {
            on_region_error(ctx, bo, region, e).await?;
            return Ok(BatchOutcome::Regroup(batch.mutations));
        }

        if resp.errors.is_empty() {
            if lock.return_values {
                lock.record_values(batch.mutations.keys(), resp.values);
            }
            return Ok(BatchOutcome::Done);
        }

        let mut locks = Vec::with_capacity(resp.errors.len());
        for mut key_err in resp.errors {
            if key_err.already_exist.is_some() || key_err.deadlock.is_some() {
                return Err(key_err.into());
            }
            match key_err.locked.take() {
                Some(lock) => locks.push(lock),
                None => return Err(key_err.into()),
            }
        }

        // The store already waited for the lock, so resolve without backing off.
        if let Some(delay) = ctx
            .services
            .hooks
            .before_resolve_locks(ctx.start_ts, &locks)
        {
            tokio::time::sleep(delay).await;
        }
        let resolved = ctx.services.resolver.resolve(0, locks).await?;
        if resolved.ms_before_txn_expired > 0 {
            if lock.lock_wait_time == LOCK_NO_WAIT {
                return Err(Error::LockAcquireFailAndNoWaitSet);
            } else if lock.lock_wait_time != LOCK_ALWAYS_WAIT
                && lock.wait_start_time.elapsed().as_millis() as i64 >= lock.lock_wait_time
            {
                return Err(Error::LockWaitTimeout);
            }
            lock.mark_waited();
        }

        // Batches lock in parallel, so the flag is left for the caller to reset.
        if ctx.shared.killed.load(Ordering::Acquire) {
            return Err(Error::QueryInterrupted);
        }
        if ctx.shared.lock_expired.load(Ordering::Acquire) {
            return Err(Error::LockExpired);
        }
    }
}

async fn pessimistic_rollback_single_batch(
    ctx: &Arc<ActionCtx>,
    bo: &mut Backoffer,
    batch: BatchMutations,
) -> Result<BatchOutcome> {
    let req = PessimisticRollbackRequest {
        start_version: ctx.start_ts,
        for_update_ts: ctx.for_update_ts,
        keys: batch.mutations.keys().to_vec(),
    };
    let kv = &ctx.services.kv;
    let region = batch.region;
    let resp = send(
        ctx,
        RpcKind::PessimisticRollback,
        region,
        batch.is_primary,
        batch.mutations.keys(),
        || kv.pessimistic_rollback(region, req),
    )
    .await;
    let mut resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            on_send_fail(ctx, bo, region, e).await?;
            return Ok(BatchOutcome::Regroup(batch.mutations));
        }
    };
    if let Some(e) = resp.region_error.take() {
        on_region_error(ctx, bo, region, e).await?;
        return Ok(BatchOutcome::Regroup(batch.mutations));
    }
    match resp.errors.into_iter().next() {
        Some(key_err) => Err(Error::from(key_err)),
        None => Ok(BatchOutcome::Done),
    }
}

#[cfg(test)]
mod tests {
    use crate::mock::MockEnv;
    use crate::store::KvClient;
    use crate::store::Mutation;
    use crate::store::Op;
    use crate::store::PrewriteRequest;
    use crate::transaction::RpcKind;
    use crate::transaction::Snapshot;
    use crate::Key;
    use crate::TxnConfig;

    #[tokio::test]
    async fn small_batches_keep_the_primary_first() {
        let env = MockEnv::single_region();
        let client = env
            .client()
            .with_config(TxnConfig::default().with_commit_batch_size(1));
        let mut txn = client.begin_optimistic().await.unwrap();
        for key in ["a", "b", "c"] {
            txn.put(key, "v").await.unwrap();
        }
        txn.commit().await.unwrap();
        txn.wait_background_tasks().await;

        assert_eq!(env.store.rpc_count(RpcKind::Prewrite), 3);
        let commits: Vec<_> = env
            .store
            .rpc_log()
            .into_iter()
            .filter(|r| r.kind == RpcKind::Commit)
            .collect();
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[0].keys, vec![Key::from("a")]);
    }

    #[tokio::test]
    async fn crowded_region_is_split_before_prewrite() {
        let env = MockEnv::single_region();
        let client = env
            .client()
            .with_config(TxnConfig::default().with_pre_split(4, 2));
        let mut txn = client.begin_optimistic().await.unwrap();
        for key in ["a", "b", "c", "d"] {
            txn.put(key, "v").await.unwrap();
        }
        txn.commit().await.unwrap();
        txn.wait_background_tasks().await;

        assert_eq!(env.cluster.regions().len(), 5);
        assert_eq!(env.store.rpc_count(RpcKind::Prewrite), 4);
        assert_eq!(txn.commit_details().prewrite_region_num, 4);
    }

    #[tokio::test]
    async fn prewrite_rolls_back_an_abandoned_lock() {
        let env = MockEnv::single_region();
        let region = env.cluster.locate(&Key::from("k")).region;
        // A transaction that prewrote with a zero TTL and went away.
        env.store
            .prewrite(
                region,
                PrewriteRequest {
                    mutations: vec![Mutation {
                        op: Op::Put,
                        key: Key::from("k"),
                        value: b"old".to_vec(),
                        assertion: Default::default(),
                    }],
                    is_pessimistic_lock: vec![false],
                    primary_lock: Key::from("k"),
                    start_version: 5,
                    lock_ttl: 0,
                    min_commit_ts: 6,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(env.store.lock_info(&Key::from("k")).is_some());

        let mut txn = env.client().begin_optimistic().await.unwrap();
        txn.put("k", "new").await.unwrap();
        let commit_ts = txn.commit().await.unwrap().unwrap();
        assert_eq!(
            env.store.get(&Key::from("k"), commit_ts).await.unwrap(),
            Some(b"new".to_vec())
        );
        assert_eq!(env.store.rpc_count(RpcKind::Prewrite), 3);
    }
}

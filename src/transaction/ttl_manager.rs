// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! Keeps the primary lock of a long-running transaction alive.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::info;
use log::warn;
use tokio::sync::Notify;

use super::action::on_region_error;
use super::action::send;
use super::action::ActionCtx;
use super::hooks::RpcKind;
use crate::backoffer::Backoffer;
use crate::backoffer::BO_ORACLE_RPC;
use crate::kv::HexRepr;
use crate::stats;
use crate::store::TxnHeartBeatRequest;
use crate::timestamp::physical_elapsed;
use crate::Error;
use crate::Key;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum TtlManagerState {
    Uninitialized = 0,
    Running = 1,
    Closed = 2,
}

/// Sends heartbeats for the primary lock until closed.
///
/// `run` and `close` are one-way transitions; calling either again is a no-op.
#[derive(Debug)]
pub(crate) struct TtlManager {
    state: AtomicU8,
    close: Notify,
}

impl Default for TtlManager {
    fn default() -> Self {
        TtlManager {
            state: AtomicU8::new(TtlManagerState::Uninitialized as u8),
            close: Notify::new(),
        }
    }
}

impl TtlManager {
    fn transit(&self, from: TtlManagerState, to: TtlManagerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Start the heartbeat loop for the transaction described by `ctx`.
    ///
    /// The loop is registered with the transaction's background tasks and ends once the
    /// manager is closed.
    pub(crate) fn run(&self, ctx: Arc<ActionCtx>) {
        if !self.transit(TtlManagerState::Uninitialized, TtlManagerState::Running) {
            return;
        }
        let background = ctx.shared.background.clone();
        background.push(tokio::spawn(keep_alive(ctx)));
    }

    pub(crate) fn close(&self) {
        if self.transit(TtlManagerState::Running, TtlManagerState::Closed) {
            self.close.notify_one();
        }
    }
}

async fn keep_alive(ctx: Arc<ActionCtx>) {
    let config = &ctx.services.config;
    let period = (config.managed_lock_ttl / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ctx.shared.ttl_manager.close.notified() => return,
            _ = ticker.tick() => {}
        }
        if ctx.shared.killed.load(Ordering::Acquire) {
            return;
        }

        let mut bo = Backoffer::new(config.backoff.pessimistic_lock_ms);
        let now = match ctx.services.oracle.get_timestamp().await {
            Ok(ts) => ts,
            Err(e) => {
                if let Err(e) = bo.backoff(&BO_ORACLE_RPC, e.to_string()).await {
                    warn!("keep alive get timestamp failed, start_ts: {}, error: {}", ctx.start_ts, e);
                    return;
                }
                continue;
            }
        };

        let uptime = physical_elapsed(ctx.start_ts, now);
        if uptime > config.max_txn_ttl {
            // Stop refreshing so the locks cannot be held forever by a stuck client.
            info!(
                "ttl manager lived up to its lifetime, start_ts: {}, uptime: {:?}, max_txn_ttl: {:?}",
                ctx.start_ts, uptime, config.max_txn_ttl
            );
            stats::inc_ttl_lifetime_reach();
            if ctx.is_pessimistic {
                ctx.shared.lock_expired.store(true, Ordering::Release);
            }
            return;
        }

        let new_ttl = uptime.as_millis() as u64 + config.managed_lock_ttl_ms();
        info!("send TxnHeartBeat, start_ts: {}, new_ttl: {}", ctx.start_ts, new_ttl);
        let start = Instant::now();
        let res = send_txn_heart_beat(&ctx, &mut bo, &ctx.primary_key, new_ttl).await;
        stats::observe_heartbeat(res.is_ok(), start.elapsed());
        if let Err(e) = res {
            warn!("send TxnHeartBeat failed, start_ts: {}, error: {}", ctx.start_ts, e);
            return;
        }
    }
}

/// Extend the TTL of the primary lock, returning the TTL the store settled on.
pub(crate) async fn send_txn_heart_beat(
    ctx: &ActionCtx,
    bo: &mut Backoffer,
    primary: &Key,
    ttl: u64,
) -> Result<u64> {
    let req = TxnHeartBeatRequest {
        primary_lock: primary.clone(),
        start_version: ctx.start_ts,
        advise_lock_ttl: ttl,
    };
    loop {
        let loc = ctx.services.router.locate_key(primary).await?;
        let kv = &ctx.services.kv;
        let region = loc.region;
        let mut resp = send(
            ctx,
            RpcKind::TxnHeartBeat,
            region,
            true,
            std::slice::from_ref(primary),
            || kv.txn_heart_beat(region, req.clone()),
        )
        .await?;
        if let Some(e) = resp.region_error.take() {
            on_region_error(ctx, bo, region, e).await?;
            continue;
        }
        if let Some(key_err) = resp.error.take() {
            return Err(Error::StringError(format!(
                "txn {} heartbeat fail, primary key = {}, err = {}",
                ctx.start_ts,
                HexRepr(primary.as_bytes()),
                Error::from(key_err)
            )));
        }
        return Ok(resp.lock_ttl);
    }
}

// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;

use super::action::handle_single_batch;
use super::action::Action;
use super::action::ActionCtx;
use super::mutations::BatchMutations;
use crate::backoffer::Backoffer;
use crate::Result;

/// Runs the batches of one action concurrently, at most `concurrency` at a time.
///
/// Prewrite batches run under a forked backoff context that is canceled by the first failure,
/// so siblings stop retrying once the transaction is doomed. Other actions leave siblings alone.
pub(crate) struct BatchExecutor {
    ctx: Arc<ActionCtx>,
    action: Action,
    permits: Arc<Semaphore>,
    permit_wait_duration: Duration,
}

impl BatchExecutor {
    pub(crate) fn new(ctx: Arc<ActionCtx>, action: Action, concurrency: usize) -> Self {
        BatchExecutor {
            ctx,
            action,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            permit_wait_duration: Duration::ZERO,
        }
    }

    /// Run every batch and return the first error. Results of the others are drained.
    pub(crate) async fn process(
        mut self,
        bo: &mut Backoffer,
        batches: Vec<BatchMutations>,
    ) -> Result<()> {
        let is_prewrite = matches!(self.action, Action::Prewrite);
        let (parent_bo, cancel) = if is_prewrite {
            let (forked, cancel) = bo.fork();
            (forked, Some(cancel))
        } else {
            (bo.clone_detached(), None)
        };

        let batch_count = batches.len();
        let (exit_tx, mut exit_rx) = mpsc::channel::<()>(1);
        let (res_tx, mut res_rx) = mpsc::unbounded_channel::<Result<()>>();

        let ctx = self.ctx.clone();
        let action = self.action.clone();
        let permits = self.permits.clone();
        let permit_wait_duration = &mut self.permit_wait_duration;
        let dispatch = async move {
            for batch in batches {
                let wait_start = Instant::now();
                let permit = tokio::select! {
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = exit_rx.recv() => {
                        info!(
                            "break dispatching batches, action: {}, start_ts: {}",
                            action.name(),
                            ctx.start_ts
                        );
                        break;
                    }
                };
                *permit_wait_duration += wait_start.elapsed();

                let mut single_bo = if is_prewrite {
                    parent_bo.fork().0
                } else {
                    parent_bo.clone_detached()
                };
                let ctx = ctx.clone();
                let action = action.clone();
                let res_tx = res_tx.clone();
                tokio::spawn(async move {
                    let before_sleep = single_bo.total_sleep_ms();
                    let res = handle_single_batch(&ctx, &mut single_bo, &action, batch).await;
                    drop(permit);
                    let delta = single_bo.total_sleep_ms().saturating_sub(before_sleep);
                    if delta > 0 && action.records_details() {
                        let types: Vec<_> = single_bo.backoff_types().collect();
                        ctx.shared.update_details(|d| {
                            d.commit_backoff_time += Duration::from_millis(delta);
                            d.backoff_types.extend(types);
                        });
                    }
                    let _ = res_tx.send(res);
                });
            }
        };

        let action_name = self.action.name();
        let start_ts = self.ctx.start_ts;
        let collect = async {
            let mut first_err = None;
            while let Some(res) = res_rx.recv().await {
                if let Err(e) = res {
                    debug!(
                        "2PC batch failed, action: {}, start_ts: {}, error: {}",
                        action_name, start_ts, e
                    );
                    if let Some(cancel) = &cancel {
                        debug!("2PC cancel other batches, action: {}", action_name);
                        cancel.cancel();
                        let _ = exit_tx.try_send(());
                    }
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
            first_err
        };

        let ((), first_err) = tokio::join!(dispatch, collect);
        debug!(
            "2PC batches done, action: {}, batches: {}, permit wait: {:?}",
            action_name, batch_count, self.permit_wait_duration
        );
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

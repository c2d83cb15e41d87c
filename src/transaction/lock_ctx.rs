// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::Key;
use crate::Value;

/// Wait for conflicting locks as long as the store allows.
pub const LOCK_ALWAYS_WAIT: i64 = 0;
/// Fail at once when a key is locked by another transaction.
pub const LOCK_NO_WAIT: i64 = -1;

/// A value returned while acquiring a pessimistic lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReturnedValue {
    pub value: Option<Value>,
    /// The key was already locked by this transaction, so no value was fetched.
    pub already_locked: bool,
}

/// Options and results of one [`lock_keys_with_ctx`](crate::Transaction::lock_keys_with_ctx) call.
#[derive(Clone, Debug)]
pub struct LockCtx {
    pub for_update_ts: u64,
    /// Total milliseconds to wait for conflicting locks, or one of
    /// [`LOCK_ALWAYS_WAIT`] and [`LOCK_NO_WAIT`].
    pub lock_wait_time: i64,
    /// Start of the wait budget. Retries within the call draw from the same budget.
    pub wait_start_time: Instant,
    pub return_values: bool,
    /// Keys that must not exist if a previous lock observed their value.
    pub check_key_exists: HashSet<Key>,
    pub values: HashMap<Key, ReturnedValue>,
    /// Set when the call had to wait for another transaction's lock.
    pub pessimistic_lock_waited: bool,
    pub lock_keys_duration: Duration,
}

impl LockCtx {
    pub fn new(for_update_ts: u64) -> LockCtx {
        LockCtx {
            for_update_ts,
            lock_wait_time: LOCK_ALWAYS_WAIT,
            wait_start_time: Instant::now(),
            return_values: false,
            check_key_exists: HashSet::new(),
            values: HashMap::new(),
            pessimistic_lock_waited: false,
            lock_keys_duration: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_lock_wait_time(mut self, lock_wait_time: i64) -> LockCtx {
        self.lock_wait_time = lock_wait_time;
        self
    }

    #[must_use]
    pub fn with_return_values(mut self) -> LockCtx {
        self.return_values = true;
        self
    }

    #[must_use]
    pub fn with_check_key_exists(mut self, keys: impl IntoIterator<Item = impl Into<Key>>) -> LockCtx {
        self.check_key_exists
            .extend(keys.into_iter().map(Into::into));
        self
    }
}

/// The part of a [`LockCtx`] shared by the concurrently locked batches of one call.
#[derive(Debug)]
pub(crate) struct LockRequest {
    pub(crate) for_update_ts: u64,
    pub(crate) lock_wait_time: i64,
    pub(crate) wait_start_time: Instant,
    pub(crate) return_values: bool,
    values: Mutex<HashMap<Key, ReturnedValue>>,
    waited: AtomicBool,
}

impl LockRequest {
    pub(crate) fn new(ctx: &LockCtx) -> LockRequest {
        LockRequest {
            for_update_ts: ctx.for_update_ts,
            lock_wait_time: ctx.lock_wait_time,
            wait_start_time: ctx.wait_start_time,
            return_values: ctx.return_values,
            values: Mutex::new(HashMap::new()),
            waited: AtomicBool::new(false),
        }
    }

    pub(crate) fn record_values(&self, keys: &[Key], values: Vec<Option<Value>>) {
        if let Ok(mut map) = self.values.lock() {
            for (key, value) in keys.iter().zip(values) {
                map.insert(
                    key.clone(),
                    ReturnedValue {
                        value,
                        already_locked: false,
                    },
                );
            }
        }
    }

    pub(crate) fn mark_waited(&self) {
        self.waited.store(true, Ordering::Release);
    }

    /// Copy what the lock RPCs observed back into the caller's context.
    pub(crate) fn finish(&self, ctx: &mut LockCtx) {
        if let Ok(mut map) = self.values.lock() {
            ctx.values.extend(map.drain());
        }
        if self.waited.load(Ordering::Acquire) {
            ctx.pessimistic_lock_waited = true;
        }
    }
}

// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! An in-process timestamp oracle.
//!
//! In clock mode timestamps follow the wall clock (or a time set by the test) with a logical
//! counter for uniqueness within a millisecond. In counter mode they are consecutive integers,
//! which makes scenarios with exact timestamps easy to write.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::timestamp::time_to_ts;
use crate::timestamp::TimestampOracle;
use crate::Error;
use crate::Result;

#[derive(Debug)]
enum Mode {
    Clock { last_ts: u64, n: u64 },
    Counter { next: u64 },
}

#[derive(Debug)]
pub struct MockOracle {
    mode: Mutex<Mode>,
    hook_current_time: Mutex<Option<SystemTime>>,
    failures: AtomicUsize,
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOracle {
    pub fn new() -> MockOracle {
        MockOracle {
            mode: Mutex::new(Mode::Clock { last_ts: 0, n: 0 }),
            hook_current_time: Mutex::new(None),
            failures: AtomicUsize::new(0),
        }
    }

    /// Hand out `first`, `first + 1`, ...
    pub fn with_counter(first: u64) -> MockOracle {
        MockOracle {
            mode: Mutex::new(Mode::Counter { next: first }),
            ..MockOracle::new()
        }
    }

    /// Pin the clock. Only affects clock mode.
    pub fn set_current_time(&self, t: SystemTime) {
        *self.hook_current_time.lock().unwrap() = Some(t);
    }

    /// Fail the next `n` requests.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn now(&self) -> SystemTime {
        self.hook_current_time
            .lock()
            .unwrap()
            .unwrap_or_else(SystemTime::now)
    }

    fn next_ts(&self) -> Result<u64> {
        let now = self.now();
        let mut mode = self.mode.lock().unwrap();
        match &mut *mode {
            Mode::Counter { next } => {
                let ts = *next;
                *next += 1;
                Ok(ts)
            }
            Mode::Clock { last_ts, n } => {
                let ts = time_to_ts(now)?;
                if ts <= *last_ts {
                    *n += 1;
                    return Ok(*last_ts + *n);
                }
                *last_ts = ts;
                *n = 0;
                Ok(ts)
            }
        }
    }
}

#[async_trait]
impl TimestampOracle for MockOracle {
    async fn get_timestamp(&self) -> Result<u64> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::StringError("injected oracle failure".to_owned()));
        }
        self.next_ts()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::time::Duration;
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::timestamp::extract_physical;

    #[tokio::test]
    async fn clock_mode_generates_unique_timestamps() {
        let o = MockOracle::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            seen.insert(o.get_timestamp().await.unwrap());
        }
        assert_eq!(seen.len(), 10_000);
    }

    #[tokio::test]
    async fn clock_mode_follows_pinned_time() {
        let o = MockOracle::new();
        let start = UNIX_EPOCH + Duration::from_millis(1_700_000_000_000);
        o.set_current_time(start);
        let a = o.get_timestamp().await.unwrap();
        let b = o.get_timestamp().await.unwrap();
        assert_eq!(extract_physical(a), 1_700_000_000_000);
        assert_eq!(b, a + 1);

        o.set_current_time(start + Duration::from_millis(10));
        let c = o.get_timestamp().await.unwrap();
        assert_eq!(extract_physical(c), 1_700_000_000_010);
    }

    #[tokio::test]
    async fn counter_mode_and_injected_failures() {
        let o = MockOracle::with_counter(100);
        o.fail_next(1);
        assert!(o.get_timestamp().await.is_err());
        assert_eq!(o.get_timestamp().await.unwrap(), 100);
        assert_eq!(o.get_timestamp().await.unwrap(), 101);
    }
}

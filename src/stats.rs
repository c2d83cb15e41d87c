// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

//! Transaction metrics.
//!
//! The Prometheus integration is optional (feature `prometheus`). When disabled, this module
//! compiles to a no-op implementation.

#[cfg(feature = "prometheus")]
mod imp {
    use std::sync::OnceLock;
    use std::time::Duration;
    use std::time::Instant;

    use log::warn;
    use prometheus::register_histogram_vec;
    use prometheus::register_int_counter;
    use prometheus::register_int_counter_vec;
    use prometheus::HistogramVec;
    use prometheus::IntCounter;
    use prometheus::IntCounterVec;

    use crate::Result;

    struct Metrics {
        store_request_duration: Option<HistogramVec>,
        store_request_total: Option<IntCounterVec>,
        store_failed_request_total: Option<IntCounterVec>,
        backoff_sleep_duration: Option<HistogramVec>,

        txn_regions_num: Option<HistogramVec>,
        txn_write_kv_num: Option<HistogramVec>,
        txn_commit_total: Option<IntCounterVec>,
        secondary_lock_cleanup_failure_total: Option<IntCounterVec>,
        ttl_lifetime_reach_total: Option<IntCounter>,
        heartbeat_duration: Option<HistogramVec>,
    }

    static METRICS: OnceLock<Metrics> = OnceLock::new();

    fn metrics() -> &'static Metrics {
        METRICS.get_or_init(Metrics::register)
    }

    impl Metrics {
        fn register_histogram_vec(
            name: &'static str,
            help: &'static str,
            labels: &'static [&'static str],
        ) -> Option<HistogramVec> {
            match register_histogram_vec!(name, help, labels) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("failed to register prometheus histogram vec {name}: {e:?}");
                    None
                }
            }
        }

        fn register_int_counter_vec(
            name: &'static str,
            help: &'static str,
            labels: &'static [&'static str],
        ) -> Option<IntCounterVec> {
            match register_int_counter_vec!(name, help, labels) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("failed to register prometheus counter vec {name}: {e:?}");
                    None
                }
            }
        }

        fn register_int_counter(name: &'static str, help: &'static str) -> Option<IntCounter> {
            match register_int_counter!(name, help) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("failed to register prometheus counter {name}: {e:?}");
                    None
                }
            }
        }

        fn register() -> Metrics {
            Metrics {
                store_request_duration: Self::register_histogram_vec(
                    "txn_store_request_duration_seconds",
                    "Bucketed histogram of transactional store requests duration",
                    &["type"],
                ),
                store_request_total: Self::register_int_counter_vec(
                    "txn_store_request_total",
                    "Total number of transactional requests sent to the store",
                    &["type"],
                ),
                store_failed_request_total: Self::register_int_counter_vec(
                    "txn_store_failed_request_total",
                    "Total number of transactional requests that failed in transport",
                    &["type"],
                ),
                backoff_sleep_duration: Self::register_histogram_vec(
                    "txn_backoff_sleep_duration_seconds",
                    "Bucketed histogram of backoff sleep duration",
                    &["type"],
                ),
                txn_regions_num: Self::register_histogram_vec(
                    "txn_regions_num",
                    "Number of regions touched by one 2PC action",
                    &["type"],
                ),
                txn_write_kv_num: Self::register_histogram_vec(
                    "txn_write_kv_num",
                    "Number of keys and bytes written by one transaction",
                    &["type"],
                ),
                txn_commit_total: Self::register_int_counter_vec(
                    "txn_commit_total",
                    "Transaction commits by result",
                    &["result"],
                ),
                secondary_lock_cleanup_failure_total: Self::register_int_counter_vec(
                    "txn_secondary_lock_cleanup_failure_total",
                    "Failures of the asynchronous secondary commit or rollback",
                    &["type"],
                ),
                ttl_lifetime_reach_total: Self::register_int_counter(
                    "txn_ttl_manager_lifetime_reach_total",
                    "TTL managers that stopped because the transaction lived too long",
                ),
                heartbeat_duration: Self::register_histogram_vec(
                    "txn_heart_beat_duration_seconds",
                    "Bucketed histogram of txn heartbeat duration",
                    &["type"],
                ),
            }
        }
    }

    pub struct RequestStats {
        start: Instant,
        cmd: &'static str,
    }

    impl RequestStats {
        pub fn done<R>(&self, r: Result<R>) -> Result<R> {
            let metrics = metrics();
            if r.is_ok() {
                if let Some(duration) = metrics.store_request_duration.as_ref() {
                    duration
                        .with_label_values(&[self.cmd])
                        .observe(duration_to_sec(self.start.elapsed()));
                }
            } else if let Some(failed_counter) = metrics.store_failed_request_total.as_ref() {
                failed_counter.with_label_values(&[self.cmd]).inc();
            }
            r
        }
    }

    pub fn store_stats(cmd: &'static str) -> RequestStats {
        if let Some(counter) = metrics().store_request_total.as_ref() {
            counter.with_label_values(&[cmd]).inc();
        }
        RequestStats {
            start: Instant::now(),
            cmd,
        }
    }

    pub(crate) fn observe_backoff(kind: &'static str, sleep_ms: u64) {
        if let Some(h) = metrics().backoff_sleep_duration.as_ref() {
            h.with_label_values(&[kind])
                .observe(duration_to_sec(Duration::from_millis(sleep_ms)));
        }
    }

    pub(crate) fn observe_txn_regions(action: &'static str, regions: usize) {
        if let Some(h) = metrics().txn_regions_num.as_ref() {
            h.with_label_values(&[action]).observe(regions as f64);
        }
    }

    pub(crate) fn observe_txn_write(keys: usize, bytes: usize) {
        if let Some(h) = metrics().txn_write_kv_num.as_ref() {
            h.with_label_values(&["keys"]).observe(keys as f64);
            h.with_label_values(&["bytes"]).observe(bytes as f64);
        }
    }

    pub(crate) fn inc_txn_commit(result: &'static str) {
        if let Some(c) = metrics().txn_commit_total.as_ref() {
            c.with_label_values(&[result]).inc();
        }
    }

    pub(crate) fn inc_secondary_lock_cleanup_failure(kind: &'static str) {
        if let Some(c) = metrics().secondary_lock_cleanup_failure_total.as_ref() {
            c.with_label_values(&[kind]).inc();
        }
    }

    pub(crate) fn inc_ttl_lifetime_reach() {
        if let Some(c) = metrics().ttl_lifetime_reach_total.as_ref() {
            c.inc();
        }
    }

    pub(crate) fn observe_heartbeat(ok: bool, duration: Duration) {
        if let Some(h) = metrics().heartbeat_duration.as_ref() {
            let label = if ok { "ok" } else { "err" };
            h.with_label_values(&[label])
                .observe(duration_to_sec(duration));
        }
    }

    /// Convert Duration to seconds.
    #[inline]
    fn duration_to_sec(d: Duration) -> f64 {
        let nanos = f64::from(d.subsec_nanos());
        d.as_secs() as f64 + (nanos / 1_000_000_000.0)
    }

    #[cfg(test)]
    mod tests {
        use serial_test::serial;

        use super::*;

        fn counter_value(name: &str, label: &str) -> u64 {
            prometheus::gather()
                .iter()
                .filter(|family| family.get_name() == name)
                .flat_map(|family| family.get_metric().iter())
                .filter(|metric| metric.get_label().iter().any(|l| l.get_value() == label))
                .map(|metric| metric.get_counter().get_value() as u64)
                .sum()
        }

        #[test]
        #[serial]
        fn cleanup_failures_are_counted_by_kind() {
            let before = counter_value("txn_secondary_lock_cleanup_failure_total", "commit");
            inc_secondary_lock_cleanup_failure("commit");
            inc_secondary_lock_cleanup_failure("commit");
            inc_secondary_lock_cleanup_failure("rollback");
            let after = counter_value("txn_secondary_lock_cleanup_failure_total", "commit");
            assert_eq!(after - before, 2);
        }

        #[test]
        #[serial]
        fn failed_requests_are_counted() {
            let before = counter_value("txn_store_failed_request_total", "commit");
            let stats = store_stats("commit");
            let res: Result<()> = stats.done(Err(crate::Error::Transport {
                message: "broken pipe".to_owned(),
            }));
            assert!(res.is_err());
            let after = counter_value("txn_store_failed_request_total", "commit");
            assert_eq!(after - before, 1);
        }
    }
}

#[cfg(not(feature = "prometheus"))]
mod imp {
    use std::time::Duration;

    use crate::Result;

    #[derive(Debug, Default)]
    pub struct RequestStats;

    impl RequestStats {
        pub fn done<R>(&self, r: Result<R>) -> Result<R> {
            r
        }
    }

    pub fn store_stats(_cmd: &'static str) -> RequestStats {
        RequestStats
    }

    pub(crate) fn observe_backoff(_kind: &'static str, _sleep_ms: u64) {}

    pub(crate) fn observe_txn_regions(_action: &'static str, _regions: usize) {}

    pub(crate) fn observe_txn_write(_keys: usize, _bytes: usize) {}

    pub(crate) fn inc_txn_commit(_result: &'static str) {}

    pub(crate) fn inc_secondary_lock_cleanup_failure(_kind: &'static str) {}

    pub(crate) fn inc_ttl_lifetime_reach() {}

    pub(crate) fn observe_heartbeat(_ok: bool, _duration: Duration) {}
}

pub use imp::*;

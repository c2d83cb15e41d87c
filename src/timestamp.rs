//! Transaction timestamps and the oracle that hands them out.
//!
//! The lower 18 (PHYSICAL_SHIFT_BITS) bits are the logical part of the timestamp.
//! The higher bits are the physical part, in milliseconds since the Unix epoch.

use std::convert::TryInto;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use log::warn;

use crate::backoffer::Backoffer;
use crate::backoffer::BO_ORACLE_RPC;
use crate::internal_err;
use crate::Result;

const PHYSICAL_SHIFT_BITS: u32 = 18;
const LOGICAL_MASK: i64 = (1_i64 << PHYSICAL_SHIFT_BITS) - 1;

/// One hour of physical time in timestamp units.
///
/// A store asking for a commit timestamp further ahead than this is not suffering from clock
/// drift, and retrying with a fresh timestamp will not help.
pub const MAX_COMMIT_TS_SKEW: u64 = 3_600_000 << PHYSICAL_SHIFT_BITS;

/// Create a transaction timestamp from its physical and logical parts.
///
/// The encoding is `(physical_ms << 18) + logical`.
pub fn compose_ts(physical_ms: i64, logical: i64) -> Result<u64> {
    // Use a wider type to avoid debug-overflow panics, and validate the final range.
    let ts: i128 = ((physical_ms as i128) << PHYSICAL_SHIFT_BITS) + (logical as i128);
    ts.try_into().map_err(|_| {
        internal_err!("invalid ts parts (physical_ms={physical_ms}, logical={logical})")
    })
}

/// Extract the physical part (milliseconds since Unix epoch) from a timestamp.
pub fn extract_physical(ts: u64) -> i64 {
    (ts >> PHYSICAL_SHIFT_BITS) as i64
}

/// Extract the logical part from a timestamp.
pub fn extract_logical(ts: u64) -> i64 {
    (ts as i64) & LOGICAL_MASK
}

/// Return the physical part (milliseconds since Unix epoch) of the given time.
pub fn get_physical(t: SystemTime) -> Result<i64> {
    let (is_before_epoch, duration) = match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (false, d),
        Err(e) => (true, e.duration()),
    };

    let millis: i64 = duration
        .as_millis()
        .try_into()
        .map_err(|_| internal_err!("overflow converting SystemTime to milliseconds"))?;
    Ok(if is_before_epoch { -millis } else { millis })
}

/// Convert a `SystemTime` to a timestamp with a zero logical part.
pub fn time_to_ts(t: SystemTime) -> Result<u64> {
    compose_ts(get_physical(t)?, 0)
}

/// Milliseconds of physical time between two timestamps, saturating at zero.
pub fn physical_elapsed(from_ts: u64, to_ts: u64) -> Duration {
    let ms = extract_physical(to_ts) - extract_physical(from_ts);
    Duration::from_millis(ms.max(0) as u64)
}

/// A monotonic source of timestamps, used for start, for-update and commit timestamps.
#[async_trait]
pub trait TimestampOracle: Send + Sync + 'static {
    async fn get_timestamp(&self) -> Result<u64>;
}

/// Fetch a timestamp, backing off on oracle failures until `bo` runs out.
pub(crate) async fn get_timestamp_with_retry(
    oracle: &dyn TimestampOracle,
    bo: &mut Backoffer,
) -> Result<u64> {
    loop {
        match oracle.get_timestamp().await {
            Ok(ts) => return Ok(ts),
            Err(e) => {
                warn!("get timestamp failed: {}", e);
                bo.backoff(&BO_ORACLE_RPC, e.to_string()).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_parts_round_trip() {
        let physical_ms = 1_700_000_123_456_i64;
        let logical = 42_i64;
        let ts = compose_ts(physical_ms, logical).unwrap();
        assert_eq!(extract_physical(ts), physical_ms);
        assert_eq!(extract_logical(ts), logical);
    }

    #[test]
    fn commit_ts_skew_is_one_hour() {
        assert_eq!(MAX_COMMIT_TS_SKEW, compose_ts(3_600_000, 0).unwrap());
        assert_eq!(MAX_COMMIT_TS_SKEW, 943_718_400_000);
    }

    #[test]
    fn physical_elapsed_saturates() {
        let a = compose_ts(1_000, 5).unwrap();
        let b = compose_ts(3_500, 0).unwrap();
        assert_eq!(physical_elapsed(a, b), Duration::from_millis(2_500));
        assert_eq!(physical_elapsed(b, a), Duration::ZERO);
    }

    #[test]
    fn compose_ts_rejects_negative_timestamps() {
        assert!(compose_ts(-1, 0).is_err());
    }
}

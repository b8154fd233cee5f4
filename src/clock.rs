//! Wall-clock helpers for persisted timestamps.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. A clock set before 1970 reads as zero.
pub fn now_ms() -> u64 {
    to_ms(SystemTime::now())
}

pub fn to_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Whether a timestamp taken at `then_ms` is older than `max_age` at `now_ms`.
pub fn is_older_than(then_ms: u64, max_age: Duration, now_ms: u64) -> bool {
    let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
    now_ms.saturating_sub(then_ms) > max_age_ms
}

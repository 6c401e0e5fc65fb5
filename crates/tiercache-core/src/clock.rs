use std::time::Duration;

use time::OffsetDateTime;

/// Current wall-clock time as unix epoch milliseconds.
pub fn now_millis() -> i64 {
    to_millis(OffsetDateTime::now_utc())
}

pub fn to_millis(datetime: OffsetDateTime) -> i64 {
    (datetime.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Milliseconds elapsed since `since_ms`, clamped at zero for clock skew.
pub fn elapsed_since(since_ms: i64, now_ms: i64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(since_ms).max(0) as u64)
}

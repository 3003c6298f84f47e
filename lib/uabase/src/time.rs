use lazy_static::lazy_static;
use std::time::{Instant, SystemTime};

/// A point in time or a span of time, counted in 100-nanosecond ticks.
/// Matches the OPC UA DateTime resolution; absolute values are anchored at
/// the 1601-01-01 epoch, monotonic values only promise ordering.
pub type DateTime = i64;

pub const TICKS_PER_USEC: DateTime = 10;
pub const TICKS_PER_MSEC: DateTime = 10_000;
pub const TICKS_PER_SEC: DateTime = 10_000_000;

/// Seconds between 1601-01-01 (the DateTime epoch) and 1970-01-01.
pub const UNIX_EPOCH_DELTA_SEC: DateTime = 11_644_473_600;

lazy_static! {
    static ref MONOTONIC_ANCHOR: Instant = Instant::now();
}

/// Wall-clock time as DateTime ticks.
pub fn now() -> DateTime {
    let unix = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    (unix.as_secs() as DateTime + UNIX_EPOCH_DELTA_SEC) * TICKS_PER_SEC
        + (unix.subsec_nanos() as DateTime / 100)
}

/// Monotonic time as DateTime ticks. The unix-epoch offset is added so the
/// values look like "normal" timestamps in logs, but only differences are
/// meaningful.
pub fn now_monotonic() -> DateTime {
    let elapsed = MONOTONIC_ANCHOR.elapsed();
    UNIX_EPOCH_DELTA_SEC * TICKS_PER_SEC
        + elapsed.as_secs() as DateTime * TICKS_PER_SEC
        + (elapsed.subsec_nanos() as DateTime / 100)
}

/// Converts a millisecond count into ticks.
#[inline]
pub fn from_ms(ms: u32) -> DateTime {
    ms as DateTime * TICKS_PER_MSEC
}

/// Whole milliseconds between two instants of the same clock.
#[inline]
pub fn elapsed_ms(since: DateTime, now: DateTime) -> DateTime {
    (now - since) / TICKS_PER_MSEC
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_monotonic_advances() {
        let a = now_monotonic();
        thread::sleep(Duration::from_millis(2));
        let b = now_monotonic();
        assert!(b > a);
        assert!(b - a >= 2 * TICKS_PER_MSEC);
    }

    #[test]
    fn test_now_is_past_unix_epoch() {
        assert!(now() > UNIX_EPOCH_DELTA_SEC * TICKS_PER_SEC);
    }

    #[test]
    fn test_from_ms() {
        assert_eq!(from_ms(1), 10_000);
        assert_eq!(from_ms(1000), TICKS_PER_SEC);
    }

    #[test]
    fn test_elapsed_ms() {
        let start = now_monotonic();
        assert_eq!(elapsed_ms(start, start + from_ms(250)), 250);
        // sub-millisecond remainders are truncated
        assert_eq!(elapsed_ms(start, start + from_ms(250) + 9_999), 250);
    }
}

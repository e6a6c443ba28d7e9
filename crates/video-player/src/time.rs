//! Tick/millisecond conversions.
//!
//! The media subsystem counts time in 100-nanosecond ticks; everything crossing the public
//! boundary is in milliseconds.

/// Ticks per millisecond.
pub const TICKS_PER_MS: i64 = 10_000;

/// Sentinel returned by time queries when no pipeline or clock exists.
pub const UNKNOWN_MS: i64 = -1;

/// Convert milliseconds to ticks, saturating on overflow.
pub fn ms_to_ticks(ms: i64) -> i64 {
    ms.saturating_mul(TICKS_PER_MS)
}

/// Convert ticks to milliseconds, preserving negative values as [`UNKNOWN_MS`].
pub fn ticks_to_ms(ticks: i64) -> i64 {
    if ticks < 0 {
        UNKNOWN_MS
    } else {
        ticks / TICKS_PER_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_both_ways() {
        assert_eq!(ms_to_ticks(1500), 15_000_000);
        assert_eq!(ticks_to_ms(15_000_000), 1500);
        assert_eq!(ticks_to_ms(9_999), 0);
    }

    #[test]
    fn negative_ticks_are_unknown() {
        assert_eq!(ticks_to_ms(-1), UNKNOWN_MS);
        assert_eq!(ticks_to_ms(i64::MIN), UNKNOWN_MS);
    }

    #[test]
    fn ms_to_ticks_saturates() {
        assert_eq!(ms_to_ticks(i64::MAX), i64::MAX);
    }
}

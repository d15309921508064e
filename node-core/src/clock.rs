//! Monotonic time as seen by the core.
//!
//! Every state machine in this crate takes an explicit `now` in milliseconds
//! so hosts can drive them from an executor timer, an interrupt tick counter,
//! or a simulated clock. Timestamps wrap after ~49 days; all comparisons go
//! through [`elapsed`] so the wrap is harmless for intervals shorter than half
//! the counter range.

use core::time::Duration;

/// Millisecond timestamp from a free-running, wrapping counter.
pub type Millis = u32;

/// Tick source readable from interrupt context.
///
/// Implementations must not block or take locks that an interrupt could
/// already hold.
pub trait MonotonicClock {
    /// Returns the current tick in milliseconds.
    fn now_ms(&self) -> Millis;
}

/// Returns the milliseconds elapsed between `since` and `now`, tolerating wraparound.
pub const fn elapsed(now: Millis, since: Millis) -> Millis {
    now.wrapping_sub(since)
}

/// Returns `true` once `now` has reached `since + interval`.
pub const fn has_elapsed(now: Millis, since: Millis, interval: Millis) -> bool {
    elapsed(now, since) >= interval
}

/// Converts a [`Duration`] into whole milliseconds, saturating at [`Millis::MAX`].
pub fn duration_millis(duration: Duration) -> Millis {
    Millis::try_from(duration.as_millis()).unwrap_or(Millis::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_handles_counter_wrap() {
        let before_wrap = u32::MAX - 99;
        let after_wrap = 400;
        assert_eq!(elapsed(after_wrap, before_wrap), 500);
        assert!(has_elapsed(after_wrap, before_wrap, 500));
        assert!(!has_elapsed(after_wrap, before_wrap, 501));
    }

    #[test]
    fn duration_conversion_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(duration_millis(Duration::from_secs(u64::MAX)), u32::MAX);
    }
}

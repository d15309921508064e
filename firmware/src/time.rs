//! Conversions between `node-core` milliseconds and Embassy time.

use embassy_time::{Duration, Instant};
use node_core::clock::{Millis, MonotonicClock};

pub fn core_duration_to_embassy(duration: core::time::Duration) -> Duration {
    let micros = duration.as_micros();
    let micros = u64::try_from(micros).unwrap_or(u64::MAX);
    Duration::from_micros(micros)
}

/// Wrapping millisecond tick derived from the Embassy monotonic clock.
#[allow(clippy::cast_possible_truncation)]
pub fn now_ms() -> Millis {
    // Truncation is the wrap; every consumer compares with `elapsed`.
    Instant::now().as_millis() as Millis
}

/// Milliseconds since the executor's time base started.
pub fn uptime_ms() -> u64 {
    Instant::now().as_millis()
}

/// [`MonotonicClock`] backed by `embassy_time::Instant`; safe in interrupt context.
#[derive(Copy, Clone, Debug, Default)]
pub struct EmbassyClock;

impl MonotonicClock for EmbassyClock {
    fn now_ms(&self) -> Millis {
        now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_microsecond_durations_round_down() {
        assert_eq!(
            core_duration_to_embassy(core::time::Duration::from_nanos(999)),
            Duration::from_micros(0)
        );
        assert_eq!(
            core_duration_to_embassy(core::time::Duration::from_millis(40)),
            Duration::from_millis(40)
        );
    }

    #[test]
    fn oversized_durations_saturate() {
        assert_eq!(
            core_duration_to_embassy(core::time::Duration::MAX),
            Duration::from_micros(u64::MAX)
        );
    }
}

//! Bounded retry budgets and their delay schedules.
//!
//! A [`RetryBudget`] is created fresh for every retry-able operation instance
//! (a link reconnect cycle, one update's fetch loop). Each failure consumes
//! budget; exhaustion is terminal for that instance.

use core::time::Duration;

/// How the delay before retry `n` (0-indexed) is derived.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DelaySchedule {
    /// `first × 2^n`, clamped to `max`.
    Exponential { first: Duration, max: Duration },
    /// `step × (n + 1)`, clamped to `max`.
    Linear { step: Duration, max: Duration },
    /// Same delay for every retry.
    Fixed(Duration),
}

impl DelaySchedule {
    /// Delay before retry number `retry` (0-indexed).
    ///
    /// The value depends only on `retry`, so the schedule is monotonically
    /// non-decreasing and never exceeds its cap.
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            DelaySchedule::Exponential { first, max } => 2u32
                .checked_pow(retry)
                .and_then(|factor| first.checked_mul(factor))
                .map_or(max, |delay| delay.min(max)),
            DelaySchedule::Linear { step, max } => retry
                .checked_add(1)
                .and_then(|factor| step.checked_mul(factor))
                .map_or(max, |delay| delay.min(max)),
            DelaySchedule::Fixed(delay) => delay,
        }
    }
}

/// Verdict after recording a failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Try again after the delay. `attempt` counts failures so far (1-based).
    RetryAfter { attempt: u8, delay: Duration },
    /// The budget is spent; give up on this operation instance.
    Exhausted { failures: u8 },
}

/// Counter of tolerated failures plus the schedule spacing the retries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RetryBudget {
    limit: u8,
    failures: u8,
    schedule: DelaySchedule,
}

impl RetryBudget {
    /// Budget that gives up on the `max_attempts`-th consecutive failure.
    pub const fn attempts(max_attempts: u8, schedule: DelaySchedule) -> Self {
        Self {
            limit: max_attempts,
            failures: 0,
            schedule,
        }
    }

    /// Budget that allows `max_retries` retries after the first failure and
    /// gives up on the failure after that.
    pub const fn retries(max_retries: u8, schedule: DelaySchedule) -> Self {
        Self::attempts(max_retries.saturating_add(1), schedule)
    }

    /// Consumes one unit of budget.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.limit {
            RetryDecision::Exhausted {
                failures: self.failures,
            }
        } else {
            RetryDecision::RetryAfter {
                attempt: self.failures,
                delay: self.schedule.delay(u32::from(self.failures - 1)),
            }
        }
    }

    /// Restores the full budget after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub const fn failures(&self) -> u8 {
        self.failures
    }

    /// Failures tolerated before exhaustion.
    pub const fn limit(&self) -> u8 {
        self.limit
    }

    pub const fn is_exhausted(&self) -> bool {
        self.failures >= self.limit
    }

    pub const fn schedule(&self) -> DelaySchedule {
        self.schedule
    }
}

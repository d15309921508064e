//! Motion lighting policy: derive indicator commands from motion events.

use crate::clock::{Millis, duration_millis, elapsed, has_elapsed};
use crate::config::Timing;
use crate::debounce::MotionEvent;
use crate::indicator::{Color, IndicatorState};

/// Turns the light on for each accepted motion event and off again once the
/// hold time passes without further motion.
#[derive(Debug)]
pub struct MotionLight {
    lit: IndicatorState,
    hold: Millis,
    last_motion: Option<Millis>,
    events: u32,
}

impl MotionLight {
    pub fn new(color: Color, timing: &Timing) -> Self {
        Self {
            lit: IndicatorState::Solid(color),
            hold: duration_millis(timing.motion_hold),
            last_motion: None,
            events: 0,
        }
    }

    /// Returns the command to send for `event`.
    pub fn on_motion(&mut self, event: MotionEvent) -> IndicatorState {
        self.last_motion = Some(event.timestamp);
        self.events = self.events.wrapping_add(1);
        self.lit
    }

    /// Returns `Off` exactly once when the hold expires.
    pub fn poll(&mut self, now: Millis) -> Option<IndicatorState> {
        let last = self.last_motion?;
        if has_elapsed(now, last, self.hold) {
            self.last_motion = None;
            Some(IndicatorState::Off)
        } else {
            None
        }
    }

    /// Milliseconds until [`poll`](Self::poll) would turn the light off.
    pub fn remaining(&self, now: Millis) -> Option<Millis> {
        let last = self.last_motion?;
        Some(self.hold.saturating_sub(elapsed(now, last)))
    }

    pub fn is_lit(&self) -> bool {
        self.last_motion.is_some()
    }

    /// Accepted motion events since startup.
    pub fn events(&self) -> u32 {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lights_then_turns_off_after_hold() {
        let mut light = MotionLight::new(Color::White, &Timing::default());
        assert_eq!(
            light.on_motion(MotionEvent { timestamp: 0 }),
            IndicatorState::Solid(Color::White)
        );
        assert_eq!(light.poll(999), None);
        assert_eq!(light.remaining(400), Some(600));
        assert_eq!(light.poll(1_000), Some(IndicatorState::Off));
        assert_eq!(light.poll(2_000), None);
        assert!(!light.is_lit());
    }

    #[test]
    fn new_motion_extends_hold() {
        let mut light = MotionLight::new(Color::Green, &Timing::default());
        light.on_motion(MotionEvent { timestamp: 0 });
        light.on_motion(MotionEvent { timestamp: 1_500 });
        assert_eq!(light.poll(2_000), None);
        assert_eq!(light.poll(2_500), Some(IndicatorState::Off));
        assert_eq!(light.events(), 2);
    }
}

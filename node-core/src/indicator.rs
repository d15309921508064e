//! Indicator state and the frame stepper that renders it.
//!
//! Exactly one [`IndicatorCell`] exists per device. Command senders replace its
//! value; the render loop is its only reader and re-reads it before every
//! frame, so a new state interrupts whatever animation was in flight.

use core::{fmt, time::Duration};

use portable_atomic::{AtomicU8, Ordering};

use crate::clock::{Millis, duration_millis};

/// Full-scale channel intensity (13-bit PWM duty).
pub const MAX_DUTY: u16 = 8_191;
/// Render cadence for static and flashing states.
pub const RENDER_STEP: Duration = Duration::from_millis(100);
/// Time spent lit, then dark, while flashing.
pub const FLASH_HALF_PERIOD: Duration = Duration::from_millis(500);
/// Duty increment per pulsation step.
pub const PULSE_STEP: u16 = 50;
/// Delay between pulsation steps.
pub const PULSE_STEP_DELAY: Duration = Duration::from_millis(40);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Color {
    Red = 0,
    Green = 1,
    Blue = 2,
    White = 3,
}

impl Color {
    pub const ALL: [Color; 4] = [Color::Red, Color::Green, Color::Blue, Color::White];

    /// Full-brightness output for this color.
    pub const fn full(self) -> Rgb {
        match self {
            Color::Red => Rgb::new(MAX_DUTY, 0, 0),
            Color::Green => Rgb::new(0, MAX_DUTY, 0),
            Color::Blue => Rgb::new(0, 0, MAX_DUTY),
            Color::White => Rgb::new(MAX_DUTY, MAX_DUTY, MAX_DUTY),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Color::Red => "RED",
            Color::Green => "GREEN",
            Color::Blue => "BLUE",
            Color::White => "WHITE",
        }
    }

    const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Color::Red,
            1 => Color::Green,
            2 => Color::Blue,
            _ => Color::White,
        }
    }
}

/// Visual state shown by the indicator.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum IndicatorState {
    #[default]
    Off,
    Solid(Color),
    Flashing(Color),
    Pulsating(Color),
}

impl IndicatorState {
    /// Packs the state into one byte: pattern in bits 2..4, color in bits 0..2.
    pub const fn encode(self) -> u8 {
        match self {
            IndicatorState::Off => 0,
            IndicatorState::Solid(color) => 0b0100 | color as u8,
            IndicatorState::Flashing(color) => 0b1000 | color as u8,
            IndicatorState::Pulsating(color) => 0b1100 | color as u8,
        }
    }

    pub const fn decode(raw: u8) -> Self {
        let color = Color::from_bits(raw);
        match (raw >> 2) & 0b11 {
            1 => IndicatorState::Solid(color),
            2 => IndicatorState::Flashing(color),
            3 => IndicatorState::Pulsating(color),
            _ => IndicatorState::Off,
        }
    }

    pub const fn color(self) -> Option<Color> {
        match self {
            IndicatorState::Off => None,
            IndicatorState::Solid(color)
            | IndicatorState::Flashing(color)
            | IndicatorState::Pulsating(color) => Some(color),
        }
    }
}

impl fmt::Display for IndicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorState::Off => f.write_str("LED_OFF"),
            IndicatorState::Solid(color) => write!(f, "LED_{}", color.as_str()),
            IndicatorState::Flashing(color) => write!(f, "LED_FLASHING_{}", color.as_str()),
            IndicatorState::Pulsating(color) => write!(f, "LED_PULSATING_{}", color.as_str()),
        }
    }
}

/// Single-writer/single-reader cell holding the current [`IndicatorState`].
///
/// The state fits in one byte, so a plain atomic store replaces it without a
/// lock and the render loop can never observe a torn value.
#[derive(Debug)]
pub struct IndicatorCell {
    raw: AtomicU8,
}

impl IndicatorCell {
    pub const fn new(initial: IndicatorState) -> Self {
        Self {
            raw: AtomicU8::new(initial.encode()),
        }
    }

    /// Replaces the current state. Always succeeds and never waits.
    pub fn set_state(&self, state: IndicatorState) {
        self.raw.store(state.encode(), Ordering::Release);
    }

    pub fn current(&self) -> IndicatorState {
        IndicatorState::decode(self.raw.load(Ordering::Acquire))
    }
}

impl Default for IndicatorCell {
    fn default() -> Self {
        Self::new(IndicatorState::Off)
    }
}

/// Per-channel intensities in `0..=MAX_DUTY`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Rgb {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
}

impl Rgb {
    pub const OFF: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(red: u16, green: u16, blue: u16) -> Self {
        Self { red, green, blue }
    }

    /// Scales every channel by `duty / MAX_DUTY`.
    pub fn scaled(self, duty: u16) -> Self {
        let duty = u32::from(duty.min(MAX_DUTY));
        let scale = |channel: u16| {
            let value = u32::from(channel) * duty / u32::from(MAX_DUTY);
            u16::try_from(value).unwrap_or(MAX_DUTY)
        };
        Self::new(scale(self.red), scale(self.green), scale(self.blue))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelId {
    Red,
    Green,
    Blue,
}

/// Failure reported by the pixel/PWM output.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PixelError {
    /// The bus or peripheral rejected the write.
    Bus,
    /// The transfer did not complete in time.
    Timeout,
}

impl fmt::Display for PixelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelError::Bus => f.write_str("pixel bus write failed"),
            PixelError::Timeout => f.write_str("pixel transfer timed out"),
        }
    }
}

/// Pixel strip or PWM output driving the indicator.
pub trait PixelDriver {
    /// Stages an intensity in `0..=MAX_DUTY` for one channel.
    fn set_channel(&mut self, channel: ChannelId, intensity: u16) -> Result<(), PixelError>;

    /// Latches staged intensities onto the output.
    fn commit(&mut self) -> Result<(), PixelError>;
}

/// Pixel driver that performs no hardware interaction.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopPixelDriver;

impl PixelDriver for NoopPixelDriver {
    fn set_channel(&mut self, _: ChannelId, _: u16) -> Result<(), PixelError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), PixelError> {
        Ok(())
    }
}

/// Writes all three channels and commits them.
pub fn write_rgb<D>(driver: &mut D, rgb: Rgb) -> Result<(), PixelError>
where
    D: PixelDriver + ?Sized,
{
    driver.set_channel(ChannelId::Red, rgb.red)?;
    driver.set_channel(ChannelId::Green, rgb.green)?;
    driver.set_channel(ChannelId::Blue, rgb.blue)?;
    driver.commit()
}

/// One render step: what to write (if anything) and how long to wait afterwards.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub output: Option<Rgb>,
    pub hold: Duration,
}

impl Frame {
    /// Writes the frame's output, if any.
    pub fn apply<D>(&self, driver: &mut D) -> Result<(), PixelError>
    where
        D: PixelDriver + ?Sized,
    {
        match self.output {
            Some(rgb) => write_rgb(driver, rgb),
            None => Ok(()),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Static { written: bool },
    Flash { lit: bool, elapsed: Millis },
    Pulse { duty: u16, rising: bool },
}

impl Phase {
    const fn start(state: IndicatorState) -> Self {
        match state {
            IndicatorState::Off | IndicatorState::Solid(_) => Phase::Static { written: false },
            IndicatorState::Flashing(_) => Phase::Flash {
                lit: true,
                elapsed: 0,
            },
            IndicatorState::Pulsating(_) => Phase::Pulse {
                duty: 0,
                rising: true,
            },
        }
    }
}

/// Stateless-per-call frame generator for the render loop.
///
/// Call [`Renderer::step`] with the freshly read state at the top of every
/// cycle; a state that differs from the previous call restarts the pattern.
#[derive(Clone, Debug)]
pub struct Renderer {
    applied: Option<IndicatorState>,
    phase: Phase,
}

impl Renderer {
    pub const fn new() -> Self {
        Self {
            applied: None,
            phase: Phase::Static { written: false },
        }
    }

    /// State rendered by the most recent step.
    pub fn applied(&self) -> Option<IndicatorState> {
        self.applied
    }

    /// Re-arms the single write of a static state after a failed apply.
    /// Animated states keep their phase; the next step carries on from it.
    pub fn invalidate(&mut self) {
        if let Phase::Static { written } = &mut self.phase {
            *written = false;
        }
    }

    pub fn step(&mut self, state: IndicatorState) -> Frame {
        if self.applied != Some(state) {
            self.applied = Some(state);
            self.phase = Phase::start(state);
        }

        let render_step = duration_millis(RENDER_STEP);
        let half_period = duration_millis(FLASH_HALF_PERIOD);

        match (&mut self.phase, state.color()) {
            (Phase::Static { written }, color) => {
                let output = if *written {
                    None
                } else {
                    *written = true;
                    Some(color.map_or(Rgb::OFF, Color::full))
                };
                Frame {
                    output,
                    hold: RENDER_STEP,
                }
            }
            (Phase::Flash { lit, elapsed }, Some(color)) => {
                let output = (*elapsed == 0).then(|| if *lit { color.full() } else { Rgb::OFF });
                *elapsed += render_step;
                if *elapsed >= half_period {
                    *elapsed = 0;
                    *lit = !*lit;
                }
                Frame {
                    output,
                    hold: RENDER_STEP,
                }
            }
            (Phase::Pulse { duty, rising }, Some(color)) => {
                let output = Some(color.full().scaled(*duty));
                if *rising {
                    *duty = duty.saturating_add(PULSE_STEP).min(MAX_DUTY);
                    if *duty == MAX_DUTY {
                        *rising = false;
                    }
                } else {
                    *duty = duty.saturating_sub(PULSE_STEP);
                    if *duty == 0 {
                        *rising = true;
                    }
                }
                Frame {
                    output,
                    hold: PULSE_STEP_DELAY,
                }
            }
            // Animated phases always carry a color.
            (_, None) => Frame {
                output: Some(Rgb::OFF),
                hold: RENDER_STEP,
            },
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Vec;

    #[derive(Default)]
    struct RecordingDriver {
        staged: Rgb,
        committed: Vec<Rgb, 64>,
        fail_next_commit: bool,
    }

    impl PixelDriver for RecordingDriver {
        fn set_channel(&mut self, channel: ChannelId, intensity: u16) -> Result<(), PixelError> {
            match channel {
                ChannelId::Red => self.staged.red = intensity,
                ChannelId::Green => self.staged.green = intensity,
                ChannelId::Blue => self.staged.blue = intensity,
            }
            Ok(())
        }

        fn commit(&mut self) -> Result<(), PixelError> {
            if core::mem::take(&mut self.fail_next_commit) {
                return Err(PixelError::Bus);
            }
            let _ = self.committed.push(self.staged);
            Ok(())
        }
    }

    #[test]
    fn cell_round_trips_every_state() {
        let cell = IndicatorCell::default();
        assert_eq!(cell.current(), IndicatorState::Off);

        for color in Color::ALL {
            for state in [
                IndicatorState::Solid(color),
                IndicatorState::Flashing(color),
                IndicatorState::Pulsating(color),
            ] {
                cell.set_state(state);
                assert_eq!(cell.current(), state);
            }
        }
    }

    #[test]
    fn static_state_writes_once() {
        let mut renderer = Renderer::new();
        let state = IndicatorState::Solid(Color::Green);

        let first = renderer.step(state);
        assert_eq!(first.output, Some(Color::Green.full()));
        assert_eq!(first.hold, RENDER_STEP);

        for _ in 0..5 {
            assert_eq!(renderer.step(state).output, None);
        }
    }

    #[test]
    fn flashing_toggles_every_half_period() {
        let mut renderer = Renderer::new();
        let state = IndicatorState::Flashing(Color::Red);
        let steps_per_half = (FLASH_HALF_PERIOD.as_millis() / RENDER_STEP.as_millis()) as usize;

        let mut outputs: Vec<Rgb, 8> = Vec::new();
        for _ in 0..steps_per_half * 4 {
            if let Some(rgb) = renderer.step(state).output {
                outputs.push(rgb).unwrap();
            }
        }

        assert_eq!(
            outputs.as_slice(),
            &[Color::Red.full(), Rgb::OFF, Color::Red.full(), Rgb::OFF]
        );
    }

    #[test]
    fn pulsating_ramps_up_then_down() {
        let mut renderer = Renderer::new();
        let state = IndicatorState::Pulsating(Color::Blue);

        let mut peak = 0;
        let mut reached_peak_at = None;
        let steps = usize::from(MAX_DUTY / PULSE_STEP) * 2 + 4;
        let mut last_blue = 0;
        for index in 0..steps {
            let frame = renderer.step(state);
            assert_eq!(frame.hold, PULSE_STEP_DELAY);
            let rgb = frame.output.expect("pulse writes every step");
            assert_eq!(rgb.red, 0);
            assert_eq!(rgb.green, 0);
            if rgb.blue > peak {
                peak = rgb.blue;
                reached_peak_at = Some(index);
            }
            last_blue = rgb.blue;
        }

        assert_eq!(peak, MAX_DUTY);
        assert!(reached_peak_at.is_some());
        assert!(last_blue < MAX_DUTY / 2, "ramp should be descending or restarted");
    }

    #[test]
    fn new_state_interrupts_running_animation() {
        let mut renderer = Renderer::new();
        for _ in 0..17 {
            renderer.step(IndicatorState::Pulsating(Color::White));
        }

        let frame = renderer.step(IndicatorState::Solid(Color::Blue));
        assert_eq!(frame.output, Some(Color::Blue.full()));
        assert_eq!(frame.hold, RENDER_STEP);
    }

    #[test]
    fn settled_output_matches_last_state_set() {
        let cell = IndicatorCell::default();
        let mut renderer = Renderer::new();
        let mut driver = RecordingDriver::default();

        let commands = [
            IndicatorState::Pulsating(Color::Red),
            IndicatorState::Flashing(Color::Green),
            IndicatorState::Pulsating(Color::White),
            IndicatorState::Solid(Color::Blue),
        ];

        for (round, state) in commands.iter().enumerate() {
            cell.set_state(*state);
            for _ in 0..=round * 3 {
                renderer.step(cell.current()).apply(&mut driver).unwrap();
            }
        }

        for _ in 0..3 {
            renderer.step(cell.current()).apply(&mut driver).unwrap();
        }

        assert_eq!(renderer.applied(), Some(IndicatorState::Solid(Color::Blue)));
        assert_eq!(driver.committed.last(), Some(&Color::Blue.full()));

        cell.set_state(IndicatorState::Off);
        renderer.step(cell.current()).apply(&mut driver).unwrap();
        assert_eq!(driver.committed.last(), Some(&Rgb::OFF));
    }

    #[test]
    fn write_failures_surface_without_poisoning_renderer() {
        let mut renderer = Renderer::new();
        let mut driver = RecordingDriver {
            fail_next_commit: true,
            ..RecordingDriver::default()
        };

        let state = IndicatorState::Flashing(Color::White);
        assert_eq!(
            renderer.step(state).apply(&mut driver),
            Err(PixelError::Bus)
        );
        for _ in 0..5 {
            renderer.step(state).apply(&mut driver).unwrap();
        }
        assert_eq!(driver.committed.as_slice(), &[Rgb::OFF]);
    }

    #[test]
    fn failed_static_write_is_retried() {
        let mut renderer = Renderer::new();
        let mut driver = RecordingDriver {
            fail_next_commit: true,
            ..RecordingDriver::default()
        };
        let state = IndicatorState::Solid(Color::Green);

        assert!(renderer.step(state).apply(&mut driver).is_err());
        renderer.invalidate();
        renderer.step(state).apply(&mut driver).unwrap();
        assert_eq!(renderer.step(state).output, None);
        assert_eq!(driver.committed.as_slice(), &[Color::Green.full()]);
    }

    #[test]
    fn failed_pulse_write_keeps_ramp_advancing() {
        let mut renderer = Renderer::new();
        let mut driver = RecordingDriver::default();
        let state = IndicatorState::Pulsating(Color::Red);

        for _ in 0..4 {
            renderer.step(state).apply(&mut driver).unwrap();
        }
        let before = driver.committed.last().copied().unwrap();
        assert!(before.red > 0);

        driver.fail_next_commit = true;
        assert!(renderer.step(state).apply(&mut driver).is_err());
        renderer.invalidate();

        renderer.step(state).apply(&mut driver).unwrap();
        let after = driver.committed.last().copied().unwrap();
        assert_eq!(after.red, before.red + 2 * PULSE_STEP);
        assert_eq!(renderer.applied(), Some(state));
    }

    #[test]
    fn scaled_intensity_is_proportional() {
        let half = Color::White.full().scaled(MAX_DUTY / 2);
        assert_eq!(half.red, MAX_DUTY / 2);
        assert_eq!(Color::Red.full().scaled(0), Rgb::OFF);
        assert_eq!(Color::Red.full().scaled(u16::MAX), Color::Red.full());
    }

    #[test]
    fn display_uses_command_names() {
        let mut text: heapless::String<32> = heapless::String::new();
        core::fmt::write(&mut text, format_args!("{}", IndicatorState::Flashing(Color::Red)))
            .unwrap();
        assert_eq!(text.as_str(), "LED_FLASHING_RED");
    }
}

//! Indicator command intake and the render loop.

use embassy_time::Timer;
use node_core::indicator::{Frame, IndicatorState, PixelDriver, PixelError, Renderer};

use crate::fabric::Fabric;
use crate::time::core_duration_to_embassy;

/// Applies queued commands to the shared indicator cell; the last one wins.
pub async fn run_commands(fabric: &Fabric) -> ! {
    loop {
        let state = fabric.indicator_commands.receive().await;
        apply_command(fabric, state);
    }
}

pub fn apply_command(fabric: &Fabric, state: IndicatorState) {
    if fabric.indicator.current() != state {
        log_state_change(state);
    }
    fabric.indicator.set_state(state);
}

/// Drives the pixel from the shared indicator cell.
pub struct IndicatorRenderer<D> {
    renderer: Renderer,
    driver: D,
    failures: u32,
}

impl<D> IndicatorRenderer<D>
where
    D: PixelDriver,
{
    pub const fn new(driver: D) -> Self {
        Self {
            renderer: Renderer::new(),
            driver,
            failures: 0,
        }
    }

    /// Renders one frame for the current state and returns it.
    pub fn render(&mut self, fabric: &Fabric) -> Frame {
        let frame = self.renderer.step(fabric.indicator.current());
        if let Err(err) = frame.apply(&mut self.driver) {
            self.renderer.invalidate();
            self.failures = self.failures.saturating_add(1);
            log_pixel_failure(err, self.failures);
        }
        frame
    }

    /// Pixel writes that failed since startup.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub async fn run(mut self, fabric: &Fabric) -> ! {
        loop {
            let frame = self.render(fabric);
            Timer::after(core_duration_to_embassy(frame.hold)).await;
        }
    }
}

#[cfg(target_os = "none")]
fn log_state_change(state: IndicatorState) {
    defmt::info!("indicator -> {}", defmt::Display2Format(&state));
}

#[cfg(not(target_os = "none"))]
fn log_state_change(state: IndicatorState) {
    println!("indicator -> {state}");
}

#[cfg(target_os = "none")]
fn log_pixel_failure(err: PixelError, failures: u32) {
    defmt::warn!(
        "pixel write failed: {} ({=u32} failures)",
        defmt::Display2Format(&err),
        failures
    );
}

#[cfg(not(target_os = "none"))]
fn log_pixel_failure(err: PixelError, failures: u32) {
    println!("pixel write failed: {err} ({failures} failures)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_core::indicator::{ChannelId, Color, Rgb};

    #[derive(Default)]
    struct FlakyPixel {
        channels: [u16; 3],
        shown: Rgb,
        fail_commits: u32,
    }

    impl PixelDriver for FlakyPixel {
        fn set_channel(&mut self, channel: ChannelId, intensity: u16) -> Result<(), PixelError> {
            let index = match channel {
                ChannelId::Red => 0,
                ChannelId::Green => 1,
                ChannelId::Blue => 2,
            };
            self.channels[index] = intensity;
            Ok(())
        }

        fn commit(&mut self) -> Result<(), PixelError> {
            if self.fail_commits > 0 {
                self.fail_commits -= 1;
                return Err(PixelError::Bus);
            }
            self.shown = Rgb::new(self.channels[0], self.channels[1], self.channels[2]);
            Ok(())
        }
    }

    #[test]
    fn last_command_wins() {
        static FABRIC: Fabric = Fabric::new();
        for state in [
            IndicatorState::Pulsating(Color::Blue),
            IndicatorState::Flashing(Color::Red),
            IndicatorState::Solid(Color::Green),
        ] {
            assert!(FABRIC.indicator_commands.sender().try_send(state).is_ok());
        }
        while let Some(state) = FABRIC.indicator_commands.try_receive() {
            apply_command(&FABRIC, state);
        }

        let mut renderer = IndicatorRenderer::new(FlakyPixel::default());
        renderer.render(&FABRIC);
        assert_eq!(renderer.driver().shown, Color::Green.full());
    }

    #[test]
    fn pixel_failure_is_logged_and_rendering_continues() {
        static FABRIC: Fabric = Fabric::new();
        apply_command(&FABRIC, IndicatorState::Solid(Color::Red));

        let mut renderer = IndicatorRenderer::new(FlakyPixel {
            fail_commits: 1,
            ..FlakyPixel::default()
        });
        renderer.render(&FABRIC);
        assert_eq!(renderer.failures(), 1);
        assert_eq!(renderer.driver().shown, Rgb::OFF);

        // The failed frame is written again on the next cycle.
        let frame = renderer.render(&FABRIC);
        assert_eq!(frame.output, Some(Color::Red.full()));
        assert_eq!(renderer.driver().shown, Color::Red.full());
    }

    #[test]
    fn pulse_keeps_ramping_through_pixel_failures() {
        static FABRIC: Fabric = Fabric::new();
        apply_command(&FABRIC, IndicatorState::Pulsating(Color::White));

        let mut renderer = IndicatorRenderer::new(FlakyPixel::default());
        for _ in 0..3 {
            renderer.render(&FABRIC);
        }
        let before = renderer.driver().shown.green;

        renderer.driver.fail_commits = 1;
        renderer.render(&FABRIC);
        assert_eq!(renderer.failures(), 1);

        renderer.render(&FABRIC);
        assert!(renderer.driver().shown.green > before);
    }
}

//! Motion interrupt entry point and the motion lighting worker.

use embassy_time::{Duration, with_timeout};
use node_core::clock::Millis;
use node_core::config::Timing;
use node_core::debounce::{EdgeOutcome, MotionEvent};
use node_core::indicator::{Color, IndicatorState};
use node_core::motion::MotionLight;

use crate::fabric::Fabric;
use crate::time::{core_duration_to_embassy, now_ms};

/// Call from the motion sensor's rising-edge interrupt.
pub fn on_motion_edge(fabric: &Fabric, now: Millis) -> EdgeOutcome {
    let outcome = fabric.motion.on_edge(now);
    if let EdgeOutcome::Dropped(event) = outcome {
        log_motion_lost(event, fabric.motion.lost());
    }
    outcome
}

/// Turns accepted motion into indicator commands.
pub struct MotionWorker {
    light: MotionLight,
    send_deadline: Duration,
}

impl MotionWorker {
    pub fn new(color: Color, timing: &Timing) -> Self {
        Self {
            light: MotionLight::new(color, timing),
            send_deadline: core_duration_to_embassy(timing.send_deadline),
        }
    }

    /// Handles one accepted event and returns the command to send.
    pub fn on_event(&mut self, fabric: &Fabric, event: MotionEvent) -> IndicatorState {
        let total = fabric.record_motion();
        log_motion(event, total);
        self.light.on_motion(event)
    }

    /// Returns the command to send once the hold time has expired.
    pub fn poll(&mut self, now: Millis) -> Option<IndicatorState> {
        self.light.poll(now)
    }

    pub fn light(&self) -> &MotionLight {
        &self.light
    }

    pub async fn run(mut self, fabric: &Fabric) -> ! {
        let events = fabric.motion.producer();
        loop {
            let received = match self.light.remaining(now_ms()) {
                Some(remaining) => {
                    with_timeout(Duration::from_millis(remaining.into()), events.receive())
                        .await
                        .ok()
                }
                None => Some(events.receive().await),
            };

            if let Some(event) = received {
                let command = self.on_event(fabric, event);
                self.send(fabric, command).await;
            }
            if let Some(command) = self.poll(now_ms()) {
                self.send(fabric, command).await;
            }
        }
    }

    async fn send(&self, fabric: &Fabric, command: IndicatorState) {
        if fabric
            .indicator_commands
            .send_within(command, self.send_deadline)
            .await
            .is_err()
        {
            let total = fabric.dropped.record();
            log_command_dropped(command, total);
        }
    }
}

#[cfg(target_os = "none")]
fn log_motion_lost(event: MotionEvent, lost: u32) {
    defmt::warn!(
        "motion queue full; event at {=u32} ms lost ({=u32} total)",
        event.timestamp,
        lost
    );
}

#[cfg(not(target_os = "none"))]
fn log_motion_lost(event: MotionEvent, lost: u32) {
    println!(
        "motion queue full; event at {} ms lost ({lost} total)",
        event.timestamp
    );
}

#[cfg(target_os = "none")]
fn log_motion(event: MotionEvent, total: u32) {
    defmt::info!("motion at {=u32} ms ({=u32} total)", event.timestamp, total);
}

#[cfg(not(target_os = "none"))]
fn log_motion(event: MotionEvent, total: u32) {
    println!("motion at {} ms ({total} total)", event.timestamp);
}

#[cfg(target_os = "none")]
fn log_command_dropped(command: IndicatorState, total: u32) {
    defmt::warn!(
        "indicator queue busy; dropped {} ({=u32} dropped)",
        defmt::Display2Format(&command),
        total
    );
}

#[cfg(not(target_os = "none"))]
fn log_command_dropped(command: IndicatorState, total: u32) {
    println!("indicator queue busy; dropped {command} ({total} dropped)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_burst_yields_single_light_command() {
        static FABRIC: Fabric = Fabric::with_debounce(1_000);
        let mut worker = MotionWorker::new(Color::White, &Timing::default());

        on_motion_edge(&FABRIC, 10);
        on_motion_edge(&FABRIC, 400);
        on_motion_edge(&FABRIC, 900);

        let event = FABRIC.motion.producer().try_receive().expect("one event");
        assert!(FABRIC.motion.producer().try_receive().is_none());
        assert_eq!(
            worker.on_event(&FABRIC, event),
            IndicatorState::Solid(Color::White)
        );
        assert_eq!(FABRIC.motion_events(), 1);

        assert_eq!(worker.poll(500), None);
        assert_eq!(worker.poll(1_010), Some(IndicatorState::Off));
        assert_eq!(worker.poll(2_000), None);
    }

    #[test]
    fn fresh_motion_extends_hold() {
        static FABRIC: Fabric = Fabric::with_debounce(1_000);
        let mut worker = MotionWorker::new(Color::Blue, &Timing::default());

        worker.on_event(&FABRIC, MotionEvent { timestamp: 0 });
        worker.on_event(&FABRIC, MotionEvent { timestamp: 800 });

        assert_eq!(worker.poll(1_000), None);
        assert_eq!(worker.light().remaining(1_000), Some(800));
        assert_eq!(worker.poll(1_800), Some(IndicatorState::Off));
        assert_eq!(FABRIC.motion_events(), 2);
    }
}

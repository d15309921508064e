//! Status worker: door polling plus periodic and on-demand reports.

use embassy_futures::select::{Either3, select3};
use embassy_time::{Duration, Timer};
use node_core::boot::{BootKind, PartitionId};
use node_core::clock::Millis;
use node_core::config::DeviceConfig;
use node_core::session::Publish;
use node_core::status::{DeviceSnapshot, DoorSensors, DoorStatus, ReportSummary, StatusReporter};

use crate::fabric::Fabric;
use crate::time::{core_duration_to_embassy, now_ms, uptime_ms};

pub struct StatusWorker<D, P> {
    fabric: &'static Fabric,
    reporter: StatusReporter,
    door: D,
    publisher: P,
    running_partition: Option<PartitionId>,
    poll_interval: Duration,
}

impl<D, P> StatusWorker<D, P>
where
    D: DoorSensors,
    P: Publish,
{
    pub fn new(
        fabric: &'static Fabric,
        config: &DeviceConfig,
        door: D,
        publisher: P,
        running_partition: Option<PartitionId>,
    ) -> Self {
        Self {
            fabric,
            reporter: StatusReporter::new(config),
            door,
            publisher,
            running_partition,
            poll_interval: core_duration_to_embassy(config.timing.door_poll_interval),
        }
    }

    /// Queues the post-update confirmation when `kind` calls for one.
    pub fn note_boot(&mut self, kind: BootKind) {
        self.reporter.note_boot(kind);
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    pub fn snapshot(&self, uptime_ms: u64) -> DeviceSnapshot {
        DeviceSnapshot {
            uptime_ms,
            motion_events: self.fabric.motion_events(),
            dropped_events: self.fabric.dropped_events(),
            running_partition: self.running_partition,
        }
    }

    /// Samples the door, folds in pending requests, and publishes what is due.
    pub fn tick(&mut self, now: Millis, uptime_ms: u64) -> ReportSummary {
        if let Some(levels) = self.door.read() {
            let status = DoorStatus::from_sensors(levels.left, levels.right);
            if status != self.reporter.door_status() {
                log_door(status);
            }
            self.reporter.observe_door(status);
        }
        if self.fabric.telemetry_request.try_take().is_some() {
            self.reporter.request_telemetry();
        }
        if let Some(epoch) = self.fabric.worker_start.try_take() {
            log_session_started(epoch);
            self.reporter.on_session_started();
        }

        let snapshot = self.snapshot(uptime_ms);
        let summary = self.reporter.poll(
            now,
            self.fabric.session.view(),
            &snapshot,
            &mut self.publisher,
        );
        if summary.failed > 0 {
            log_report_failures(summary.failed);
        }
        summary
    }

    pub async fn run(mut self) -> ! {
        loop {
            self.tick(now_ms(), uptime_ms());
            // Wake early for requests so they are answered promptly.
            match select3(
                Timer::after(self.poll_interval),
                self.fabric.telemetry_request.wait(),
                self.fabric.worker_start.wait(),
            )
            .await
            {
                Either3::First(()) => {}
                Either3::Second(()) => self.reporter.request_telemetry(),
                Either3::Third(epoch) => {
                    log_session_started(epoch);
                    self.reporter.on_session_started();
                }
            }
        }
    }
}

#[cfg(target_os = "none")]
fn log_door(status: DoorStatus) {
    defmt::info!("door {=str}", status.as_str());
}

#[cfg(not(target_os = "none"))]
fn log_door(status: DoorStatus) {
    println!("door {}", status.as_str());
}

#[cfg(target_os = "none")]
fn log_session_started(epoch: u32) {
    defmt::debug!("status reporting for session {=u32}", epoch);
}

#[cfg(not(target_os = "none"))]
fn log_session_started(epoch: u32) {
    println!("status reporting for session {epoch}");
}

#[cfg(target_os = "none")]
fn log_report_failures(failed: u8) {
    defmt::warn!("{=u8} status messages not delivered; will retry", failed);
}

#[cfg(not(target_os = "none"))]
fn log_report_failures(failed: u8) {
    println!("{failed} status messages not delivered; will retry");
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use node_core::config::{BrokerEndpoint, Credentials, UpdateSource};
    use node_core::session::{BusError, Qos, SessionEvent, SessionSupervisor};
    use node_core::status::DoorLevels;
    use std::string::String;
    use std::vec::Vec;

    fn config() -> DeviceConfig {
        DeviceConfig::new(
            "coop",
            BrokerEndpoint {
                uri: "mqtts://broker.local:8883",
                credentials: Credentials {
                    client_cert: b"cert",
                    client_key: b"key",
                    broker_ca: b"ca",
                },
            },
            UpdateSource {
                url: "https://updates.local/coop.bin",
                root_ca: b"ca",
            },
        )
    }

    fn connect(fabric: &'static Fabric, config: &DeviceConfig) {
        let mut supervisor = SessionSupervisor::new(&fabric.session, &config.timing);
        supervisor.start();
        supervisor.handle(SessionEvent::LinkUp);
        supervisor.handle(SessionEvent::BusConnected);
    }

    #[test]
    fn nothing_published_while_disconnected() {
        static FABRIC: Fabric = Fabric::new();
        let config = config();
        let mut worker = StatusWorker::new(
            &FABRIC,
            &config,
            Door(DoorLevels {
                left: true,
                right: true,
            }),
            RecordingPublisher::default(),
            Some(PartitionId(0)),
        );

        let summary = worker.tick(0, 0);
        assert!(summary.skipped);
        assert!(worker.publisher().messages.is_empty());
        assert_eq!(worker.reporter().door_status(), DoorStatus::Closed);
    }

    #[test]
    fn session_start_publishes_telemetry_and_door() {
        static FABRIC: Fabric = Fabric::new();
        let config = config();
        let mut worker = StatusWorker::new(
            &FABRIC,
            &config,
            Door(DoorLevels {
                left: false,
                right: true,
            }),
            RecordingPublisher::default(),
            Some(PartitionId(1)),
        );
        connect(&FABRIC, &config);
        FABRIC.worker_start.signal(1);
        FABRIC.record_motion();

        worker.tick(1_000, 61_000);

        let topics: Vec<&str> = worker
            .publisher()
            .messages
            .iter()
            .map(|(topic, _)| topic.as_str())
            .collect();
        assert_eq!(
            topics,
            [
                config.topics.telemetry,
                config.topics.door,
                config.topics.motion,
                config.topics.heartbeat,
            ]
        );
        let telemetry = &worker.publisher().messages[0].1;
        assert!(telemetry.contains("uptime=61s motion=1 dropped=0 partition=ota_1"));
        assert!(worker.publisher().messages[1].1.contains("ERROR"));
    }

    struct Door(DoorLevels);

    impl DoorSensors for Door {
        fn read(&mut self) -> Option<DoorLevels> {
            Some(self.0)
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        messages: Vec<(String, String)>,
    }

    impl Publish for RecordingPublisher {
        fn publish(&mut self, topic: &str, payload: &[u8], _: Qos) -> Result<(), BusError> {
            let payload = String::from_utf8(payload.to_vec()).map_err(|_| BusError::Transport)?;
            self.messages.push((topic.into(), payload));
            Ok(())
        }
    }
}

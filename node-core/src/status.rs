//! Status publication.
//!
//! Every status message is a one-key JSON object, `{"<device-name>":"<text>"}`.
//! Publication is gated on [`SessionView::is_connected`]: while the session is
//! down, messages are skipped and anything that must eventually be reported
//! stays pending.

use core::fmt::{self, Write};

use heapless::String;

use crate::boot::{BootKind, PartitionId};
use crate::clock::{Millis, duration_millis, has_elapsed};
use crate::config::{DeviceConfig, Timing, Topics};
use crate::session::{BusError, Publish, Qos, SessionView};

/// Capacity of a rendered status payload.
pub const STATUS_CAPACITY: usize = 160;

pub type StatusPayload = String<STATUS_CAPACITY>;

/// Raised when a status message does not fit [`STATUS_CAPACITY`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusOverflow;

impl fmt::Display for StatusOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("status message exceeds payload capacity")
    }
}

struct JsonEscaped<'a>(&'a mut StatusPayload);

impl Write for JsonEscaped<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for ch in s.chars() {
            let pushed = match ch {
                '"' => self.0.push_str("\\\"").is_ok(),
                '\\' => self.0.push_str("\\\\").is_ok(),
                '\n' => self.0.push_str("\\n").is_ok(),
                '\r' => self.0.push_str("\\r").is_ok(),
                '\t' => self.0.push_str("\\t").is_ok(),
                ch if u32::from(ch) < 0x20 => write!(self.0, "\\u{:04x}", u32::from(ch)).is_ok(),
                ch => self.0.push(ch).is_ok(),
            };
            if !pushed {
                return Err(fmt::Error);
            }
        }
        Ok(())
    }
}

/// Renders `{"<device>":"<message>"}` with both strings JSON-escaped.
pub fn render_status(device: &str, message: fmt::Arguments<'_>) -> Result<StatusPayload, StatusOverflow> {
    let mut payload = StatusPayload::new();
    payload.push_str("{\"").map_err(|_| StatusOverflow)?;
    JsonEscaped(&mut payload)
        .write_str(device)
        .map_err(|_| StatusOverflow)?;
    payload.push_str("\":\"").map_err(|_| StatusOverflow)?;
    JsonEscaped(&mut payload)
        .write_fmt(message)
        .map_err(|_| StatusOverflow)?;
    payload.push_str("\"}").map_err(|_| StatusOverflow)?;
    Ok(payload)
}

/// Outcome of a gated publish.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Delivery {
    Sent,
    /// Session was down; nothing was attempted.
    Skipped,
    Failed(BusError),
    Overflow,
}

impl Delivery {
    pub const fn is_sent(self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

/// Publishes a status message when the session is connected.
pub fn publish_status<P>(
    publisher: &mut P,
    session: SessionView<'_>,
    device: &str,
    topic: &str,
    message: fmt::Arguments<'_>,
) -> Delivery
where
    P: Publish + ?Sized,
{
    if !session.is_connected() {
        return Delivery::Skipped;
    }
    let Ok(payload) = render_status(device, message) else {
        return Delivery::Overflow;
    };
    match publisher.publish(topic, payload.as_bytes(), Qos::AtMostOnce) {
        Ok(()) => Delivery::Sent,
        Err(err) => Delivery::Failed(err),
    }
}

/// Combined reading of the two door sensors.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DoorStatus {
    #[default]
    Unknown,
    Open,
    Closed,
    /// Sensors disagree.
    Error,
}

impl DoorStatus {
    /// Equal readings are closed when high and open when low; a mismatch is an error.
    pub const fn from_sensors(left: bool, right: bool) -> Self {
        match (left, right) {
            (true, true) => DoorStatus::Closed,
            (false, false) => DoorStatus::Open,
            _ => DoorStatus::Error,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DoorStatus::Unknown => "UNKNOWN",
            DoorStatus::Open => "OPEN",
            DoorStatus::Closed => "CLOSED",
            DoorStatus::Error => "ERROR",
        }
    }
}

/// Raw levels of the two door sensors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DoorLevels {
    pub left: bool,
    pub right: bool,
}

/// Door sensor inputs; `None` means no sensors are fitted.
pub trait DoorSensors {
    fn read(&mut self) -> Option<DoorLevels>;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct NoopDoorSensors;

impl DoorSensors for NoopDoorSensors {
    fn read(&mut self) -> Option<DoorLevels> {
        None
    }
}

/// Counters folded into telemetry messages.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceSnapshot {
    pub uptime_ms: u64,
    pub motion_events: u32,
    pub dropped_events: u32,
    pub running_partition: Option<PartitionId>,
}

/// Messages published during one [`StatusReporter::poll`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReportSummary {
    pub sent: u8,
    pub failed: u8,
    pub skipped: bool,
}

/// Decides which status messages are due and publishes them.
#[derive(Debug)]
pub struct StatusReporter {
    device: &'static str,
    topics: Topics,
    door_republish: Millis,
    heartbeat_interval: Millis,
    door_observed: DoorStatus,
    door_reported: Option<(DoorStatus, Millis)>,
    heartbeat_at: Option<Millis>,
    motion_reported: u32,
    telemetry_pending: bool,
    boot_pending: Option<BootKind>,
}

impl StatusReporter {
    pub fn new(config: &DeviceConfig) -> Self {
        Self::with_parts(config.device_name, config.topics, &config.timing)
    }

    pub fn with_parts(device: &'static str, topics: Topics, timing: &Timing) -> Self {
        Self {
            device,
            topics,
            door_republish: duration_millis(timing.door_republish_interval),
            heartbeat_interval: duration_millis(timing.heartbeat_interval),
            door_observed: DoorStatus::Unknown,
            door_reported: None,
            heartbeat_at: None,
            motion_reported: 0,
            telemetry_pending: false,
            boot_pending: None,
        }
    }

    /// Records the boot classification; a post-update boot is confirmed once.
    pub fn note_boot(&mut self, kind: BootKind) {
        if kind.is_post_update() {
            self.boot_pending = Some(kind);
        }
    }

    pub fn observe_door(&mut self, status: DoorStatus) {
        self.door_observed = status;
    }

    pub fn request_telemetry(&mut self) {
        self.telemetry_pending = true;
    }

    /// Called when workers start for a new connection.
    pub fn on_session_started(&mut self) {
        self.telemetry_pending = true;
        self.heartbeat_at = None;
    }

    pub fn door_status(&self) -> DoorStatus {
        self.door_observed
    }

    pub fn has_pending(&self) -> bool {
        self.telemetry_pending || self.boot_pending.is_some()
    }

    /// Publishes everything that is due at `now`.
    pub fn poll<P>(
        &mut self,
        now: Millis,
        session: SessionView<'_>,
        snapshot: &DeviceSnapshot,
        publisher: &mut P,
    ) -> ReportSummary
    where
        P: Publish + ?Sized,
    {
        let mut summary = ReportSummary::default();
        if !session.is_connected() {
            summary.skipped = true;
            return summary;
        }

        let device = self.device;
        let topics = self.topics;
        let record = |summary: &mut ReportSummary, delivery: Delivery| {
            match delivery {
                Delivery::Sent => summary.sent = summary.sent.saturating_add(1),
                Delivery::Skipped => summary.skipped = true,
                Delivery::Failed(_) | Delivery::Overflow => {
                    summary.failed = summary.failed.saturating_add(1);
                }
            }
            delivery.is_sent()
        };

        if let Some(BootKind::PostUpdate { previous, running }) = self.boot_pending {
            let delivery = publish_status(
                publisher,
                session,
                device,
                topics.update_progress,
                format_args!("update confirmed: {previous} -> {running}"),
            );
            if record(&mut summary, delivery) {
                self.boot_pending = None;
            }
        }

        if self.telemetry_pending {
            let delivery = publish_telemetry(publisher, session, device, &topics, snapshot, session.reconnects());
            if record(&mut summary, delivery) {
                self.telemetry_pending = false;
            }
        }

        if self.door_due(now) {
            let status = self.door_observed;
            let delivery = publish_status(
                publisher,
                session,
                device,
                topics.door,
                format_args!("{}", status.as_str()),
            );
            if record(&mut summary, delivery) {
                self.door_reported = Some((status, now));
            }
        }

        if snapshot.motion_events != self.motion_reported {
            let delivery = publish_status(
                publisher,
                session,
                device,
                topics.motion,
                format_args!("DETECTED ({} total)", snapshot.motion_events),
            );
            if record(&mut summary, delivery) {
                self.motion_reported = snapshot.motion_events;
            }
        }

        let heartbeat_due = self
            .heartbeat_at
            .is_none_or(|at| has_elapsed(now, at, self.heartbeat_interval));
        if heartbeat_due {
            let delivery = publish_status(
                publisher,
                session,
                device,
                topics.heartbeat,
                format_args!("alive"),
            );
            if record(&mut summary, delivery) {
                self.heartbeat_at = Some(now);
            }
        }

        summary
    }

    fn door_due(&self, now: Millis) -> bool {
        if self.door_observed == DoorStatus::Unknown {
            return false;
        }
        match self.door_reported {
            None => true,
            Some((reported, _)) if reported != self.door_observed => true,
            Some((_, at)) => has_elapsed(now, at, self.door_republish),
        }
    }
}

/// Publishes a telemetry line built from `snapshot`.
pub fn publish_telemetry<P>(
    publisher: &mut P,
    session: SessionView<'_>,
    device: &str,
    topics: &Topics,
    snapshot: &DeviceSnapshot,
    reconnects: u32,
) -> Delivery
where
    P: Publish + ?Sized,
{
    let uptime = snapshot.uptime_ms / 1_000;
    match snapshot.running_partition {
        Some(partition) => publish_status(
            publisher,
            session,
            device,
            topics.telemetry,
            format_args!(
                "uptime={uptime}s motion={} dropped={} partition={partition} reconnects={reconnects}",
                snapshot.motion_events, snapshot.dropped_events
            ),
        ),
        None => publish_status(
            publisher,
            session,
            device,
            topics.telemetry,
            format_args!(
                "uptime={uptime}s motion={} dropped={} reconnects={reconnects}",
                snapshot.motion_events, snapshot.dropped_events
            ),
        ),
    }
}

/// Formats a duration as `hh:mm:ss`.
pub struct Hms(pub u64);

impl fmt::Display for Hms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0 / 1_000;
        write!(
            f,
            "{:02}:{:02}:{:02}",
            total / 3_600,
            (total / 60) % 60,
            total % 60
        )
    }
}

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use node_core::clock::Millis;
use node_core::command::parse_indicator;
use node_core::session::{BusFault, SessionEvent};
use node_core::status::DoorLevels;

use crate::sim::{SimDevice, default_config, transport_fault};

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "motion",
        "motion                         - raise one motion sensor edge",
    ),
    (
        "advance",
        "advance <ms|Ns>                - run the simulated clock forward",
    ),
    (
        "link",
        "link [on|off|drop]             - radio coverage, or a link-lost callback",
    ),
    (
        "broker",
        "broker [on|off]                - whether the broker accepts connections",
    ),
    (
        "bus",
        "bus [drop|error <code>|reject <rc>] - bus disconnect or error callbacks",
    ),
    (
        "publish",
        "publish <topic> [payload]      - deliver an inbound bus message",
    ),
    (
        "update",
        "update                         - publish on the update trigger topic",
    ),
    (
        "led",
        "led <LED_STATE>                - publish on the indicator topic",
    ),
    (
        "telemetry",
        "telemetry                      - publish on the telemetry request topic",
    ),
    (
        "door",
        "door [open|closed|error|none]  - set the door sensor levels",
    ),
    (
        "fetch",
        "fetch [chunks <n>|fail-begin <n>|fail-chunks <n>] - script the image server",
    ),
    (
        "status",
        "status                         - display node state",
    ),
    (
        "help",
        "help [topic]                   - show help for a command",
    ),
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranscriptProfile {
    Motion,
    Update,
    Recovery,
}

impl TranscriptProfile {
    pub fn log_path(self) -> &'static str {
        match self {
            TranscriptProfile::Motion => "transcripts/emulator-motion.log",
            TranscriptProfile::Update => "transcripts/emulator-update.log",
            TranscriptProfile::Recovery => "transcripts/emulator-recovery.log",
        }
    }

    pub fn header(self) -> &'static str {
        match self {
            TranscriptProfile::Motion => "Motion-light node emulator motion transcript",
            TranscriptProfile::Update => "Motion-light node emulator firmware update transcript",
            TranscriptProfile::Recovery => "Motion-light node emulator session recovery transcript",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        if tag.eq_ignore_ascii_case("motion") {
            Ok(Self::Motion)
        } else if tag.eq_ignore_ascii_case("update") {
            Ok(Self::Update)
        } else if tag.eq_ignore_ascii_case("recovery") {
            Ok(Self::Recovery)
        } else {
            Err(format!("Unknown transcript profile `{tag}`"))
        }
    }
}

pub struct Session {
    device: SimDevice,
    transcript: TranscriptLogger,
    boot: Vec<String>,
}

impl Session {
    pub fn new(profile: TranscriptProfile) -> io::Result<Self> {
        let mut transcript = TranscriptLogger::new(profile)?;
        let mut device = SimDevice::new(default_config());
        let boot = device.take_output();
        transcript.append_lines(device.now(), TranscriptRole::Emulator, &boot)?;
        Ok(Self {
            device,
            transcript,
            boot,
        })
    }

    /// Output from power-on, before any command.
    pub fn boot_lines(&self) -> &[String] {
        &self.boot
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        self.transcript
            .append_line(self.device.now(), TranscriptRole::Host, trimmed)?;

        let mut words = trimmed.split_whitespace();
        let command = words.next().unwrap_or_default().to_ascii_lowercase();
        let args: Vec<&str> = words.collect();
        let reply = match self.dispatch(&command, &args) {
            Ok(lines) => lines,
            Err(message) => vec![format!("ERR {message}")],
        };
        let mut lines = self.device.take_output();
        lines.extend(reply);

        self.transcript
            .append_lines(self.device.now(), TranscriptRole::Emulator, &lines)?;
        Ok(lines)
    }

    fn dispatch(&mut self, command: &str, args: &[&str]) -> Result<Vec<String>, String> {
        match (command, args) {
            ("help", []) => Ok(help_overview()),
            ("help", [topic]) => Ok(help_topic(topic)),
            ("status", []) => Ok(self.device.describe()),
            ("motion", []) => {
                self.device.motion_edge();
                Ok(Vec::new())
            }
            ("advance", [amount]) => {
                let ms = parse_millis(amount)?;
                self.device.advance(ms);
                Ok(vec![format!("clock +{} ms", self.device.now())])
            }
            ("link", [mode]) => self.handle_link(mode),
            ("broker", [mode]) => {
                self.device.set_broker_available(parse_switch(mode)?);
                Ok(Vec::new())
            }
            ("bus", args) => self.handle_bus(args),
            ("publish", [topic, payload @ ..]) => {
                let payload = payload.join(" ");
                self.device.inbound(topic, payload.as_bytes());
                Ok(Vec::new())
            }
            ("update", []) => {
                let topic = self.device.config().topics.update_trigger;
                self.device.inbound(topic, b"");
                Ok(Vec::new())
            }
            ("telemetry", []) => {
                let topic = self.device.config().topics.telemetry_request;
                self.device.inbound(topic, b"");
                Ok(Vec::new())
            }
            ("led", [state]) => {
                parse_indicator(state).map_err(|err| format!("syntax {err}"))?;
                let topic = self.device.config().topics.indicator;
                self.device.inbound(topic, state.as_bytes());
                Ok(Vec::new())
            }
            ("door", [position]) => {
                let levels = parse_door(position)?;
                self.device.set_door(levels);
                Ok(vec![format!("door sensors set to {position}")])
            }
            ("fetch", [setting, count]) => self.handle_fetch(setting, count),
            (other, _) if HELP_TOPICS.iter().any(|(name, _)| *name == other) => Err(format!(
                "syntax try `help {other}`"
            )),
            (other, _) => Err(format!("unknown command `{other}`")),
        }
    }

    fn handle_link(&mut self, mode: &str) -> Result<Vec<String>, String> {
        if mode.eq_ignore_ascii_case("drop") {
            self.device.session_event(SessionEvent::LinkDown);
        } else {
            self.device.set_link_available(parse_switch(mode)?);
        }
        Ok(Vec::new())
    }

    fn handle_bus(&mut self, args: &[&str]) -> Result<Vec<String>, String> {
        let event = match args {
            ["drop"] => SessionEvent::BusDisconnected,
            ["error", code] => SessionEvent::BusError(transport_fault(parse_code(code)?)),
            ["reject", rc] => {
                let return_code = rc
                    .parse::<u8>()
                    .map_err(|_| format!("syntax invalid return code `{rc}`"))?;
                SessionEvent::BusError(BusFault::BrokerRejected { return_code })
            }
            _ => return Err("syntax try `help bus`".to_string()),
        };
        self.device.session_event(event);
        Ok(Vec::new())
    }

    fn handle_fetch(&mut self, setting: &str, count: &str) -> Result<Vec<String>, String> {
        let value = count
            .parse::<u32>()
            .map_err(|_| format!("syntax invalid count `{count}`"))?;
        let fetch = &mut self.device.hw.fetch;
        match setting {
            "chunks" => fetch.image_chunks = value,
            "fail-begin" => fetch.fail_begins = value,
            "fail-chunks" => fetch.fail_chunks = value,
            _ => return Err("syntax try `help fetch`".to_string()),
        }
        Ok(vec![format!("image server {setting}={value}")])
    }
}

fn help_overview() -> Vec<String> {
    let mut lines = vec!["Available commands:".to_string()];
    for (_, detail) in HELP_TOPICS {
        lines.push(format!("  {detail}"));
    }
    lines.push("Type `help <topic>` for a specific command.".to_string());
    lines
}

fn help_topic(target: &str) -> Vec<String> {
    match HELP_TOPICS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(target))
    {
        Some((_, detail)) => vec![(*detail).to_string()],
        None => vec![
            format!("No help available for `{target}`."),
            format!("Available topics: {}", help_topic_list()),
        ],
    }
}

fn help_topic_list() -> String {
    HELP_TOPICS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Accepts `250`, `250ms`, or `3s`.
fn parse_millis(text: &str) -> Result<Millis, String> {
    let invalid = || format!("syntax invalid duration `{text}`");
    if let Some(seconds) = text.strip_suffix('s').filter(|rest| !rest.ends_with('m')) {
        let seconds = seconds.parse::<Millis>().map_err(|_| invalid())?;
        return seconds.checked_mul(1_000).ok_or_else(invalid);
    }
    text.strip_suffix("ms")
        .unwrap_or(text)
        .parse::<Millis>()
        .map_err(|_| invalid())
}

fn parse_switch(text: &str) -> Result<bool, String> {
    if text.eq_ignore_ascii_case("on") || text.eq_ignore_ascii_case("up") {
        Ok(true)
    } else if text.eq_ignore_ascii_case("off") || text.eq_ignore_ascii_case("down") {
        Ok(false)
    } else {
        Err(format!("syntax expected on|off, got `{text}`"))
    }
}

fn parse_code(text: &str) -> Result<i32, String> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => i32::from_str_radix(hex, 16),
        None => text.parse::<i32>(),
    };
    parsed.map_err(|_| format!("syntax invalid error code `{text}`"))
}

fn parse_door(text: &str) -> Result<Option<DoorLevels>, String> {
    let levels = |left, right| Some(DoorLevels { left, right });
    match text.to_ascii_lowercase().as_str() {
        "open" => Ok(levels(false, false)),
        "closed" => Ok(levels(true, true)),
        "error" => Ok(levels(false, true)),
        "none" => Ok(None),
        _ => Err(format!("syntax unknown door position `{text}`")),
    }
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(profile: TranscriptProfile) -> io::Result<Self> {
        let path = Path::new(profile.log_path());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };

        logger.write_header(profile)?;
        Ok(logger)
    }

    fn write_header(&mut self, profile: TranscriptProfile) -> io::Result<()> {
        writeln!(self.writer, "# {}", profile.header())?;
        writeln!(
            self.writer,
            "# Timestamps are simulated milliseconds since power-on"
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(&mut self, now: Millis, role: TranscriptRole, line: &str) -> io::Result<()> {
        writeln!(self.writer, "[+{now:>6} ms] {} {line}", role.prefix())?;
        self.writer.flush()
    }

    fn append_lines(
        &mut self,
        now: Millis,
        role: TranscriptRole,
        lines: &[String],
    ) -> io::Result<()> {
        for line in lines {
            self.append_line(now, role, line)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_millis("250"), Ok(250));
        assert_eq!(parse_millis("250ms"), Ok(250));
        assert_eq!(parse_millis("3s"), Ok(3_000));
        assert!(parse_millis("soon").is_err());
    }

    #[test]
    fn door_positions_map_to_sensor_levels() {
        assert_eq!(
            parse_door("closed"),
            Ok(Some(DoorLevels {
                left: true,
                right: true
            }))
        );
        assert_eq!(parse_door("none"), Ok(None));
        assert!(parse_door("ajar").is_err());
    }

    #[test]
    fn unknown_help_topic_lists_the_rest() {
        let lines = help_topic("reboot");
        assert_eq!(lines[0], "No help available for `reboot`.");
        assert!(lines[1].contains("motion, advance, link"));
    }

    #[test]
    fn error_codes_accept_hex() {
        assert_eq!(parse_code("0x7780"), Ok(0x7780));
        assert_eq!(parse_code("-1"), Ok(-1));
    }
}

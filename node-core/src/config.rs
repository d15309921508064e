//! Device configuration assembled by the host before workers start.
//!
//! Loading these values from flash, Kconfig, or the command line is the
//! assembler's job; the core only defines the shape, the defaults, and the
//! validation rules.

use core::{fmt, time::Duration};

/// Debounce window applied to motion edges.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(1_000);
/// Capacity of every bounded fabric channel.
pub const CHANNEL_DEPTH: usize = 10;
/// Link reconnect attempts allowed before the link is declared dead.
pub const DEFAULT_LINK_MAX_RETRIES: u8 = 5;
pub const DEFAULT_LINK_BACKOFF_FIRST: Duration = Duration::from_secs(1);
pub const DEFAULT_LINK_BACKOFF_MAX: Duration = Duration::from_secs(32);
/// Attempts to start the bus client before treating it as a link failure.
pub const DEFAULT_BUS_START_ATTEMPTS: u8 = 5;
pub const DEFAULT_BUS_START_DELAY: Duration = Duration::from_millis(5_000);
pub const DEFAULT_BUS_KEEPALIVE: Duration = Duration::from_secs(120);
pub const DEFAULT_BUS_NETWORK_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Consecutive fetch failures tolerated by one update procedure.
pub const DEFAULT_UPDATE_MAX_ATTEMPTS: u8 = 5;
pub const DEFAULT_UPDATE_RETRY_DELAY: Duration = Duration::from_millis(1_000);
/// Delay between successful chunks so other workers get scheduled.
pub const DEFAULT_UPDATE_CHUNK_YIELD: Duration = Duration::from_millis(10);
/// Fetch loop iterations between progress reports.
pub const DEFAULT_UPDATE_PROGRESS_INTERVAL: u32 = 100;
/// How long the motion light stays on after the last accepted event.
pub const DEFAULT_MOTION_HOLD: Duration = Duration::from_millis(1_000);
pub const DEFAULT_DOOR_POLL_INTERVAL: Duration = Duration::from_millis(2_000);
pub const DEFAULT_DOOR_REPUBLISH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound on how long an ordinary worker waits for room in a channel.
pub const DEFAULT_SEND_DEADLINE: Duration = Duration::from_millis(100);

/// Longest device name accepted as a status-message key.
pub const MAX_DEVICE_NAME: usize = 32;
/// Longest topic string accepted in the topic table.
pub const MAX_TOPIC_LEN: usize = 64;

/// Bus topics used by the device, both subscribed and published.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Topics {
    /// Incoming: any message starts a firmware update.
    pub update_trigger: &'static str,
    /// Incoming: any message requests an immediate telemetry publication.
    pub telemetry_request: &'static str,
    /// Incoming: textual indicator state such as `LED_FLASHING_RED`.
    pub indicator: &'static str,
    pub door: &'static str,
    pub motion: &'static str,
    pub update_progress: &'static str,
    pub heartbeat: &'static str,
    pub telemetry: &'static str,
}

impl Topics {
    /// Topics the session subscribes to on every new connection.
    pub const fn subscriptions(&self) -> [&'static str; 3] {
        [self.update_trigger, self.telemetry_request, self.indicator]
    }

    const fn all(&self) -> [&'static str; 8] {
        [
            self.update_trigger,
            self.telemetry_request,
            self.indicator,
            self.door,
            self.motion,
            self.update_progress,
            self.heartbeat,
            self.telemetry,
        ]
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            update_trigger: "node/ota/update",
            telemetry_request: "node/telemetry/request",
            indicator: "node/indicator/set",
            door: "node/status/door",
            motion: "node/status/motion",
            update_progress: "node/status/update",
            heartbeat: "node/status/heartbeat",
            telemetry: "node/telemetry",
        }
    }
}

/// Timing knobs shared by every worker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timing {
    pub debounce_window: Duration,
    pub motion_hold: Duration,
    pub link_max_retries: u8,
    pub link_backoff_first: Duration,
    pub link_backoff_max: Duration,
    pub bus_start_attempts: u8,
    pub bus_start_delay: Duration,
    pub bus_keepalive: Duration,
    pub bus_network_timeout: Duration,
    pub update_max_attempts: u8,
    pub update_retry_delay: Duration,
    pub update_chunk_yield: Duration,
    pub update_progress_interval: u32,
    pub door_poll_interval: Duration,
    pub door_republish_interval: Duration,
    pub heartbeat_interval: Duration,
    pub send_deadline: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            motion_hold: DEFAULT_MOTION_HOLD,
            link_max_retries: DEFAULT_LINK_MAX_RETRIES,
            link_backoff_first: DEFAULT_LINK_BACKOFF_FIRST,
            link_backoff_max: DEFAULT_LINK_BACKOFF_MAX,
            bus_start_attempts: DEFAULT_BUS_START_ATTEMPTS,
            bus_start_delay: DEFAULT_BUS_START_DELAY,
            bus_keepalive: DEFAULT_BUS_KEEPALIVE,
            bus_network_timeout: DEFAULT_BUS_NETWORK_TIMEOUT,
            update_max_attempts: DEFAULT_UPDATE_MAX_ATTEMPTS,
            update_retry_delay: DEFAULT_UPDATE_RETRY_DELAY,
            update_chunk_yield: DEFAULT_UPDATE_CHUNK_YIELD,
            update_progress_interval: DEFAULT_UPDATE_PROGRESS_INTERVAL,
            door_poll_interval: DEFAULT_DOOR_POLL_INTERVAL,
            door_republish_interval: DEFAULT_DOOR_REPUBLISH_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            send_deadline: DEFAULT_SEND_DEADLINE,
        }
    }
}

/// Client identity presented to the broker.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Credentials {
    pub client_cert: &'static [u8],
    pub client_key: &'static [u8],
    pub broker_ca: &'static [u8],
}

/// Where the message-bus session connects.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BrokerEndpoint {
    pub uri: &'static str,
    pub credentials: Credentials,
}

/// Where firmware images are fetched from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UpdateSource {
    pub url: &'static str,
    pub root_ca: &'static [u8],
}

/// Complete runtime configuration for one device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceConfig {
    pub device_name: &'static str,
    pub broker: BrokerEndpoint,
    pub update: UpdateSource,
    pub topics: Topics,
    pub timing: Timing,
}

impl DeviceConfig {
    /// Builds a configuration with default topics and timing.
    pub fn new(device_name: &'static str, broker: BrokerEndpoint, update: UpdateSource) -> Self {
        Self {
            device_name,
            broker,
            update,
            topics: Topics::default(),
            timing: Timing::default(),
        }
    }

    /// Replaces the topic table.
    pub fn with_topics(mut self, topics: Topics) -> Self {
        self.topics = topics;
        self
    }

    /// Replaces the timing table.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Checks the invariants the workers rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }
        if self.device_name.len() > MAX_DEVICE_NAME {
            return Err(ConfigError::DeviceNameTooLong);
        }
        if self.broker.uri.is_empty() {
            return Err(ConfigError::MissingBrokerUri);
        }

        let timing = &self.timing;
        if timing.debounce_window.is_zero() {
            return Err(ConfigError::ZeroDebounceWindow);
        }
        if timing.link_max_retries == 0
            || timing.update_max_attempts == 0
            || timing.bus_start_attempts == 0
        {
            return Err(ConfigError::ZeroRetryBudget);
        }
        if timing.update_progress_interval == 0 {
            return Err(ConfigError::ZeroProgressInterval);
        }

        let topics = self.topics.all();
        for (index, topic) in topics.iter().enumerate() {
            if topic.is_empty() {
                return Err(ConfigError::EmptyTopic);
            }
            if topic.len() > MAX_TOPIC_LEN {
                return Err(ConfigError::TopicTooLong);
            }
            if topics[index + 1..].contains(topic) {
                return Err(ConfigError::DuplicateTopic);
            }
        }

        Ok(())
    }
}

/// Reasons a [`DeviceConfig`] is rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    EmptyDeviceName,
    DeviceNameTooLong,
    MissingBrokerUri,
    ZeroDebounceWindow,
    ZeroRetryBudget,
    ZeroProgressInterval,
    EmptyTopic,
    TopicTooLong,
    DuplicateTopic,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ConfigError::EmptyDeviceName => "device name is empty",
            ConfigError::DeviceNameTooLong => "device name exceeds status key length",
            ConfigError::MissingBrokerUri => "broker uri is empty",
            ConfigError::ZeroDebounceWindow => "debounce window must be non-zero",
            ConfigError::ZeroRetryBudget => "retry budgets must allow at least one attempt",
            ConfigError::ZeroProgressInterval => "progress interval must be non-zero",
            ConfigError::EmptyTopic => "topic is empty",
            ConfigError::TopicTooLong => "topic exceeds maximum length",
            ConfigError::DuplicateTopic => "two topics share the same name",
        };
        f.write_str(message)
    }
}

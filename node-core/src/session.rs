//! Network session supervision.
//!
//! [`SessionSupervisor`] is a synchronous event → action machine. The runtime
//! feeds it radio-link and message-bus callbacks plus retry-timer expiries, and
//! executes the [`SessionAction`]s it returns. The supervisor is the only
//! writer of the shared [`SessionCell`]; every other worker gets a read-only
//! [`SessionView`].

use core::{fmt, time::Duration};

use heapless::Vec;
use portable_atomic::{AtomicU8, AtomicU32, Ordering};

use crate::config::{BrokerEndpoint, Timing};
use crate::retry::{DelaySchedule, RetryBudget, RetryDecision};

/// Lifecycle of the network session as seen by the rest of the device.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum SessionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    FailedPermanently = 3,
}

impl SessionState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::FailedPermanently,
            _ => SessionState::Disconnected,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::FailedPermanently => "failed-permanently",
        }
    }
}

/// Shared session status. Written only by [`SessionSupervisor`].
#[derive(Debug, Default)]
pub struct SessionCell {
    state: AtomicU8,
    epoch: AtomicU32,
}

impl SessionCell {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Disconnected as u8),
            epoch: AtomicU32::new(0),
        }
    }

    /// Read-only handle for workers that gate on session liveness.
    pub fn view(&self) -> SessionView<'_> {
        SessionView { cell: self }
    }

    fn store(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn begin_connection(&self) -> u32 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.store(SessionState::Connected);
        epoch
    }
}

/// Read-only capability check over a [`SessionCell`].
#[derive(Copy, Clone, Debug)]
pub struct SessionView<'a> {
    cell: &'a SessionCell,
}

impl SessionView<'_> {
    pub fn state(&self) -> SessionState {
        SessionState::from_raw(self.cell.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Number of bus sessions established since startup.
    pub fn epoch(&self) -> u32 {
        self.cell.epoch.load(Ordering::Acquire)
    }

    /// Sessions re-established after the first one.
    pub fn reconnects(&self) -> u32 {
        self.epoch().saturating_sub(1)
    }
}

/// Delivery guarantee requested for a publish or subscription.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

/// Failure reported by the message-bus client.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusError {
    NotConnected,
    /// Client could not be created or started.
    StartFailed,
    Transport,
    Timeout,
    PayloadTooLarge,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            BusError::NotConnected => "bus not connected",
            BusError::StartFailed => "bus client failed to start",
            BusError::Transport => "bus transport error",
            BusError::Timeout => "bus operation timed out",
            BusError::PayloadTooLarge => "payload exceeds bus limit",
        };
        f.write_str(message)
    }
}

/// Failure reported by the radio link driver when a connect cannot be issued.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkError {
    Unavailable,
    Timeout,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Unavailable => f.write_str("radio unavailable"),
            LinkError::Timeout => f.write_str("radio connect timed out"),
        }
    }
}

/// Detail carried by the bus client's error callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusFault {
    /// Transport or TLS failure.
    Transport {
        transport_code: i32,
        tls_stack_code: i32,
        cert_verify_flags: u32,
    },
    /// Broker refused the connection.
    BrokerRejected { return_code: u8 },
    Unknown,
}

impl BusFault {
    pub const fn kind(&self) -> &'static str {
        match self {
            BusFault::Transport { .. } => "transport/tls",
            BusFault::BrokerRejected { .. } => "broker-rejected",
            BusFault::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BusFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusFault::Transport {
                transport_code,
                tls_stack_code,
                cert_verify_flags,
            } => write!(
                f,
                "transport error 0x{transport_code:x}, tls stack 0x{tls_stack_code:x}, cert flags 0x{cert_verify_flags:x}"
            ),
            BusFault::BrokerRejected { return_code } => {
                write!(f, "broker refused connection, return code {return_code}")
            }
            BusFault::Unknown => f.write_str("unknown bus error"),
        }
    }
}

/// Why the device is about to restart itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RestartReason {
    /// Link reconnect budget exhausted.
    LinkExhausted,
    /// Protocol or authentication failure reported by the bus client.
    BusFault(BusFault),
    /// A new firmware image was activated.
    UpdateApplied,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::LinkExhausted => f.write_str("link reconnect budget exhausted"),
            RestartReason::BusFault(fault) => write!(f, "bus fault: {fault}"),
            RestartReason::UpdateApplied => f.write_str("firmware update applied"),
        }
    }
}

/// Publishing half of the bus client, lent to workers that must not manage
/// the session.
pub trait Publish {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), BusError>;
}

/// Radio link driver. Link-up/link-down arrive later as [`SessionEvent`]s.
pub trait RadioLink {
    /// Starts an asynchronous connect attempt.
    fn connect(&mut self) -> Result<(), LinkError>;

    fn disconnect(&mut self);
}

/// Message-bus client. Connected/disconnected/data/error arrive later as events.
pub trait MessageBus {
    type Publisher: Publish;

    /// Creates and starts the client session.
    fn connect(&mut self, endpoint: &BrokerEndpoint) -> Result<(), BusError>;

    fn disconnect(&mut self);

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), BusError>;

    /// Returns a publish-only handle sharing this client's session.
    fn publisher(&self) -> Self::Publisher;
}

/// Device restart capability.
pub trait SystemControl {
    /// Restarts the device. On hardware this does not return.
    fn restart(&self, reason: RestartReason);
}

/// Link and bus callbacks plus timer expiries, in arrival order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    LinkUp,
    /// Link lost, or a connect attempt failed.
    LinkDown,
    BusConnected,
    BusDisconnected,
    /// The bus client could not be started.
    BusStartFailed,
    BusError(BusFault),
    /// The retry timer requested by the last schedule action fired.
    RetryDue,
}

/// Work the runtime must perform on the supervisor's behalf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionAction {
    ConnectLink,
    DisconnectLink,
    /// Deliver [`SessionEvent::RetryDue`] after `delay`.
    ScheduleRetry { attempt: u8, delay: Duration },
    StartBus,
    /// Subscribe to every incoming topic.
    Subscribe,
    /// Start session-bound workers for connection number `epoch`.
    StartWorkers { epoch: u32 },
    /// Stop session-bound workers; cancel a running update on link loss.
    StopWorkers { cancel_update: bool },
    /// Switch the indicator to the fatal-error pattern.
    ShowFault,
    Restart(RestartReason),
}

/// Upper bound on actions produced by a single event.
pub const MAX_ACTIONS: usize = 4;

pub type Actions = Vec<SessionAction, MAX_ACTIONS>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum PendingRetry {
    Link,
    Bus,
}

/// Event-driven session state machine.
#[derive(Debug)]
pub struct SessionSupervisor<'a> {
    cell: &'a SessionCell,
    link_budget: RetryBudget,
    bus_budget: RetryBudget,
    link_up: bool,
    workers_running: bool,
    pending: Option<PendingRetry>,
    duplicate_connects: u32,
}

impl<'a> SessionSupervisor<'a> {
    pub fn new(cell: &'a SessionCell, timing: &Timing) -> Self {
        Self {
            cell,
            link_budget: RetryBudget::retries(
                timing.link_max_retries,
                DelaySchedule::Exponential {
                    first: timing.link_backoff_first,
                    max: timing.link_backoff_max,
                },
            ),
            bus_budget: RetryBudget::attempts(
                timing.bus_start_attempts,
                DelaySchedule::Fixed(timing.bus_start_delay),
            ),
            link_up: false,
            workers_running: false,
            pending: None,
            duplicate_connects: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.cell.view().state()
    }

    pub fn view(&self) -> SessionView<'a> {
        self.cell.view()
    }

    pub fn link_failures(&self) -> u8 {
        self.link_budget.failures()
    }

    /// Connected callbacks ignored because the session was already up.
    pub fn duplicate_connects(&self) -> u32 {
        self.duplicate_connects
    }

    /// Begins the first connection attempt.
    pub fn start(&mut self) -> Actions {
        let mut actions = Actions::new();
        if self.state() == SessionState::FailedPermanently {
            return actions;
        }
        self.cell.store(SessionState::Connecting);
        push(&mut actions, SessionAction::ConnectLink);
        actions
    }

    pub fn handle(&mut self, event: SessionEvent) -> Actions {
        let mut actions = Actions::new();
        if self.state() == SessionState::FailedPermanently {
            return actions;
        }

        match event {
            SessionEvent::LinkUp => {
                self.link_up = true;
                self.link_budget.reset();
                self.bus_budget.reset();
                self.pending = None;
                self.cell.store(SessionState::Connecting);
                push(&mut actions, SessionAction::StartBus);
            }
            SessionEvent::LinkDown => {
                self.link_up = false;
                self.stop_workers(&mut actions, true);
                self.link_failure(&mut actions);
            }
            SessionEvent::BusConnected => {
                if self.state() == SessionState::Connected {
                    self.duplicate_connects = self.duplicate_connects.saturating_add(1);
                    return actions;
                }
                self.bus_budget.reset();
                self.pending = None;
                let epoch = self.cell.begin_connection();
                self.workers_running = true;
                push(&mut actions, SessionAction::Subscribe);
                push(&mut actions, SessionAction::StartWorkers { epoch });
            }
            SessionEvent::BusDisconnected | SessionEvent::BusStartFailed => {
                self.stop_workers(&mut actions, false);
                // With the link down the pending link retry owns recovery.
                if self.link_up {
                    self.bus_failure(&mut actions);
                }
            }
            SessionEvent::BusError(fault) => {
                self.stop_workers(&mut actions, true);
                self.cell.store(SessionState::FailedPermanently);
                push(&mut actions, SessionAction::ShowFault);
                push(&mut actions, SessionAction::Restart(RestartReason::BusFault(fault)));
            }
            SessionEvent::RetryDue => match self.pending.take() {
                Some(PendingRetry::Link) => {
                    self.cell.store(SessionState::Connecting);
                    push(&mut actions, SessionAction::ConnectLink);
                }
                Some(PendingRetry::Bus) if self.link_up => {
                    self.cell.store(SessionState::Connecting);
                    push(&mut actions, SessionAction::StartBus);
                }
                Some(PendingRetry::Bus) | None => {}
            },
        }

        actions
    }

    fn stop_workers(&mut self, actions: &mut Actions, cancel_update: bool) {
        if self.workers_running || cancel_update {
            self.workers_running = false;
            push(actions, SessionAction::StopWorkers { cancel_update });
        }
    }

    fn link_failure(&mut self, actions: &mut Actions) {
        match self.link_budget.record_failure() {
            RetryDecision::RetryAfter { attempt, delay } => {
                self.cell.store(SessionState::Disconnected);
                self.pending = Some(PendingRetry::Link);
                push(actions, SessionAction::ScheduleRetry { attempt, delay });
            }
            RetryDecision::Exhausted { .. } => {
                self.cell.store(SessionState::FailedPermanently);
                self.pending = None;
                push(actions, SessionAction::ShowFault);
                push(actions, SessionAction::Restart(RestartReason::LinkExhausted));
            }
        }
    }

    fn bus_failure(&mut self, actions: &mut Actions) {
        match self.bus_budget.record_failure() {
            RetryDecision::RetryAfter { attempt, delay } => {
                self.cell.store(SessionState::Disconnected);
                self.pending = Some(PendingRetry::Bus);
                push(actions, SessionAction::ScheduleRetry { attempt, delay });
            }
            RetryDecision::Exhausted { .. } => {
                self.bus_budget.reset();
                self.link_up = false;
                push(actions, SessionAction::DisconnectLink);
                self.link_failure(actions);
            }
        }
    }
}

fn push(actions: &mut Actions, action: SessionAction) {
    // Every transition emits at most MAX_ACTIONS actions.
    let _ = actions.push(action);
}

/// Publisher that discards everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopPublisher;

impl Publish for NoopPublisher {
    fn publish(&mut self, _: &str, _: &[u8], _: Qos) -> Result<(), BusError> {
        Ok(())
    }
}

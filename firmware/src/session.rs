//! Session worker: executes supervisor actions and routes inbound messages.

use core::future::pending;

use embassy_futures::select::{Either4, select4};
use embassy_time::{Duration, Instant, Timer};
use node_core::command::{BusCommand, CommandError, InboundMessage};
use node_core::config::DeviceConfig;
use node_core::error::{AlreadyRunning, Classify};
use node_core::fabric::{EnqueueError, EventProducer};
use node_core::indicator::{Color, IndicatorState};
use node_core::session::{
    BusError, LinkError, MessageBus, Qos, RadioLink, RestartReason, SessionAction, SessionEvent,
    SessionSupervisor, SystemControl,
};

use crate::fabric::Fabric;
use crate::time::core_duration_to_embassy;

/// Indicator pattern shown once the session has failed for good.
pub const FAULT_PATTERN: IndicatorState = IndicatorState::Flashing(Color::Red);

/// How an inbound message was handled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dispatch {
    UpdateQueued,
    UpdateAlreadyRunning,
    TelemetryRequested,
    IndicatorQueued(IndicatorState),
    IndicatorDropped(IndicatorState),
    Ignored(CommandError),
}

/// Owns the link and bus drivers and the only [`SessionSupervisor`].
pub struct SessionWorker<'a, L, B, S> {
    fabric: &'static Fabric,
    config: &'a DeviceConfig,
    supervisor: SessionSupervisor<'static>,
    link: L,
    bus: B,
    system: &'a S,
    retry_at: Option<Instant>,
    send_deadline: Duration,
}

impl<'a, L, B, S> SessionWorker<'a, L, B, S>
where
    L: RadioLink,
    B: MessageBus,
    S: SystemControl,
{
    pub fn new(
        fabric: &'static Fabric,
        config: &'a DeviceConfig,
        link: L,
        bus: B,
        system: &'a S,
    ) -> Self {
        Self {
            fabric,
            config,
            supervisor: SessionSupervisor::new(&fabric.session, &config.timing),
            link,
            bus,
            system,
            retry_at: None,
            send_deadline: core_duration_to_embassy(config.timing.send_deadline),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Deadline of the pending retry, if one is scheduled.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Issues the first link connect.
    pub fn start(&mut self) {
        let actions = self.supervisor.start();
        if let Some(follow_up) = self.execute(&actions) {
            self.handle(follow_up);
        }
    }

    /// Feeds one event through the supervisor, including any failures the
    /// resulting actions report synchronously.
    pub fn handle(&mut self, event: SessionEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            log_event(event);
            let actions = self.supervisor.handle(event);
            next = self.execute(&actions);
        }
    }

    /// Handles everything still queued, then the event that overflowed.
    /// Keeps callback order intact after the queue filled up.
    pub fn catch_up(&mut self, overflow: SessionEvent) {
        while let Some(event) = self.fabric.session_events.try_receive() {
            self.handle(event);
        }
        self.handle(overflow);
    }

    /// Fires the retry timer early; used when the deadline has passed.
    pub fn retry_now(&mut self) {
        self.retry_at = None;
        self.handle(SessionEvent::RetryDue);
    }

    fn execute(&mut self, actions: &[SessionAction]) -> Option<SessionEvent> {
        for action in actions {
            match *action {
                SessionAction::ConnectLink => {
                    if let Err(err) = self.link.connect() {
                        log_link_error(err);
                        return Some(SessionEvent::LinkDown);
                    }
                }
                SessionAction::DisconnectLink => {
                    self.bus.disconnect();
                    self.link.disconnect();
                }
                SessionAction::ScheduleRetry { attempt, delay } => {
                    let delay = core_duration_to_embassy(delay);
                    log_retry(attempt, delay);
                    self.retry_at = Some(Instant::now() + delay);
                }
                SessionAction::StartBus => {
                    if let Err(err) = self.bus.connect(&self.config.broker) {
                        log_bus_error("start", err);
                        return Some(SessionEvent::BusStartFailed);
                    }
                }
                SessionAction::Subscribe => self.subscribe(),
                SessionAction::StartWorkers { epoch } => {
                    log_workers_started(epoch);
                    self.fabric.worker_start.signal(epoch);
                }
                SessionAction::StopWorkers { cancel_update } => {
                    if cancel_update && self.fabric.update_guard.is_held() {
                        log_update_cancel();
                        self.fabric.update_cancel.request();
                    }
                }
                SessionAction::ShowFault => self.fabric.indicator.set_state(FAULT_PATTERN),
                SessionAction::Restart(reason) => {
                    log_restart(reason);
                    self.system.restart(reason);
                }
            }
        }
        None
    }

    fn subscribe(&mut self) {
        for topic in self.config.topics.subscriptions() {
            if let Err(err) = self.bus.subscribe(topic, Qos::AtLeastOnce) {
                log_subscribe_failed(topic, err);
            }
        }
    }

    /// Acts on one inbound bus message.
    pub async fn dispatch(&self, message: &InboundMessage) -> Dispatch {
        match message.route(&self.config.topics) {
            Ok(BusCommand::TriggerUpdate) => self.trigger_update(),
            Ok(BusCommand::RequestTelemetry) => {
                self.fabric.telemetry_request.signal(());
                Dispatch::TelemetryRequested
            }
            Ok(BusCommand::SetIndicator { state, recognised }) => {
                if !recognised {
                    log_unrecognised_indicator(&message.payload);
                }
                match self
                    .fabric
                    .indicator_commands
                    .send_within(state, self.send_deadline)
                    .await
                {
                    Ok(()) => Dispatch::IndicatorQueued(state),
                    Err(_) => {
                        self.fabric.dropped.record();
                        Dispatch::IndicatorDropped(state)
                    }
                }
            }
            Err(err) => {
                log_unhandled(&message.topic, err);
                Dispatch::Ignored(err)
            }
        }
    }

    fn trigger_update(&self) -> Dispatch {
        let Some(token) = self.fabric.update_guard.try_acquire() else {
            let err = AlreadyRunning {
                procedure: self.fabric.update_guard.name(),
            };
            log_already_running(err);
            return Dispatch::UpdateAlreadyRunning;
        };

        self.fabric.update_cancel.clear();
        match self.fabric.update_requests.try_enqueue(token) {
            Ok(()) => Dispatch::UpdateQueued,
            // The guard admits one token and the queue holds one.
            Err(EnqueueError::Full(token)) => {
                drop(token);
                Dispatch::UpdateAlreadyRunning
            }
        }
    }

    pub async fn run(mut self) -> ! {
        self.start();
        loop {
            let retry_at = self.retry_at;
            let retry = async move {
                match retry_at {
                    Some(at) => Timer::at(at).await,
                    None => pending::<()>().await,
                }
            };

            match select4(
                self.fabric.session_events.receive(),
                self.fabric.session_overflow.wait(),
                self.fabric.inbound.receive(),
                retry,
            )
            .await
            {
                Either4::First(event) => self.handle(event),
                Either4::Second(event) => self.catch_up(event),
                Either4::Third(message) => {
                    self.dispatch(&message).await;
                }
                Either4::Fourth(()) => self.retry_now(),
            }
        }
    }
}

#[cfg(target_os = "none")]
fn log_event(event: SessionEvent) {
    defmt::debug!("session event {}", defmt::Debug2Format(&event));
}

#[cfg(not(target_os = "none"))]
fn log_event(event: SessionEvent) {
    println!("session event {event:?}");
}

#[cfg(target_os = "none")]
fn log_link_error(err: LinkError) {
    defmt::warn!("link connect failed: {}", defmt::Display2Format(&err));
}

#[cfg(not(target_os = "none"))]
fn log_link_error(err: LinkError) {
    println!("link connect failed: {err}");
}

#[cfg(target_os = "none")]
fn log_bus_error(operation: &str, err: BusError) {
    defmt::warn!(
        "bus {=str} failed: {} [{=str}]",
        operation,
        defmt::Display2Format(&err),
        err.classify().as_str()
    );
}

#[cfg(not(target_os = "none"))]
fn log_bus_error(operation: &str, err: BusError) {
    println!("bus {operation} failed: {err} [{}]", err.classify());
}

#[cfg(target_os = "none")]
fn log_subscribe_failed(topic: &str, err: BusError) {
    defmt::warn!(
        "subscribe to {=str} failed: {}",
        topic,
        defmt::Display2Format(&err)
    );
}

#[cfg(not(target_os = "none"))]
fn log_subscribe_failed(topic: &str, err: BusError) {
    println!("subscribe to {topic} failed: {err}");
}

#[cfg(target_os = "none")]
fn log_retry(attempt: u8, delay: Duration) {
    defmt::info!(
        "session retry {=u8} in {=u64} ms",
        attempt,
        delay.as_millis()
    );
}

#[cfg(not(target_os = "none"))]
fn log_retry(attempt: u8, delay: Duration) {
    println!("session retry {attempt} in {} ms", delay.as_millis());
}

#[cfg(target_os = "none")]
fn log_workers_started(epoch: u32) {
    defmt::info!("session {=u32} up; workers started", epoch);
}

#[cfg(not(target_os = "none"))]
fn log_workers_started(epoch: u32) {
    println!("session {epoch} up; workers started");
}

#[cfg(target_os = "none")]
fn log_update_cancel() {
    defmt::warn!("link lost; cancelling update");
}

#[cfg(not(target_os = "none"))]
fn log_update_cancel() {
    println!("link lost; cancelling update");
}

#[cfg(target_os = "none")]
fn log_restart(reason: RestartReason) {
    defmt::error!("restarting: {}", defmt::Display2Format(&reason));
}

#[cfg(not(target_os = "none"))]
fn log_restart(reason: RestartReason) {
    println!("restarting: {reason}");
}

#[cfg(target_os = "none")]
fn log_unrecognised_indicator(payload: &[u8]) {
    defmt::warn!("unrecognised indicator command {=[u8]}; turning off", payload);
}

#[cfg(not(target_os = "none"))]
fn log_unrecognised_indicator(payload: &[u8]) {
    println!(
        "unrecognised indicator command {:?}; turning off",
        core::str::from_utf8(payload).unwrap_or("<binary>")
    );
}

#[cfg(target_os = "none")]
fn log_unhandled(topic: &str, err: CommandError) {
    defmt::warn!(
        "ignoring message on {=str}: {}",
        topic,
        defmt::Display2Format(&err)
    );
}

#[cfg(not(target_os = "none"))]
fn log_unhandled(topic: &str, err: CommandError) {
    println!("ignoring message on {topic}: {err}");
}

#[cfg(target_os = "none")]
fn log_already_running(err: AlreadyRunning) {
    defmt::warn!("{}", defmt::Display2Format(&err));
}

#[cfg(not(target_os = "none"))]
fn log_already_running(err: AlreadyRunning) {
    println!("{err}");
}

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use node_core::boot::{
    BootError, BootKind, BootPartitions, KeyValueStore, PartitionId, ResetReason, StoreError,
    classify_boot,
};
use node_core::clock::{Millis, duration_millis, has_elapsed};
use node_core::command::{BusCommand, InboundMessage};
use node_core::config::{BrokerEndpoint, Credentials, DeviceConfig, UpdateSource};
use node_core::debounce::{Debouncer, EdgeOutcome, MotionEvent, MotionInput};
use node_core::error::{AlreadyRunning, Classify};
use node_core::fabric::{
    CancelFlag, DropCounter, EnqueueError, EventProducer, GuardToken, LifecycleGuard,
};
use node_core::indicator::{
    ChannelId, Color, IndicatorCell, IndicatorState, PixelDriver, PixelError, Renderer, Rgb,
};
use node_core::motion::MotionLight;
use node_core::session::{
    BusError, BusFault, Publish, Qos, RestartReason, SessionAction, SessionCell, SessionEvent,
    SessionState, SessionSupervisor,
};
use node_core::status::{
    Delivery, DeviceSnapshot, DoorLevels, DoorSensors, DoorStatus, StatusReporter,
};
use node_core::update::{
    ChunkStatus, FetchError, ImageFetch, UpdateProcedure, UpdateReport, UpdateState, UpdateStep,
    publish_report,
};

/// Resolution of the simulated clock.
pub const TICK_MS: Millis = 10;

const DEFAULT_IMAGE_CHUNKS: u32 = 250;

pub fn default_config() -> DeviceConfig {
    DeviceConfig::new(
        "coop-sim",
        BrokerEndpoint {
            uri: "mqtts://broker.sim:8883",
            credentials: Credentials {
                client_cert: b"sim-client-cert",
                client_key: b"sim-client-key",
                broker_ca: b"sim-broker-ca",
            },
        },
        UpdateSource {
            url: "https://updates.sim/coop.bin",
            root_ca: b"sim-update-ca",
        },
    )
}

/// Shared cells that outlive one boot of the runtime.
struct Shared {
    session: SessionCell,
    update_guard: LifecycleGuard,
    update_cancel: CancelFlag,
}

impl Shared {
    fn leak() -> &'static Shared {
        Box::leak(Box::new(Shared {
            session: SessionCell::new(),
            update_guard: LifecycleGuard::new("update"),
            update_cancel: CancelFlag::new(),
        }))
    }
}

/// Simulated peripherals; they survive a restart.
pub struct Hardware {
    pub network: HostNetwork,
    pub fetch: HostFetch,
    pub slots: HostSlots,
    pub store: HostStore,
    pub publisher: HostPublisher,
    pub door: HostDoor,
    pub pixel: HostPixel,
}

impl Default for Hardware {
    fn default() -> Self {
        Self {
            network: HostNetwork {
                link_available: true,
                broker_available: true,
            },
            fetch: HostFetch::new(DEFAULT_IMAGE_CHUNKS),
            slots: HostSlots::default(),
            store: HostStore::default(),
            publisher: HostPublisher::default(),
            door: HostDoor::default(),
            pixel: HostPixel::default(),
        }
    }
}

struct ActiveUpdate {
    _token: GuardToken<'static>,
    procedure: UpdateProcedure,
    started: Millis,
    delay: Millis,
}

/// Per-boot runtime state.
struct Runtime {
    shared: &'static Shared,
    supervisor: SessionSupervisor<'static>,
    motion: MotionInput<HostQueue>,
    light: MotionLight,
    indicator: IndicatorCell,
    renderer: Renderer,
    reporter: StatusReporter,
    pending: VecDeque<SessionEvent>,
    retry: Option<(Millis, Millis)>,
    update: Option<ActiveUpdate>,
    dropped: DropCounter,
    motion_events: u32,
    uptime_ms: u64,
    door_checked: Option<Millis>,
}

impl Runtime {
    fn boot(config: &DeviceConfig) -> Self {
        let shared = Shared::leak();
        Self {
            shared,
            supervisor: SessionSupervisor::new(&shared.session, &config.timing),
            motion: MotionInput::new(
                Debouncer::with_window(config.timing.debounce_window),
                HostQueue::new(node_core::config::CHANNEL_DEPTH),
            ),
            light: MotionLight::new(Color::White, &config.timing),
            indicator: IndicatorCell::new(IndicatorState::Off),
            renderer: Renderer::new(),
            reporter: StatusReporter::new(config),
            pending: VecDeque::new(),
            retry: None,
            update: None,
            dropped: DropCounter::new(),
            motion_events: 0,
            uptime_ms: 0,
            door_checked: None,
        }
    }
}

/// Whole simulated node: hardware plus the runtime of the current boot.
pub struct SimDevice {
    config: DeviceConfig,
    now: Millis,
    boots: u32,
    pub hw: Hardware,
    rt: Runtime,
    output: Vec<String>,
}

impl SimDevice {
    pub fn new(config: DeviceConfig) -> Self {
        let rt = Runtime::boot(&config);
        let mut device = Self {
            config,
            now: 0,
            boots: 0,
            hw: Hardware::default(),
            rt,
            output: Vec::new(),
        };
        device.start();
        device
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn now(&self) -> Millis {
        self.now
    }

    pub fn boots(&self) -> u32 {
        self.boots
    }

    pub fn session_state(&self) -> SessionState {
        self.rt.shared.session.view().state()
    }

    pub fn indicator(&self) -> IndicatorState {
        self.rt.indicator.current()
    }

    pub fn update_state(&self) -> Option<UpdateState> {
        self.rt.update.as_ref().map(|active| active.procedure.state())
    }

    pub fn motion_events(&self) -> u32 {
        self.rt.motion_events
    }

    /// Lines produced since the last call.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    fn emit(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
    }

    fn start(&mut self) {
        self.boots += 1;
        let kind = match classify_boot(&mut self.hw.store, &self.hw.slots) {
            Ok(kind) => kind,
            Err(err) => {
                self.emit(format!("boot record unreadable: {err}"));
                BootKind::Normal
            }
        };
        self.emit(format!(
            "boot #{} from {} ({}): {}",
            self.boots,
            self.hw.slots.running,
            self.hw.slots.reason.as_str(),
            describe_boot(kind)
        ));
        self.rt.reporter.note_boot(kind);
        self.render();

        let actions = self.rt.supervisor.start();
        self.execute(&actions);
        self.process_events();
    }

    fn restart(&mut self, reason: RestartReason) {
        self.emit(format!("restart: {reason}"));
        self.hw.slots.reboot();
        self.rt = Runtime::boot(&self.config);
        self.start();
    }

    /// Raw motion edge at the current time.
    pub fn motion_edge(&mut self) -> EdgeOutcome {
        let outcome = self.rt.motion.on_edge(self.now);
        match outcome {
            EdgeOutcome::Suppressed => self.emit("motion edge suppressed by debounce"),
            EdgeOutcome::Enqueued(_) => {}
            EdgeOutcome::Dropped(event) => self.emit(format!(
                "motion queue full; event at {} ms lost ({} total)",
                event.timestamp,
                self.rt.motion.lost()
            )),
        }
        self.drain_motion();
        self.flush();
        outcome
    }

    fn drain_motion(&mut self) {
        while let Some(event) = self.rt.motion.producer().pop() {
            self.rt.motion_events = self.rt.motion_events.wrapping_add(1);
            self.emit(format!(
                "motion at {} ms ({} total)",
                event.timestamp, self.rt.motion_events
            ));
            let command = self.rt.light.on_motion(event);
            self.set_indicator(command);
        }
    }

    fn set_indicator(&mut self, state: IndicatorState) {
        if self.rt.indicator.current() != state {
            self.emit(format!("indicator -> {state}"));
        }
        self.rt.indicator.set_state(state);
        self.render();
    }

    fn render(&mut self) {
        let frame = self.rt.renderer.step(self.rt.indicator.current());
        if let Err(err) = frame.apply(&mut self.hw.pixel) {
            self.rt.renderer.invalidate();
            self.emit(format!("pixel write failed: {err}"));
        }
    }

    pub fn set_link_available(&mut self, available: bool) {
        self.hw.network.link_available = available;
        self.emit(format!(
            "radio {}",
            if available { "in range" } else { "out of range" }
        ));
    }

    pub fn set_broker_available(&mut self, available: bool) {
        self.hw.network.broker_available = available;
        self.emit(format!(
            "broker {}",
            if available { "accepting" } else { "refusing" }
        ));
    }

    /// Delivers a link or bus callback.
    pub fn session_event(&mut self, event: SessionEvent) {
        self.rt.pending.push_back(event);
        self.process_events();
        self.flush();
    }

    fn process_events(&mut self) {
        while let Some(event) = self.rt.pending.pop_front() {
            let actions = self.rt.supervisor.handle(event);
            self.execute(&actions);
        }
    }

    fn execute(&mut self, actions: &[SessionAction]) {
        for action in actions {
            match *action {
                SessionAction::ConnectLink => {
                    self.emit("link connecting");
                    let result = if self.hw.network.link_available {
                        SessionEvent::LinkUp
                    } else {
                        SessionEvent::LinkDown
                    };
                    self.rt.pending.push_back(result);
                }
                SessionAction::DisconnectLink => self.emit("link disconnected"),
                SessionAction::ScheduleRetry { attempt, delay } => {
                    let delay = duration_millis(delay);
                    self.emit(format!("retry {attempt} in {delay} ms"));
                    self.rt.retry = Some((self.now, delay));
                }
                SessionAction::StartBus => {
                    self.emit(format!("bus connecting to {}", self.config.broker.uri));
                    let result = if self.hw.network.broker_available {
                        SessionEvent::BusConnected
                    } else {
                        SessionEvent::BusStartFailed
                    };
                    self.rt.pending.push_back(result);
                }
                SessionAction::Subscribe => {
                    let topics = self.config.topics.subscriptions();
                    self.emit(format!("subscribed {}", topics.join(", ")));
                }
                SessionAction::StartWorkers { epoch } => {
                    self.emit(format!("session {epoch} up; workers started"));
                    self.rt.reporter.on_session_started();
                }
                SessionAction::StopWorkers { cancel_update } => {
                    self.emit("workers stopped");
                    if cancel_update && self.rt.shared.update_guard.is_held() {
                        self.emit("link lost; cancelling update");
                        self.rt.shared.update_cancel.request();
                    }
                }
                SessionAction::ShowFault => {
                    self.set_indicator(IndicatorState::Flashing(Color::Red));
                }
                SessionAction::Restart(reason) => {
                    self.rt.pending.clear();
                    self.restart(reason);
                    return;
                }
            }
        }
    }

    /// Delivers a bus data callback.
    pub fn inbound(&mut self, topic: &str, payload: &[u8]) {
        let message = match InboundMessage::new(topic, payload) {
            Ok(message) => message,
            Err(err) => {
                self.rt.dropped.record();
                self.emit(format!("inbound message on {topic} rejected: {err}"));
                return;
            }
        };
        match message.route(&self.config.topics) {
            Ok(BusCommand::TriggerUpdate) => self.trigger_update(),
            Ok(BusCommand::RequestTelemetry) => self.rt.reporter.request_telemetry(),
            Ok(BusCommand::SetIndicator { state, recognised }) => {
                if !recognised {
                    self.emit(format!(
                        "unrecognised indicator command {:?}; turning off",
                        String::from_utf8_lossy(payload)
                    ));
                }
                self.set_indicator(state);
            }
            Err(err) => self.emit(format!("ignoring message on {topic}: {err}")),
        }
        self.poll_status();
        self.flush();
    }

    fn trigger_update(&mut self) {
        let Some(token) = self.rt.shared.update_guard.try_acquire() else {
            let err = AlreadyRunning {
                procedure: self.rt.shared.update_guard.name(),
            };
            self.emit(format!("{err} [{}]", err.classify()));
            return;
        };
        self.rt.shared.update_cancel.clear();
        self.emit(format!("{} procedure started", token.name()));
        self.rt.update = Some(ActiveUpdate {
            _token: token,
            procedure: UpdateProcedure::new(self.config.update, &self.config.timing),
            started: self.now,
            delay: 0,
        });
    }

    pub fn set_door(&mut self, levels: Option<DoorLevels>) {
        self.hw.door.levels = levels;
    }

    /// Runs the clock forward by `ms`.
    pub fn advance(&mut self, ms: Millis) {
        let mut remaining = ms;
        while remaining > 0 {
            let step = remaining.min(TICK_MS);
            remaining -= step;
            self.now = self.now.wrapping_add(step);
            self.rt.uptime_ms += u64::from(step);
            self.tick();
        }
        self.flush();
    }

    fn tick(&mut self) {
        if let Some((since, delay)) = self.rt.retry {
            if has_elapsed(self.now, since, delay) {
                self.rt.retry = None;
                self.rt.pending.push_back(SessionEvent::RetryDue);
                self.process_events();
            }
        }

        let boots = self.boots;
        self.step_update();
        if self.boots != boots {
            return;
        }

        if let Some(off) = self.rt.light.poll(self.now) {
            self.set_indicator(off);
        }
        self.render();

        let door_due = self.rt.door_checked.is_none_or(|at| {
            has_elapsed(
                self.now,
                at,
                duration_millis(self.config.timing.door_poll_interval),
            )
        });
        if door_due {
            self.rt.door_checked = Some(self.now);
            if let Some(levels) = self.hw.door.read() {
                let status = DoorStatus::from_sensors(levels.left, levels.right);
                if status != self.rt.reporter.door_status() {
                    self.emit(format!("door {}", status.as_str()));
                }
                self.rt.reporter.observe_door(status);
            }
        }
        self.poll_status();
    }

    fn step_update(&mut self) {
        let Some(active) = self.rt.update.as_mut() else {
            return;
        };
        if !has_elapsed(self.now, active.started, active.delay) {
            return;
        }

        let step = active.procedure.step(
            self.now,
            &mut self.hw.fetch,
            &mut self.hw.slots,
            &mut self.hw.store,
            &self.rt.shared.update_cancel,
        );
        match step {
            UpdateStep::Continue { delay, report } => {
                active.started = self.now;
                active.delay = duration_millis(delay);
                if let Some(report) = report {
                    self.report_update(&report);
                }
            }
            UpdateStep::Finished { outcome, report } => {
                self.report_update(&report);
                self.rt.update = None;
                self.rt.shared.update_cancel.clear();
                self.flush();
                if outcome.requires_restart() {
                    self.restart(RestartReason::UpdateApplied);
                }
            }
        }
    }

    fn report_update(&mut self, report: &UpdateReport) {
        self.emit(report.to_string());
        let delivery = publish_report(
            &mut self.hw.publisher,
            self.rt.shared.session.view(),
            self.config.device_name,
            &self.config.topics,
            report,
        );
        if let Delivery::Failed(err) = delivery {
            self.emit(format!("update report not delivered: {err}"));
        }
    }

    fn poll_status(&mut self) {
        let snapshot = DeviceSnapshot {
            uptime_ms: self.rt.uptime_ms,
            motion_events: self.rt.motion_events,
            dropped_events: self.rt.dropped.count().wrapping_add(self.rt.motion.lost()),
            running_partition: Some(self.hw.slots.running),
        };
        let summary = self.rt.reporter.poll(
            self.now,
            self.rt.shared.session.view(),
            &snapshot,
            &mut self.hw.publisher,
        );
        if summary.failed > 0 {
            self.emit(format!(
                "{} status messages not delivered; will retry",
                summary.failed
            ));
        }
    }

    fn flush(&mut self) {
        for (topic, payload) in self.hw.publisher.drain() {
            self.output.push(format!("pub {topic} {payload}"));
        }
    }

    pub fn describe(&self) -> Vec<String> {
        let view = self.rt.shared.session.view();
        let update = match self.update_state() {
            Some(state) => state.as_str(),
            None => "idle",
        };
        vec![
            format!("clock      +{} ms (boot #{})", self.now, self.boots),
            format!(
                "session    {} (epoch {}, reconnects {})",
                view.state().as_str(),
                view.epoch(),
                view.reconnects()
            ),
            format!("indicator  {}", self.rt.indicator.current()),
            format!("rgb        {:?}", self.hw.pixel.shown),
            format!(
                "motion     {} events, {} suppressed, {} lost",
                self.rt.motion_events,
                self.rt.motion.suppressed(),
                self.rt.motion.lost()
            ),
            format!("door       {}", self.rt.reporter.door_status().as_str()),
            format!(
                "update     {update} (running {}, {} rejected)",
                self.hw.slots.running,
                self.rt.shared.update_guard.rejected()
            ),
        ]
    }
}

fn describe_boot(kind: BootKind) -> String {
    match kind {
        BootKind::Normal => "normal".to_string(),
        BootKind::PostUpdate { previous, running } => {
            format!("post-update {previous} -> {running}")
        }
        BootKind::UpdateNotApplied { expected, running } => {
            format!("update to {expected} not applied, still {running}")
        }
    }
}

/// Builds the transport fault reported by `bus error <code>`.
pub fn transport_fault(code: i32) -> BusFault {
    BusFault::Transport {
        transport_code: code,
        tls_stack_code: 0,
        cert_verify_flags: 0,
    }
}

pub struct HostNetwork {
    pub link_available: bool,
    pub broker_available: bool,
}

pub struct HostQueue {
    capacity: usize,
    events: RefCell<VecDeque<MotionEvent>>,
}

impl HostQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: RefCell::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn pop(&self) -> Option<MotionEvent> {
        self.events.borrow_mut().pop_front()
    }
}

impl EventProducer<MotionEvent> for HostQueue {
    fn try_enqueue(&self, item: MotionEvent) -> Result<(), EnqueueError<MotionEvent>> {
        let mut events = self.events.borrow_mut();
        if events.len() >= self.capacity {
            return Err(EnqueueError::Full(item));
        }
        events.push_back(item);
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }
}

/// Scripted image server.
pub struct HostFetch {
    pub image_chunks: u32,
    pub fail_begins: u32,
    pub fail_chunks: u32,
    served: u32,
}

impl HostFetch {
    fn new(image_chunks: u32) -> Self {
        Self {
            image_chunks,
            fail_begins: 0,
            fail_chunks: 0,
            served: 0,
        }
    }
}

impl ImageFetch for HostFetch {
    fn begin(&mut self, _: &str, _: &[u8]) -> Result<(), FetchError> {
        if self.fail_begins > 0 {
            self.fail_begins -= 1;
            return Err(FetchError::Connect);
        }
        self.served = 0;
        Ok(())
    }

    fn perform_chunk(&mut self) -> ChunkStatus {
        if self.fail_chunks > 0 {
            self.fail_chunks -= 1;
            return ChunkStatus::Failed(FetchError::Timeout);
        }
        if self.served < self.image_chunks {
            self.served += 1;
            ChunkStatus::InProgress
        } else {
            ChunkStatus::Done
        }
    }

    fn is_complete(&self) -> bool {
        self.served == self.image_chunks
    }

    fn finish(&mut self) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Two-slot boot manager.
pub struct HostSlots {
    pub running: PartitionId,
    pub boot: PartitionId,
    pub reason: ResetReason,
}

impl Default for HostSlots {
    fn default() -> Self {
        Self {
            running: PartitionId(0),
            boot: PartitionId(0),
            reason: ResetReason::PowerOn,
        }
    }
}

impl HostSlots {
    fn reboot(&mut self) {
        self.running = self.boot;
        self.reason = ResetReason::Software;
    }
}

impl BootPartitions for HostSlots {
    fn running_partition(&self) -> PartitionId {
        self.running
    }

    fn next_update_partition(&self) -> Option<PartitionId> {
        Some(PartitionId(1 - self.running.0))
    }

    fn set_boot_partition(&mut self, partition: PartitionId) -> Result<(), BootError> {
        self.boot = partition;
        Ok(())
    }

    fn reset_reason(&self) -> ResetReason {
        self.reason
    }
}

#[derive(Default)]
pub struct HostStore {
    values: HashMap<String, u32>,
}

impl KeyValueStore for HostStore {
    fn get(&mut self, key: &str) -> Result<Option<u32>, StoreError> {
        Ok(self.values.get(key).copied())
    }

    fn set(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn erase(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct HostPublisher {
    pub fail_next: u32,
    sent: Vec<(String, String)>,
    history: Vec<(String, String)>,
}

impl HostPublisher {
    fn drain(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.sent)
    }

    /// Every message published since startup.
    pub fn history(&self) -> &[(String, String)] {
        &self.history
    }
}

impl Publish for HostPublisher {
    fn publish(&mut self, topic: &str, payload: &[u8], _: Qos) -> Result<(), BusError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(BusError::Timeout);
        }
        let message = (
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        );
        self.sent.push(message.clone());
        self.history.push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct HostDoor {
    levels: Option<DoorLevels>,
}

impl DoorSensors for HostDoor {
    fn read(&mut self) -> Option<DoorLevels> {
        self.levels
    }
}

#[derive(Default)]
pub struct HostPixel {
    staged: [u16; 3],
    pub shown: Rgb,
}

impl PixelDriver for HostPixel {
    fn set_channel(&mut self, channel: ChannelId, intensity: u16) -> Result<(), PixelError> {
        let index = match channel {
            ChannelId::Red => 0,
            ChannelId::Green => 1,
            ChannelId::Blue => 2,
        };
        self.staged[index] = intensity;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), PixelError> {
        self.shown = Rgb::new(self.staged[0], self.staged[1], self.staged[2]);
        Ok(())
    }
}

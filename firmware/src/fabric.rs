//! Bounded channels and shared cells connecting the device workers.
//!
//! Every queue uses a critical-section mutex because the motion interrupt and
//! the bus callbacks enqueue from outside the executor.

use core::cell::Cell;
use core::fmt;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender, TryReceiveError, TrySendError};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, with_timeout};
use node_core::command::InboundMessage;
use node_core::config::{CHANNEL_DEPTH, DEFAULT_DEBOUNCE_WINDOW};
use node_core::debounce::{Debouncer, MotionEvent, MotionInput};
use node_core::fabric::{
    CancelFlag, DropCounter, EnqueueError, EventProducer, GuardToken, LifecycleGuard, offer,
};
use node_core::indicator::{IndicatorCell, IndicatorState};
use node_core::session::{SessionCell, SessionEvent};
use portable_atomic::{AtomicU32, Ordering};

pub type FabricMutex = CriticalSectionRawMutex;

/// Debounce window baked into [`Fabric::new`].
#[allow(clippy::cast_possible_truncation)]
pub const DEFAULT_DEBOUNCE_MS: u32 = DEFAULT_DEBOUNCE_WINDOW.as_millis() as u32;

/// Only one pending update request can exist while the guard is held.
pub const UPDATE_REQUEST_DEPTH: usize = 1;

/// A bounded send did not complete before its deadline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SendTimeout;

impl fmt::Display for SendTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("channel send deadline expired")
    }
}

/// Fixed-capacity FIFO channel.
pub struct Queue<T, const N: usize = CHANNEL_DEPTH> {
    channel: Channel<FabricMutex, T, N>,
}

impl<T, const N: usize> Queue<T, N> {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
        }
    }

    pub fn sender(&self) -> Sender<'_, FabricMutex, T, N> {
        self.channel.sender()
    }

    pub fn receiver(&self) -> Receiver<'_, FabricMutex, T, N> {
        self.channel.receiver()
    }

    pub async fn receive(&self) -> T {
        self.channel.receive().await
    }

    pub fn try_receive(&self) -> Option<T> {
        match self.channel.try_receive() {
            Ok(item) => Some(item),
            Err(TryReceiveError::Empty) => None,
        }
    }

    /// Waits up to `deadline` for space; the item is discarded on timeout.
    pub async fn send_within(&self, item: T, deadline: Duration) -> Result<(), SendTimeout> {
        with_timeout(deadline, self.channel.send(item))
            .await
            .map_err(|_| SendTimeout)
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }
}

impl<T, const N: usize> Default for Queue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> EventProducer<T> for Queue<T, N> {
    fn try_enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        match self.channel.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => Err(EnqueueError::Full(item)),
        }
    }

    fn capacity(&self) -> Option<usize> {
        Some(N)
    }
}

/// Session callbacks outrank each other by how much recovery depends on them.
const fn urgency(event: SessionEvent) -> u8 {
    match event {
        SessionEvent::BusError(_) => 4,
        SessionEvent::LinkDown => 3,
        SessionEvent::BusDisconnected | SessionEvent::BusStartFailed => 2,
        SessionEvent::LinkUp | SessionEvent::BusConnected => 1,
        SessionEvent::RetryDue => 0,
    }
}

/// One-slot holding area for a session event that found the queue full.
///
/// The slot keeps the most urgent event offered since the worker last
/// drained it, so a lost link or bus is never forgotten behind a burst of
/// routine callbacks.
pub struct OverflowLatch {
    slot: Mutex<FabricMutex, Cell<Option<SessionEvent>>>,
    ready: Signal<FabricMutex, ()>,
}

impl OverflowLatch {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(Cell::new(None)),
            ready: Signal::new(),
        }
    }

    /// Latches `event` unless a more urgent one is already held.
    /// Returns whichever event lost out.
    pub fn latch(&self, event: SessionEvent) -> Option<SessionEvent> {
        let displaced = self.slot.lock(|slot| match slot.get() {
            Some(held) if urgency(held) >= urgency(event) => Some(event),
            held => {
                slot.set(Some(event));
                held
            }
        });
        self.ready.signal(());
        displaced
    }

    pub fn take(&self) -> Option<SessionEvent> {
        self.slot.lock(Cell::take)
    }

    /// Waits until an event is latched and takes it.
    pub async fn wait(&self) -> SessionEvent {
        loop {
            self.ready.wait().await;
            if let Some(event) = self.take() {
                return event;
            }
        }
    }
}

impl Default for OverflowLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the workers share. Lives in a `static`.
pub struct Fabric {
    /// Interrupt-side motion pipeline; its producer is the motion queue.
    pub motion: MotionInput<Queue<MotionEvent>>,
    pub indicator_commands: Queue<IndicatorState>,
    pub session_events: Queue<SessionEvent>,
    /// Catches the session event that did not fit `session_events`.
    pub session_overflow: OverflowLatch,
    pub inbound: Queue<InboundMessage>,
    pub update_requests: Queue<GuardToken<'static>, UPDATE_REQUEST_DEPTH>,
    pub update_guard: LifecycleGuard,
    pub update_cancel: CancelFlag,
    pub indicator: IndicatorCell,
    pub session: SessionCell,
    /// Items lost to full channels outside the motion path.
    pub dropped: DropCounter,
    /// Raised with the session epoch each time workers (re)start.
    pub worker_start: Signal<FabricMutex, u32>,
    pub telemetry_request: Signal<FabricMutex, ()>,
    motion_events: AtomicU32,
}

impl Fabric {
    pub const fn new() -> Self {
        Self::with_debounce(DEFAULT_DEBOUNCE_MS)
    }

    pub const fn with_debounce(window_ms: u32) -> Self {
        Self {
            motion: MotionInput::new(Debouncer::new(window_ms), Queue::new()),
            indicator_commands: Queue::new(),
            session_events: Queue::new(),
            session_overflow: OverflowLatch::new(),
            inbound: Queue::new(),
            update_requests: Queue::new(),
            update_guard: LifecycleGuard::new("update"),
            update_cancel: CancelFlag::new(),
            indicator: IndicatorCell::new(IndicatorState::Off),
            session: SessionCell::new(),
            dropped: DropCounter::new(),
            worker_start: Signal::new(),
            telemetry_request: Signal::new(),
            motion_events: AtomicU32::new(0),
        }
    }

    /// Hands a link or bus callback to the session worker without blocking.
    ///
    /// Returns `false` when the queue was full; the event then goes to
    /// [`Fabric::session_overflow`] and only a less urgent event is dropped.
    pub fn post_session_event(&self, event: SessionEvent) -> bool {
        match self.session_events.try_enqueue(event) {
            Ok(()) => true,
            Err(EnqueueError::Full(event)) => {
                if let Some(displaced) = self.session_overflow.latch(event) {
                    self.dropped.record();
                    log_session_event_dropped(displaced);
                }
                false
            }
        }
    }

    /// Copies a bus data callback into the inbound queue without blocking.
    pub fn post_inbound(&self, topic: &str, payload: &[u8]) -> bool {
        match InboundMessage::new(topic, payload) {
            Ok(message) => {
                let accepted = offer(&self.inbound, &self.dropped, message);
                if !accepted {
                    log_inbound_dropped(topic);
                }
                accepted
            }
            Err(err) => {
                log_inbound_rejected(topic, err);
                false
            }
        }
    }

    pub fn record_motion(&self) -> u32 {
        self.motion_events
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    pub fn motion_events(&self) -> u32 {
        self.motion_events.load(Ordering::Relaxed)
    }

    /// Events lost on any channel, motion included.
    pub fn dropped_events(&self) -> u32 {
        self.dropped.count().wrapping_add(self.motion.lost())
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "none")]
fn log_session_event_dropped(event: SessionEvent) {
    defmt::warn!(
        "session queue full; dropped {}",
        defmt::Debug2Format(&event)
    );
}

#[cfg(not(target_os = "none"))]
fn log_session_event_dropped(event: SessionEvent) {
    println!("session queue full; dropped {event:?}");
}

#[cfg(target_os = "none")]
fn log_inbound_dropped(topic: &str) {
    defmt::warn!("inbound queue full; dropped message on {=str}", topic);
}

#[cfg(not(target_os = "none"))]
fn log_inbound_dropped(topic: &str) {
    println!("inbound queue full; dropped message on {topic}");
}

#[cfg(target_os = "none")]
fn log_inbound_rejected(topic: &str, err: node_core::command::CommandError) {
    defmt::warn!(
        "inbound message on {=str} rejected: {}",
        topic,
        defmt::Display2Format(&err)
    );
}

#[cfg(not(target_os = "none"))]
fn log_inbound_rejected(topic: &str, err: node_core::command::CommandError) {
    println!("inbound message on {topic} rejected: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use node_core::debounce::EdgeOutcome;

    #[test]
    fn queue_reports_full_without_blocking() {
        let queue: Queue<u8, 2> = Queue::new();
        assert_eq!(queue.capacity(), Some(2));
        assert!(queue.try_enqueue(1).is_ok());
        assert!(queue.try_enqueue(2).is_ok());
        assert_eq!(queue.try_enqueue(3), Err(EnqueueError::Full(3)));
        assert_eq!(queue.try_receive(), Some(1));
        assert_eq!(queue.try_receive(), Some(2));
        assert_eq!(queue.try_receive(), None);
    }

    #[test]
    fn send_within_gives_up_on_full_queue() {
        let queue: Queue<u8, 1> = Queue::new();
        block_on(async {
            assert_eq!(queue.send_within(1, Duration::from_millis(5)).await, Ok(()));
            assert_eq!(
                queue.send_within(2, Duration::from_millis(5)).await,
                Err(SendTimeout)
            );
        });
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn motion_edges_land_in_fabric_queue() {
        static FABRIC: Fabric = Fabric::with_debounce(1_000);

        assert_eq!(
            FABRIC.motion.on_edge(0),
            EdgeOutcome::Enqueued(MotionEvent { timestamp: 0 })
        );
        assert_eq!(FABRIC.motion.on_edge(500), EdgeOutcome::Suppressed);
        assert_eq!(
            FABRIC.motion.producer().try_receive(),
            Some(MotionEvent { timestamp: 0 })
        );
        assert!(FABRIC.motion.producer().is_empty());
    }

    #[test]
    fn flooded_session_queue_latches_most_urgent_event() {
        static FABRIC: Fabric = Fabric::new();

        for _ in 0..CHANNEL_DEPTH {
            assert!(FABRIC.post_session_event(SessionEvent::BusConnected));
        }
        assert!(!FABRIC.post_session_event(SessionEvent::LinkUp));
        assert_eq!(FABRIC.dropped.count(), 0);

        assert!(!FABRIC.post_session_event(SessionEvent::LinkDown));
        assert!(!FABRIC.post_session_event(SessionEvent::RetryDue));
        assert_eq!(FABRIC.dropped.count(), 2);
        assert_eq!(FABRIC.dropped_events(), 2);

        assert_eq!(FABRIC.session_overflow.take(), Some(SessionEvent::LinkDown));
        assert_eq!(FABRIC.session_overflow.take(), None);
        assert_eq!(FABRIC.session_events.len(), CHANNEL_DEPTH);
    }

    #[test]
    fn latched_event_wakes_waiter() {
        let latch = OverflowLatch::new();
        assert_eq!(latch.latch(SessionEvent::BusDisconnected), None);
        assert_eq!(block_on(latch.wait()), SessionEvent::BusDisconnected);
        assert_eq!(latch.take(), None);
    }

    #[test]
    fn oversized_inbound_payload_is_rejected() {
        static FABRIC: Fabric = Fabric::new();

        assert!(!FABRIC.post_inbound("coop/led", &[b'x'; 65]));
        assert!(FABRIC.post_inbound("coop/led", b"LED_SOLID_RED"));
        assert_eq!(FABRIC.inbound.len(), 1);
    }
}

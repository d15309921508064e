//! Motion edge debouncing.
//!
//! [`Debouncer::on_edge`] runs in interrupt context: it only touches atomics,
//! never blocks, and never allocates.

use core::time::Duration;

use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::clock::{Millis, duration_millis, elapsed};
use crate::config::DEFAULT_DEBOUNCE_WINDOW;
use crate::fabric::{DropCounter, EnqueueError, EventProducer};

/// A validated motion detection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MotionEvent {
    pub timestamp: Millis,
}

/// Accepts an edge only when the debounce window has passed since the last
/// accepted one.
#[derive(Debug)]
pub struct Debouncer {
    window: Millis,
    last_accepted: AtomicU32,
    primed: AtomicBool,
}

impl Debouncer {
    pub const fn new(window_ms: Millis) -> Self {
        Self {
            window: window_ms,
            last_accepted: AtomicU32::new(0),
            primed: AtomicBool::new(false),
        }
    }

    pub fn with_window(window: Duration) -> Self {
        Self::new(duration_millis(window))
    }

    pub const fn window_ms(&self) -> Millis {
        self.window
    }

    /// Filters one raw edge. The first edge after construction is always accepted.
    pub fn on_edge(&self, timestamp: Millis) -> Option<MotionEvent> {
        if self.primed.load(Ordering::Acquire) {
            let last = self.last_accepted.load(Ordering::Relaxed);
            if elapsed(timestamp, last) < self.window {
                return None;
            }
        }

        self.last_accepted.store(timestamp, Ordering::Relaxed);
        self.primed.store(true, Ordering::Release);
        Some(MotionEvent { timestamp })
    }

    /// Timestamp of the most recently accepted edge, if any.
    pub fn last_accepted(&self) -> Option<Millis> {
        self.primed
            .load(Ordering::Acquire)
            .then(|| self.last_accepted.load(Ordering::Relaxed))
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::with_window(DEFAULT_DEBOUNCE_WINDOW)
    }
}

/// Result of feeding one edge through a [`MotionInput`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EdgeOutcome {
    /// Inside the debounce window; nothing emitted.
    Suppressed,
    /// Accepted and handed to the motion worker.
    Enqueued(MotionEvent),
    /// Accepted but the channel was full; counted as lost.
    Dropped(MotionEvent),
}

/// Interrupt-side motion pipeline: debounce, then a non-blocking enqueue.
pub struct MotionInput<P> {
    debouncer: Debouncer,
    producer: P,
    lost: DropCounter,
    suppressed: AtomicU32,
}

impl<P> MotionInput<P>
where
    P: EventProducer<MotionEvent>,
{
    pub const fn new(debouncer: Debouncer, producer: P) -> Self {
        Self {
            debouncer,
            producer,
            lost: DropCounter::new(),
            suppressed: AtomicU32::new(0),
        }
    }

    /// Entry point for the motion interrupt.
    pub fn on_edge(&self, timestamp: Millis) -> EdgeOutcome {
        let Some(event) = self.debouncer.on_edge(timestamp) else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return EdgeOutcome::Suppressed;
        };

        match self.producer.try_enqueue(event) {
            Ok(()) => EdgeOutcome::Enqueued(event),
            Err(EnqueueError::Full(event)) => {
                self.lost.record();
                EdgeOutcome::Dropped(event)
            }
        }
    }

    /// Accepted events that never reached the worker.
    pub fn lost(&self) -> u32 {
        self.lost.count()
    }

    /// Edges rejected by the debounce window.
    pub fn suppressed(&self) -> u32 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }
}

//! Message-fabric contracts and lifecycle guards.
//!
//! The concrete bounded channels live with the executor; this module pins down
//! how producers talk to them and how singleton procedures are guarded.

use core::fmt;

use portable_atomic::{AtomicBool, AtomicU32, Ordering};

/// Error surfaced when an event cannot be enqueued without blocking.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EnqueueError<T> {
    /// Channel is at capacity; the item is handed back.
    Full(T),
}

impl<T> EnqueueError<T> {
    /// Returns the item that could not be delivered.
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Full(item) => item,
        }
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full(_) => f.write_str("channel full"),
        }
    }
}

/// Non-blocking producer half of a bounded channel.
///
/// Takes `&self` so it can be shared with an interrupt handler; implementations
/// must never block, allocate, or wait on a lock held by ordinary workers.
pub trait EventProducer<T> {
    fn try_enqueue(&self, item: T) -> Result<(), EnqueueError<T>>;

    /// Returns the channel capacity when the backend exposes it.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Producer that accepts and discards everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopProducer;

impl<T> EventProducer<T> for NoopProducer {
    fn try_enqueue(&self, _: T) -> Result<(), EnqueueError<T>> {
        Ok(())
    }
}

/// Counts items dropped because a channel was full.
#[derive(Debug, Default)]
pub struct DropCounter {
    dropped: AtomicU32,
}

impl DropCounter {
    pub const fn new() -> Self {
        Self {
            dropped: AtomicU32::new(0),
        }
    }

    /// Records one drop and returns the running total.
    pub fn record(&self) -> u32 {
        self.dropped.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn count(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Enqueues `item`, counting it as dropped when the channel is full.
///
/// Returns `true` when the item was accepted.
pub fn offer<T, P>(producer: &P, drops: &DropCounter, item: T) -> bool
where
    P: EventProducer<T> + ?Sized,
{
    match producer.try_enqueue(item) {
        Ok(()) => true,
        Err(EnqueueError::Full(_)) => {
            drops.record();
            false
        }
    }
}

/// Single-owner guard enforcing at most one live instance of a procedure.
///
/// Acquisition never waits: a held guard yields `None` and the caller is
/// expected to log and drop the request.
#[derive(Debug)]
pub struct LifecycleGuard {
    name: &'static str,
    held: AtomicBool,
    rejected: AtomicU32,
}

impl LifecycleGuard {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            held: AtomicBool::new(false),
            rejected: AtomicU32::new(0),
        }
    }

    /// Claims the guard, or returns `None` when another owner holds it.
    pub fn try_acquire(&self) -> Option<GuardToken<'_>> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(GuardToken { guard: self })
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Returns `true` while a token is alive.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Number of acquisitions refused since startup.
    pub fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Proof of ownership for a [`LifecycleGuard`]; releases it on drop.
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a LifecycleGuard,
}

impl GuardToken<'_> {
    pub fn name(&self) -> &'static str {
        self.guard.name
    }
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.guard.held.store(false, Ordering::Release);
    }
}

/// Cooperative cancellation request checked by long-running loops.
#[derive(Debug, Default)]
pub struct CancelFlag {
    requested: AtomicBool,
}

impl CancelFlag {
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use core::cell::RefCell;
    use heapless::Vec;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread;

    struct BoundedQueue {
        items: RefCell<Vec<u32, 2>>,
    }

    impl EventProducer<u32> for BoundedQueue {
        fn try_enqueue(&self, item: u32) -> Result<(), EnqueueError<u32>> {
            self.items
                .borrow_mut()
                .push(item)
                .map_err(EnqueueError::Full)
        }

        fn capacity(&self) -> Option<usize> {
            Some(2)
        }
    }

    #[test]
    fn offer_counts_drops_when_full() {
        let queue = BoundedQueue {
            items: RefCell::new(Vec::new()),
        };
        let drops = DropCounter::new();

        assert!(offer(&queue, &drops, 1));
        assert!(offer(&queue, &drops, 2));
        assert!(!offer(&queue, &drops, 3));
        assert!(!offer(&queue, &drops, 4));

        assert_eq!(drops.count(), 2);
        assert_eq!(queue.items.borrow().as_slice(), &[1, 2]);
    }

    #[test]
    fn guard_rejects_second_owner_until_released() {
        let guard = LifecycleGuard::new("update");
        let token = guard.try_acquire().expect("first acquire");
        assert!(guard.is_held());
        assert!(guard.try_acquire().is_none());
        assert_eq!(guard.rejected(), 1);

        drop(token);
        assert!(!guard.is_held());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn concurrent_triggers_admit_exactly_one() {
        const CONTENDERS: usize = 8;

        let guard = Arc::new(LifecycleGuard::new("update"));
        let barrier = Arc::new(Barrier::new(CONTENDERS));
        let release = Arc::new(Barrier::new(CONTENDERS));

        let handles: std::vec::Vec<_> = (0..CONTENDERS)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let barrier = Arc::clone(&barrier);
                let release = Arc::clone(&release);
                thread::spawn(move || {
                    barrier.wait();
                    let token = guard.try_acquire();
                    let accepted = token.is_some();
                    // Hold any token until every contender has tried.
                    release.wait();
                    drop(token);
                    accepted
                })
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|handle| handle.join().expect("contender panicked"))
            .filter(|accepted| *accepted)
            .count();

        assert_eq!(accepted, 1);
        assert_eq!(guard.rejected(), u32::try_from(CONTENDERS - 1).unwrap());
        assert!(!guard.is_held());
    }

    #[test]
    fn cancel_flag_round_trip() {
        let flag = CancelFlag::new();
        assert!(!flag.is_requested());
        flag.request();
        assert!(flag.is_requested());
        flag.clear();
        assert!(!flag.is_requested());
    }
}

use std::sync::{Arc, Barrier};
use std::thread;

use node_core::boot::{
    BootError, BootKind, BootPartitions, KeyValueStore, PartitionId, ResetReason, StoreError,
    classify_boot,
};
use node_core::clock::{Millis, duration_millis};
use node_core::config::{Timing, Topics, UpdateSource};
use node_core::fabric::{CancelFlag, LifecycleGuard};
use node_core::session::{
    BusError, Publish, Qos, SessionCell, SessionEvent, SessionSupervisor,
};
use node_core::status::Delivery;
use node_core::update::{
    ChunkStatus, FetchError, ImageFetch, UpdateError, UpdateOutcome, UpdateProcedure,
    UpdateStep, publish_report,
};

const SOURCE: UpdateSource = UpdateSource {
    url: "https://updates.local/coop.bin",
    root_ca: b"-----BEGIN CERTIFICATE-----",
};

#[test]
fn session_drop_mid_update_skips_publishing_but_still_switches() {
    let cell = SessionCell::new();
    let mut supervisor = SessionSupervisor::new(&cell, &Timing::default());
    supervisor.start();
    supervisor.handle(SessionEvent::LinkUp);
    supervisor.handle(SessionEvent::BusConnected);

    let timing = Timing {
        update_progress_interval: 1,
        ..Timing::default()
    };
    let mut procedure = UpdateProcedure::new(SOURCE, &timing);
    let mut fetch = ScriptedFetch::new(vec![
        ChunkStatus::InProgress,
        ChunkStatus::InProgress,
        ChunkStatus::Failed(FetchError::Timeout),
        ChunkStatus::InProgress,
        ChunkStatus::InProgress,
    ]);
    let mut slots = Slots::running(0);
    let mut store = MemoryStore::default();
    let cancel = CancelFlag::new();
    let mut publisher = RecordingPublisher::default();
    let topics = Topics::default();

    let mut now: Millis = 0;
    let mut steps = 0;
    let mut sent_before_drop = 0;
    let outcome = loop {
        if steps == 3 {
            // Bus-level drop: workers stop but the update is not cancelled.
            supervisor.handle(SessionEvent::BusDisconnected);
            assert!(!cell.view().is_connected());
            sent_before_drop = publisher.messages.len();
        }
        steps += 1;

        match procedure.step(now, &mut fetch, &mut slots, &mut store, &cancel) {
            UpdateStep::Continue { delay, report } => {
                if let Some(report) = report {
                    let delivery =
                        publish_report(&mut publisher, cell.view(), "coop", &topics, &report);
                    if !cell.view().is_connected() {
                        assert_eq!(delivery, Delivery::Skipped);
                    }
                }
                now = now.wrapping_add(duration_millis(delay));
            }
            UpdateStep::Finished { outcome, report } => {
                publish_report(&mut publisher, cell.view(), "coop", &topics, &report);
                break outcome;
            }
        }
        assert!(steps < 100, "update did not finish");
    };

    assert!(outcome.requires_restart());
    assert_eq!(slots.switched_to, Some(PartitionId(1)));
    assert_eq!(fetch.chunks_performed, 6);
    assert!(sent_before_drop > 0);
    assert_eq!(
        publisher.messages.len(),
        sent_before_drop,
        "nothing may be published after the session dropped"
    );
}

#[test]
fn five_consecutive_failures_never_touch_boot_partition() {
    let mut procedure = UpdateProcedure::new(SOURCE, &Timing::default());
    let mut fetch = ScriptedFetch::new(vec![ChunkStatus::Failed(FetchError::Http(503)); 5]);
    let mut slots = Slots::running(0);
    let mut store = MemoryStore::default();
    let cancel = CancelFlag::new();

    let outcome = drive(&mut procedure, &mut fetch, &mut slots, &mut store, &cancel);

    assert_eq!(
        outcome,
        UpdateOutcome::Aborted(UpdateError::FetchExhausted {
            failures: 5,
            last: FetchError::Http(503),
        })
    );
    assert_eq!(slots.switch_calls, 0);
    assert_eq!(fetch.chunks_performed, 5);
    assert_eq!(store.value, None);
}

#[test]
fn boot_record_round_trip_reports_once() {
    let mut procedure = UpdateProcedure::new(SOURCE, &Timing::default());
    let mut fetch = ScriptedFetch::new(vec![ChunkStatus::InProgress]);
    let mut slots = Slots::running(0);
    let mut store = MemoryStore::default();
    let cancel = CancelFlag::new();

    let outcome = drive(&mut procedure, &mut fetch, &mut slots, &mut store, &cancel);
    assert!(outcome.requires_restart());

    // Restart into the freshly written slot.
    let rebooted = Slots {
        running: PartitionId(1),
        reason: ResetReason::Software,
        ..Slots::running(1)
    };
    assert_eq!(
        classify_boot(&mut store, &rebooted).expect("store readable"),
        BootKind::PostUpdate {
            previous: PartitionId(0),
            running: PartitionId(1),
        }
    );
    assert_eq!(
        classify_boot(&mut store, &rebooted).expect("store readable"),
        BootKind::Normal
    );
}

#[test]
fn concurrent_triggers_admit_exactly_one_update() {
    const CONTENDERS: usize = 16;
    let guard = Arc::new(LifecycleGuard::new("update"));
    let barrier = Arc::new(Barrier::new(CONTENDERS));
    let release = Arc::new(Barrier::new(CONTENDERS));

    let handles: Vec<_> = (0..CONTENDERS)
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
fn link_loss_cancels_running_update() {
    let mut procedure = UpdateProcedure::new(SOURCE, &Timing::default());
    let mut fetch = ScriptedFetch::new(vec![ChunkStatus::InProgress; 20]);
    let mut slots = Slots::running(0);
    let mut store = MemoryStore::default();
    let cancel = CancelFlag::new();

    for now in 0..3 {
        procedure.step(now, &mut fetch, &mut slots, &mut store, &cancel);
    }
    cancel.request();
    let outcome = drive(&mut procedure, &mut fetch, &mut slots, &mut store, &cancel);

    assert_eq!(outcome, UpdateOutcome::Cancelled);
    assert_eq!(slots.switch_calls, 0);
}

fn drive(
    procedure: &mut UpdateProcedure,
    fetch: &mut ScriptedFetch,
    slots: &mut Slots,
    store: &mut MemoryStore,
    cancel: &CancelFlag,
) -> UpdateOutcome {
    let mut now: Millis = 0;
    for _ in 0..1_000 {
        match procedure.step(now, fetch, slots, store, cancel) {
            UpdateStep::Continue { delay, .. } => now = now.wrapping_add(duration_millis(delay)),
            UpdateStep::Finished { outcome, .. } => return outcome,
        }
    }
    panic!("update did not finish");
}

struct ScriptedFetch {
    script: Vec<ChunkStatus>,
    chunks_performed: usize,
}

impl ScriptedFetch {
    fn new(script: Vec<ChunkStatus>) -> Self {
        Self {
            script,
            chunks_performed: 0,
        }
    }
}

impl ImageFetch for ScriptedFetch {
    fn begin(&mut self, url: &str, root_ca: &[u8]) -> Result<(), FetchError> {
        assert_eq!(url, SOURCE.url);
        assert!(!root_ca.is_empty());
        Ok(())
    }

    fn perform_chunk(&mut self) -> ChunkStatus {
        let status = self
            .script
            .get(self.chunks_performed)
            .copied()
            .unwrap_or(ChunkStatus::Done);
        self.chunks_performed += 1;
        status
    }

    fn is_complete(&self) -> bool {
        self.chunks_performed > self.script.len()
    }

    fn finish(&mut self) -> Result<(), FetchError> {
        Ok(())
    }
}

struct Slots {
    running: PartitionId,
    reason: ResetReason,
    switched_to: Option<PartitionId>,
    switch_calls: u32,
}

impl Slots {
    fn running(slot: u8) -> Self {
        Self {
            running: PartitionId(slot),
            reason: ResetReason::PowerOn,
            switched_to: None,
            switch_calls: 0,
        }
    }
}

impl BootPartitions for Slots {
    fn running_partition(&self) -> PartitionId {
        self.running
    }

    fn next_update_partition(&self) -> Option<PartitionId> {
        Some(PartitionId(1 - self.running.0))
    }

    fn set_boot_partition(&mut self, partition: PartitionId) -> Result<(), BootError> {
        self.switch_calls += 1;
        self.switched_to = Some(partition);
        Ok(())
    }

    fn reset_reason(&self) -> ResetReason {
        self.reason
    }
}

#[derive(Default)]
struct MemoryStore {
    value: Option<u32>,
}

impl KeyValueStore for MemoryStore {
    fn get(&mut self, _: &str) -> Result<Option<u32>, StoreError> {
        Ok(self.value)
    }

    fn set(&mut self, _: &str, value: u32) -> Result<(), StoreError> {
        self.value = Some(value);
        Ok(())
    }

    fn erase(&mut self, _: &str) -> Result<(), StoreError> {
        self.value = None;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    messages: Vec<(String, String)>,
}

impl Publish for RecordingPublisher {
    fn publish(&mut self, topic: &str, payload: &[u8], _: Qos) -> Result<(), BusError> {
        let payload = String::from_utf8(payload.to_vec()).map_err(|_| BusError::Transport)?;
        self.messages.push((topic.to_owned(), payload));
        Ok(())
    }
}

//! Firmware self-update procedure.
//!
//! [`UpdateProcedure`] walks `Idle → Fetching → Verifying → SwitchingBootImage
//! → Rebooting` one [`step`](UpdateProcedure::step) at a time. The caller owns
//! the timing: it sleeps for the returned delay between steps, publishes the
//! returned [`UpdateReport`]s while the session is up, and restarts the device
//! once the outcome is [`UpdateOutcome::Applied`]. The boot-partition switch
//! is the only step that cannot be undone and is never interrupted by
//! cancellation.

use core::{fmt, time::Duration};

use crate::boot::{BootError, BootPartitions, BootRecord, KeyValueStore, PartitionId, StoreError};
use crate::clock::{Millis, elapsed};
use crate::config::{Timing, Topics, UpdateSource};
use crate::fabric::CancelFlag;
use crate::retry::{DelaySchedule, RetryBudget, RetryDecision};
use crate::session::{Publish, SessionView};
use crate::status::{Delivery, Hms, publish_status};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum UpdateState {
    #[default]
    Idle,
    Fetching,
    Verifying,
    SwitchingBootImage,
    Rebooting,
}

impl UpdateState {
    pub const fn as_str(self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Fetching => "fetching",
            UpdateState::Verifying => "verifying",
            UpdateState::SwitchingBootImage => "switching-boot-image",
            UpdateState::Rebooting => "rebooting",
        }
    }
}

/// Failure reported by the image-fetch transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FetchError {
    Connect,
    Tls,
    Http(u16),
    Io,
    Timeout,
    /// Image header or signature rejected.
    InvalidImage,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Connect => f.write_str("connect failed"),
            FetchError::Tls => f.write_str("tls handshake failed"),
            FetchError::Http(status) => write!(f, "http status {status}"),
            FetchError::Io => f.write_str("image write failed"),
            FetchError::Timeout => f.write_str("transfer timed out"),
            FetchError::InvalidImage => f.write_str("image rejected"),
        }
    }
}

/// Result of one streamed transfer step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkStatus {
    InProgress,
    Done,
    Failed(FetchError),
}

/// Secure streamed image download into the inactive slot.
pub trait ImageFetch {
    fn begin(&mut self, url: &str, root_ca: &[u8]) -> Result<(), FetchError>;

    fn perform_chunk(&mut self) -> ChunkStatus;

    /// Whether the whole image has been received.
    fn is_complete(&self) -> bool;

    /// Validates and closes the written image.
    fn finish(&mut self) -> Result<(), FetchError>;

    /// Releases the transfer without finalizing it.
    fn abort(&mut self) {}
}

/// Why an update procedure gave up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateError {
    NoUpdatePartition,
    /// Consecutive fetch failures exhausted the retry budget.
    FetchExhausted { failures: u8, last: FetchError },
    /// Transfer ended before the full image arrived.
    Incomplete,
    Finalize(FetchError),
    Record(StoreError),
    Switch(BootError),
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::NoUpdatePartition => f.write_str("no partition available for update"),
            UpdateError::FetchExhausted { failures, last } => {
                write!(f, "giving up after {failures} failures, last: {last}")
            }
            UpdateError::Incomplete => f.write_str("complete image was not received"),
            UpdateError::Finalize(err) => write!(f, "image finalize failed: {err}"),
            UpdateError::Record(err) => write!(f, "boot record write failed: {err}"),
            UpdateError::Switch(err) => write!(f, "boot switch failed: {err}"),
        }
    }
}

/// Terminal result of an update procedure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// The boot partition now points at `target`; the device must restart.
    Applied { target: PartitionId, elapsed_ms: Millis },
    /// Old firmware stays active.
    Aborted(UpdateError),
    Cancelled,
}

impl UpdateOutcome {
    pub const fn requires_restart(self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

/// Observer-facing progress message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateReport {
    Started { target: PartitionId },
    Progress { iterations: u32 },
    Retrying { attempt: u8, limit: u8, error: FetchError },
    Failed(UpdateError),
    Cancelled,
    Completed { elapsed_ms: Millis },
}

impl fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateReport::Started { target } => write!(f, "update started, writing {target}"),
            UpdateReport::Progress { iterations } => {
                write!(f, "update in progress, {iterations} chunks")
            }
            UpdateReport::Retrying {
                attempt,
                limit,
                error,
            } => write!(f, "update retry {attempt}/{limit}: {error}"),
            UpdateReport::Failed(err) => write!(f, "update failed: {err}"),
            UpdateReport::Cancelled => f.write_str("update cancelled"),
            UpdateReport::Completed { elapsed_ms } => write!(
                f,
                "update successful, duration {}, restarting",
                Hms(u64::from(*elapsed_ms))
            ),
        }
    }
}

/// What the caller should do after a step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateStep {
    /// Wait `delay`, then step again.
    Continue {
        delay: Duration,
        report: Option<UpdateReport>,
    },
    Finished {
        outcome: UpdateOutcome,
        report: UpdateReport,
    },
}

/// One update procedure instance, from trigger to outcome.
#[derive(Debug)]
pub struct UpdateProcedure {
    source: UpdateSource,
    state: UpdateState,
    budget: RetryBudget,
    progress_every: u32,
    chunk_yield: Duration,
    iterations: u32,
    started_at: Option<Millis>,
    slots: Option<(PartitionId, PartitionId)>,
    applied: Option<UpdateOutcome>,
}

impl UpdateProcedure {
    pub fn new(source: UpdateSource, timing: &Timing) -> Self {
        Self {
            source,
            state: UpdateState::Idle,
            budget: RetryBudget::attempts(
                timing.update_max_attempts,
                DelaySchedule::Fixed(timing.update_retry_delay),
            ),
            progress_every: timing.update_progress_interval.max(1),
            chunk_yield: timing.update_chunk_yield,
            iterations: 0,
            started_at: None,
            slots: None,
            applied: None,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Consecutive failures recorded against the current budget.
    pub fn failures(&self) -> u8 {
        self.budget.failures()
    }

    /// Fetch loop iterations that made progress.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Advances the procedure by one transition.
    pub fn step<F, B, S>(
        &mut self,
        now: Millis,
        fetch: &mut F,
        partitions: &mut B,
        store: &mut S,
        cancel: &CancelFlag,
    ) -> UpdateStep
    where
        F: ImageFetch + ?Sized,
        B: BootPartitions + ?Sized,
        S: KeyValueStore + ?Sized,
    {
        let started_at = *self.started_at.get_or_insert(now);

        if cancel.is_requested() && matches!(self.state, UpdateState::Idle | UpdateState::Fetching) {
            fetch.abort();
            self.state = UpdateState::Idle;
            return UpdateStep::Finished {
                outcome: UpdateOutcome::Cancelled,
                report: UpdateReport::Cancelled,
            };
        }

        match self.state {
            UpdateState::Idle => {
                let Some(target) = partitions.next_update_partition() else {
                    return self.abort(fetch, UpdateError::NoUpdatePartition);
                };
                self.slots = Some((partitions.running_partition(), target));
                match fetch.begin(self.source.url, self.source.root_ca) {
                    Ok(()) => {
                        self.state = UpdateState::Fetching;
                        self.iterations = 0;
                        UpdateStep::Continue {
                            delay: Duration::ZERO,
                            report: Some(UpdateReport::Started { target }),
                        }
                    }
                    Err(err) => self.fetch_failed(fetch, err),
                }
            }
            UpdateState::Fetching => match fetch.perform_chunk() {
                ChunkStatus::InProgress => {
                    self.budget.reset();
                    let report = (self.iterations % self.progress_every == 0).then_some(
                        UpdateReport::Progress {
                            iterations: self.iterations,
                        },
                    );
                    self.iterations = self.iterations.saturating_add(1);
                    UpdateStep::Continue {
                        delay: self.chunk_yield,
                        report,
                    }
                }
                ChunkStatus::Done => {
                    self.budget.reset();
                    self.state = UpdateState::Verifying;
                    UpdateStep::Continue {
                        delay: Duration::ZERO,
                        report: None,
                    }
                }
                ChunkStatus::Failed(err) => self.fetch_failed(fetch, err),
            },
            UpdateState::Verifying => {
                if !fetch.is_complete() {
                    return self.abort(fetch, UpdateError::Incomplete);
                }
                match fetch.finish() {
                    Ok(()) => {
                        self.state = UpdateState::SwitchingBootImage;
                        UpdateStep::Continue {
                            delay: Duration::ZERO,
                            report: None,
                        }
                    }
                    Err(err) => self.abort(fetch, UpdateError::Finalize(err)),
                }
            }
            UpdateState::SwitchingBootImage => {
                let Some((previous, target)) = self.slots else {
                    return self.abort(fetch, UpdateError::NoUpdatePartition);
                };
                if let Err(err) = BootRecord::new(previous, target).store(store) {
                    return self.abort(fetch, UpdateError::Record(err));
                }
                if let Err(err) = partitions.set_boot_partition(target) {
                    // Best effort; a stale record classifies as not applied.
                    let _ = BootRecord::clear(store);
                    return self.abort(fetch, UpdateError::Switch(err));
                }
                let elapsed_ms = elapsed(now, started_at);
                let outcome = UpdateOutcome::Applied { target, elapsed_ms };
                self.state = UpdateState::Rebooting;
                self.applied = Some(outcome);
                UpdateStep::Finished {
                    outcome,
                    report: UpdateReport::Completed { elapsed_ms },
                }
            }
            UpdateState::Rebooting => match self.applied {
                Some(outcome @ UpdateOutcome::Applied { elapsed_ms, .. }) => UpdateStep::Finished {
                    outcome,
                    report: UpdateReport::Completed { elapsed_ms },
                },
                _ => self.abort(fetch, UpdateError::NoUpdatePartition),
            },
        }
    }

    fn fetch_failed<F>(&mut self, fetch: &mut F, err: FetchError) -> UpdateStep
    where
        F: ImageFetch + ?Sized,
    {
        match self.budget.record_failure() {
            RetryDecision::RetryAfter { attempt, delay } => UpdateStep::Continue {
                delay,
                report: Some(UpdateReport::Retrying {
                    attempt,
                    limit: self.budget.limit(),
                    error: err,
                }),
            },
            RetryDecision::Exhausted { failures } => self.abort(
                fetch,
                UpdateError::FetchExhausted {
                    failures,
                    last: err,
                },
            ),
        }
    }

    fn abort<F>(&mut self, fetch: &mut F, err: UpdateError) -> UpdateStep
    where
        F: ImageFetch + ?Sized,
    {
        fetch.abort();
        self.state = UpdateState::Idle;
        UpdateStep::Finished {
            outcome: UpdateOutcome::Aborted(err),
            report: UpdateReport::Failed(err),
        }
    }
}

/// Publishes an update report on the progress topic when the session is up.
pub fn publish_report<P>(
    publisher: &mut P,
    session: SessionView<'_>,
    device: &str,
    topics: &Topics,
    report: &UpdateReport,
) -> Delivery
where
    P: Publish + ?Sized,
{
    publish_status(
        publisher,
        session,
        device,
        topics.update_progress,
        format_args!("{report}"),
    )
}

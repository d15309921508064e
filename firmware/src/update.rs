//! Firmware update worker.

use embassy_time::Timer;
use node_core::boot::{BootPartitions, KeyValueStore};
use node_core::config::DeviceConfig;
use node_core::fabric::GuardToken;
use node_core::session::{Publish, RestartReason, SystemControl};
use node_core::status::Delivery;
use node_core::update::{
    ImageFetch, UpdateOutcome, UpdateProcedure, UpdateReport, UpdateStep, publish_report,
};

use crate::fabric::Fabric;
use crate::time::{core_duration_to_embassy, now_ms};

/// Runs one update procedure per accepted trigger.
pub struct UpdateWorker<'a, F, B, S, P, R> {
    fabric: &'static Fabric,
    config: &'a DeviceConfig,
    fetch: F,
    partitions: B,
    store: S,
    publisher: P,
    system: &'a R,
}

impl<'a, F, B, S, P, R> UpdateWorker<'a, F, B, S, P, R>
where
    F: ImageFetch,
    B: BootPartitions,
    S: KeyValueStore,
    P: Publish,
    R: SystemControl,
{
    pub fn new(
        fabric: &'static Fabric,
        config: &'a DeviceConfig,
        fetch: F,
        partitions: B,
        store: S,
        publisher: P,
        system: &'a R,
    ) -> Self {
        Self {
            fabric,
            config,
            fetch,
            partitions,
            store,
            publisher,
            system,
        }
    }

    pub fn partitions(&self) -> &B {
        &self.partitions
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Runs the procedure guarded by `token` to completion.
    ///
    /// The guard is released before a restart is requested.
    pub async fn perform(&mut self, token: GuardToken<'static>) -> UpdateOutcome {
        log_started(token.name());
        let mut procedure = UpdateProcedure::new(self.config.update, &self.config.timing);

        let outcome = loop {
            let step = procedure.step(
                now_ms(),
                &mut self.fetch,
                &mut self.partitions,
                &mut self.store,
                &self.fabric.update_cancel,
            );
            match step {
                UpdateStep::Continue { delay, report } => {
                    if let Some(report) = report {
                        self.report(&report);
                    }
                    Timer::after(core_duration_to_embassy(delay)).await;
                }
                UpdateStep::Finished { outcome, report } => {
                    self.report(&report);
                    break outcome;
                }
            }
        };

        self.fabric.update_cancel.clear();
        drop(token);

        log_finished(outcome);
        if outcome.requires_restart() {
            self.system.restart(RestartReason::UpdateApplied);
        }
        outcome
    }

    fn report(&mut self, report: &UpdateReport) {
        log_report(report);
        let delivery = publish_report(
            &mut self.publisher,
            self.fabric.session.view(),
            self.config.device_name,
            &self.config.topics,
            report,
        );
        if let Delivery::Failed(err) = delivery {
            log_publish_failed(err);
        }
    }

    pub async fn run(mut self) -> ! {
        loop {
            let token = self.fabric.update_requests.receive().await;
            self.perform(token).await;
        }
    }
}

#[cfg(target_os = "none")]
fn log_started(name: &str) {
    defmt::info!("{=str} procedure started", name);
}

#[cfg(not(target_os = "none"))]
fn log_started(name: &str) {
    println!("{name} procedure started");
}

#[cfg(target_os = "none")]
fn log_report(report: &UpdateReport) {
    defmt::info!("{}", defmt::Display2Format(report));
}

#[cfg(not(target_os = "none"))]
fn log_report(report: &UpdateReport) {
    println!("{report}");
}

#[cfg(target_os = "none")]
fn log_finished(outcome: UpdateOutcome) {
    match outcome {
        UpdateOutcome::Applied { target, elapsed_ms } => defmt::info!(
            "update applied to {}, {=u32} ms",
            defmt::Display2Format(&target),
            elapsed_ms
        ),
        UpdateOutcome::Aborted(err) => {
            defmt::error!("update aborted: {}", defmt::Display2Format(&err));
        }
        UpdateOutcome::Cancelled => defmt::warn!("update cancelled"),
    }
}

#[cfg(not(target_os = "none"))]
fn log_finished(outcome: UpdateOutcome) {
    match outcome {
        UpdateOutcome::Applied { target, elapsed_ms } => {
            println!("update applied to {target}, {elapsed_ms} ms");
        }
        UpdateOutcome::Aborted(err) => println!("update aborted: {err}"),
        UpdateOutcome::Cancelled => println!("update cancelled"),
    }
}

#[cfg(target_os = "none")]
fn log_publish_failed(err: node_core::session::BusError) {
    defmt::warn!("update report not published: {}", defmt::Display2Format(&err));
}

#[cfg(not(target_os = "none"))]
fn log_publish_failed(err: node_core::session::BusError) {
    println!("update report not published: {err}");
}

//! Device bring-up: boot classification, then every worker joined on one future.

use embassy_futures::join::{join, join5};
use node_core::boot::{BootKind, BootPartitions, KeyValueStore, classify_boot};
use node_core::config::{ConfigError, DeviceConfig};
use node_core::error::Classify;
use node_core::indicator::{Color, PixelDriver};
use node_core::session::{MessageBus, RadioLink, SystemControl};
use node_core::status::DoorSensors;
use node_core::update::ImageFetch;

use crate::fabric::Fabric;
use crate::indicator::{IndicatorRenderer, run_commands};
use crate::motion::MotionWorker;
use crate::session::SessionWorker;
use crate::status::StatusWorker;
use crate::update::UpdateWorker;

/// Color used when motion lights the indicator.
pub const MOTION_COLOR: Color = Color::White;

/// Platform drivers handed to [`run_device`].
pub struct Collaborators<'a, L, B, F, P, S, X, D, R> {
    pub link: L,
    pub bus: B,
    pub fetch: F,
    pub partitions: P,
    pub store: S,
    pub pixel: X,
    pub door: D,
    pub system: &'a R,
}

/// Classifies this boot and consumes any pending boot record.
///
/// A store failure is logged and treated as a normal boot.
pub fn startup_boot_kind<S, P>(store: &mut S, partitions: &P) -> BootKind
where
    S: KeyValueStore + ?Sized,
    P: BootPartitions + ?Sized,
{
    let kind = match classify_boot(store, partitions) {
        Ok(kind) => kind,
        Err(err) => {
            log_store_failure(err);
            BootKind::Normal
        }
    };
    log_boot(kind, partitions);
    kind
}

/// Runs the device until it restarts.
///
/// Returns early only when `config` is invalid.
pub async fn run_device<L, B, F, P, S, X, D, R>(
    fabric: &'static Fabric,
    config: &DeviceConfig,
    mut parts: Collaborators<'_, L, B, F, P, S, X, D, R>,
) -> ConfigError
where
    L: RadioLink,
    B: MessageBus,
    F: ImageFetch,
    P: BootPartitions,
    S: KeyValueStore,
    X: PixelDriver,
    D: DoorSensors,
    R: SystemControl,
{
    if let Err(err) = config.validate() {
        log_config_error(err);
        return err;
    }

    let boot = startup_boot_kind(&mut parts.store, &parts.partitions);
    let running = parts.partitions.running_partition();

    let mut status = StatusWorker::new(
        fabric,
        config,
        parts.door,
        parts.bus.publisher(),
        Some(running),
    );
    status.note_boot(boot);
    let update = UpdateWorker::new(
        fabric,
        config,
        parts.fetch,
        parts.partitions,
        parts.store,
        parts.bus.publisher(),
        parts.system,
    );
    let session = SessionWorker::new(fabric, config, parts.link, parts.bus, parts.system);
    let motion = MotionWorker::new(MOTION_COLOR, &config.timing);
    let renderer = IndicatorRenderer::new(parts.pixel);

    log_started(config.device_name);
    join(
        join5(
            session.run(),
            motion.run(fabric),
            run_commands(fabric),
            renderer.run(fabric),
            update.run(),
        ),
        status.run(),
    )
    .await;
    loop {
        core::future::pending::<()>().await;
    }
}

#[cfg(target_os = "none")]
fn log_config_error(err: ConfigError) {
    defmt::error!(
        "invalid configuration: {} [{=str}]",
        defmt::Display2Format(&err),
        err.classify().as_str()
    );
}

#[cfg(not(target_os = "none"))]
fn log_config_error(err: ConfigError) {
    println!("invalid configuration: {err} [{}]", err.classify());
}

#[cfg(target_os = "none")]
fn log_store_failure(err: node_core::boot::StoreError) {
    defmt::warn!("boot record unreadable: {}", defmt::Display2Format(&err));
}

#[cfg(not(target_os = "none"))]
fn log_store_failure(err: node_core::boot::StoreError) {
    println!("boot record unreadable: {err}");
}

#[cfg(target_os = "none")]
fn log_boot<P: BootPartitions + ?Sized>(kind: BootKind, partitions: &P) {
    defmt::info!(
        "boot from {} ({=str}): {}",
        defmt::Display2Format(&partitions.running_partition()),
        partitions.reset_reason().as_str(),
        defmt::Debug2Format(&kind)
    );
}

#[cfg(not(target_os = "none"))]
fn log_boot<P: BootPartitions + ?Sized>(kind: BootKind, partitions: &P) {
    println!(
        "boot from {} ({}): {kind:?}",
        partitions.running_partition(),
        partitions.reset_reason().as_str()
    );
}

#[cfg(target_os = "none")]
fn log_started(device: &str) {
    defmt::info!("{=str} workers starting", device);
}

#[cfg(not(target_os = "none"))]
fn log_started(device: &str) {
    println!("{device} workers starting");
}

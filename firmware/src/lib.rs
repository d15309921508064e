#![cfg_attr(target_os = "none", no_std)]

//! Embassy runtime for the motion-light node.
//!
//! Board crates supply the platform drivers and call [`device::run_device`]
//! with a `static` [`fabric::Fabric`]; the motion interrupt calls
//! [`motion::on_motion_edge`] and bus callbacks post into the fabric.

pub mod device;
pub mod fabric;
pub mod indicator;
pub mod motion;
pub mod session;
pub mod status;
pub mod time;
pub mod update;

#[cfg(target_os = "none")]
pub mod platform;

pub use device::{Collaborators, run_device};
pub use fabric::Fabric;

//! Fault taxonomy shared by every component.
//!
//! Component errors stay small and local. [`FaultClass`] says how each one is
//! handled: only protocol and authentication failures at the session layer
//! restart the device; everything else is contained where it happened.

use core::fmt;

use crate::boot::{BootError, StoreError};
use crate::command::CommandError;
use crate::config::ConfigError;
use crate::fabric::EnqueueError;
use crate::indicator::PixelError;
use crate::session::{BusError, BusFault, LinkError};
use crate::status::StatusOverflow;
use crate::update::{FetchError, UpdateError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultClass {
    /// Retried with backoff up to a cap.
    TransientIo,
    /// Item dropped and counted.
    ResourceExhausted,
    /// Logged with detail, then the device restarts.
    ProtocolAuth,
    /// Procedure aborted; current firmware preserved.
    DataIntegrity,
    /// Rejected at the guard and logged.
    InvariantViolation,
}

impl FaultClass {
    pub const fn escalates_to_restart(self) -> bool {
        matches!(self, FaultClass::ProtocolAuth)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            FaultClass::TransientIo => "transient-io",
            FaultClass::ResourceExhausted => "resource-exhausted",
            FaultClass::ProtocolAuth => "protocol-auth",
            FaultClass::DataIntegrity => "data-integrity",
            FaultClass::InvariantViolation => "invariant-violation",
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know their [`FaultClass`].
pub trait Classify {
    fn classify(&self) -> FaultClass;
}

impl<T> Classify for EnqueueError<T> {
    fn classify(&self) -> FaultClass {
        FaultClass::ResourceExhausted
    }
}

impl Classify for StatusOverflow {
    fn classify(&self) -> FaultClass {
        FaultClass::ResourceExhausted
    }
}

impl Classify for PixelError {
    fn classify(&self) -> FaultClass {
        FaultClass::TransientIo
    }
}

impl Classify for LinkError {
    fn classify(&self) -> FaultClass {
        FaultClass::TransientIo
    }
}

impl Classify for BusError {
    fn classify(&self) -> FaultClass {
        match self {
            BusError::PayloadTooLarge => FaultClass::ResourceExhausted,
            BusError::NotConnected
            | BusError::StartFailed
            | BusError::Transport
            | BusError::Timeout => FaultClass::TransientIo,
        }
    }
}

impl Classify for BusFault {
    fn classify(&self) -> FaultClass {
        FaultClass::ProtocolAuth
    }
}

impl Classify for FetchError {
    fn classify(&self) -> FaultClass {
        match self {
            FetchError::InvalidImage => FaultClass::DataIntegrity,
            FetchError::Connect
            | FetchError::Tls
            | FetchError::Http(_)
            | FetchError::Io
            | FetchError::Timeout => FaultClass::TransientIo,
        }
    }
}

impl Classify for UpdateError {
    fn classify(&self) -> FaultClass {
        match self {
            UpdateError::FetchExhausted { .. } | UpdateError::Record(_) => FaultClass::TransientIo,
            UpdateError::NoUpdatePartition
            | UpdateError::Incomplete
            | UpdateError::Finalize(_)
            | UpdateError::Switch(_) => FaultClass::DataIntegrity,
        }
    }
}

impl Classify for BootError {
    fn classify(&self) -> FaultClass {
        FaultClass::DataIntegrity
    }
}

impl Classify for StoreError {
    fn classify(&self) -> FaultClass {
        FaultClass::TransientIo
    }
}

impl Classify for CommandError {
    fn classify(&self) -> FaultClass {
        match self {
            CommandError::TopicTooLong | CommandError::PayloadTooLong => {
                FaultClass::ResourceExhausted
            }
            CommandError::UnknownTopic
            | CommandError::NotUtf8
            | CommandError::UnknownIndicator => FaultClass::InvariantViolation,
        }
    }
}

impl Classify for ConfigError {
    fn classify(&self) -> FaultClass {
        FaultClass::InvariantViolation
    }
}

/// Returned when a singleton procedure is already running.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AlreadyRunning {
    pub procedure: &'static str,
}

impl fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} already running", self.procedure)
    }
}

impl Classify for AlreadyRunning {
    fn classify(&self) -> FaultClass {
        FaultClass::InvariantViolation
    }
}

impl<E: Classify> From<&E> for FaultClass {
    fn from(err: &E) -> Self {
        err.classify()
    }
}

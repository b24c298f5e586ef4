//! Crate-level error taxonomy.
//!
//! Validation rejections and transient open failures are absorbed inside
//! discovery and only logged; consumers see them here only when they ask for
//! a device directly. Cancellation and timeout of transport I/O are reported
//! through [`crate::transport::IoOutcome`], not through this type.

use crate::config::ConfigError;
use crate::device::PhysicalDeviceId;
use crate::discovery::DiscoveryError;
use crate::port::PortError;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for discovery, validation and transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted with no open or validated device.
    #[error("Device {0} is not connected")]
    NotConnected(PhysicalDeviceId),

    /// The platform layer could not open the device.
    #[error("Failed to open {port}: {source}")]
    OpenFailed {
        port: String,
        #[source]
        source: PortError,
    },

    /// The device opened but did not identify as a supported device.
    #[error("Device {0} was rejected by validation")]
    ValidationRejected(PhysicalDeviceId),

    /// Aborted by the caller's cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Aborted because the internal deadline elapsed.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A discovery source failed in a way that terminated it.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn open_failed(port: impl Into<String>, source: PortError) -> Self {
        Self::OpenFailed {
            port: port.into(),
            source,
        }
    }

    /// True for the two expected outcomes of a bounded operation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Device data model shared by discovery, validation and transport.
//!
//! Two views of a device are kept side by side:
//!
//! - [`CandidateDevice`] mirrors what the platform currently reports as
//!   physically present and is updated synchronously with notifications.
//! - [`LogicalDevice`] is what protocol consumers see. It survives short
//!   removal windows so enumeration churn does not reach the protocol layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform-assigned identity of one connected device instance.
///
/// Unique per physical connection; a replug may yield a new id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalDeviceId(String);

impl PhysicalDeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhysicalDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PhysicalDeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PhysicalDeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Filter naming the class of devices one discovery source watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSelector(String);

impl DeviceSelector {
    pub fn new(selector: impl Into<String>) -> Self {
        Self(selector.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceSelector {
    fn from(selector: &str) -> Self {
        Self::new(selector)
    }
}

/// Raw platform metadata reported alongside an add notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// System path of the serial channel (e.g. "/dev/ttyACM0", "COM7").
    pub port_name: String,
    /// Human-readable product string, if the platform exposes one.
    pub display_name: Option<String>,
    /// Serial-number-like token, if the platform exposes one.
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl DeviceMetadata {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }
}

/// A physically present device, not yet known to speak the target protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDevice {
    pub id: PhysicalDeviceId,
    pub selector: DeviceSelector,
    pub metadata: DeviceMetadata,
}

impl CandidateDevice {
    pub fn new(id: PhysicalDeviceId, selector: DeviceSelector, metadata: DeviceMetadata) -> Self {
        Self {
            id,
            selector,
            metadata,
        }
    }

    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint {
            id: self.id.clone(),
            port_name: self.metadata.port_name.clone(),
        }
    }
}

/// Outcome of probing a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationState {
    Pending,
    Validated,
    Rejected,
}

/// A device as exposed to protocol-level consumers.
///
/// Returned by value; the registry owns the authoritative copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalDevice {
    pub id: PhysicalDeviceId,
    pub selector: DeviceSelector,
    pub metadata: DeviceMetadata,
    /// Derived display string, `<name-or-tag> @ <port>`, set once validated.
    pub description: Option<String>,
    pub state: ValidationState,
    /// True while a dispose countdown is armed for this device.
    pub departing: bool,
}

impl LogicalDevice {
    pub(crate) fn pending(candidate: &CandidateDevice) -> Self {
        Self {
            id: candidate.id.clone(),
            selector: candidate.selector.clone(),
            metadata: candidate.metadata.clone(),
            description: None,
            state: ValidationState::Pending,
            departing: false,
        }
    }

    pub fn is_validated(&self) -> bool {
        self.state == ValidationState::Validated
    }

    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint {
            id: self.id.clone(),
            port_name: self.metadata.port_name.clone(),
        }
    }
}

/// The minimum a transport needs to open a device: who it is and where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceEndpoint {
    pub id: PhysicalDeviceId,
    pub port_name: String,
}

impl DeviceEndpoint {
    pub fn new(id: impl Into<PhysicalDeviceId>, port_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            port_name: port_name.into(),
        }
    }
}

/// Notifications delivered to protocol consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A device passed validation and is now listed.
    DeviceArrived(LogicalDevice),
    /// A device's grace window expired and it was disposed.
    DeviceDeparted(PhysicalDeviceId),
    /// Every source finished its scan and the validation sweep ran.
    /// Fired once per sweep.
    EnumerationCompleted { sweep: u64, devices: usize },
}

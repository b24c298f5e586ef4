//! Discovery sources.
//!
//! A discovery source watches one class of devices (its [`DeviceSelector`])
//! and pushes add/remove/enumeration-complete notifications into the
//! controller's mutation queue through an [`EventSink`]. Sources never touch
//! registry state themselves; the controller applies every notification in
//! delivery order from a single task.
//!
//! Two sources are provided:
//!
//! - [`PollingSource`] snapshots the platform's serial port list at a fixed
//!   interval and reports the difference.
//! - [`ManualSource`] emits whatever its [`ManualHandle`] is told to, for
//!   tests and for embedders with their own hotplug mechanism.

pub mod manual;
pub mod polling;

pub use manual::{ManualHandle, ManualSource, ManualSourceFactory};
pub use polling::{PollingSource, PollingSourceFactory, PortFilter};

use crate::device::{CandidateDevice, DeviceMetadata, DeviceSelector, PhysicalDeviceId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Failures of the discovery subsystem itself.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Unsupported device selector '{0}'")]
    InvalidSelector(String),

    #[error("Source for '{selector}' failed to start: {reason}")]
    StartFailed {
        selector: DeviceSelector,
        reason: String,
    },

    #[error("Discovery is not running")]
    NotRunning,

    #[error("Platform enumeration failed: {0}")]
    Enumeration(#[from] serialport::Error),
}

impl DiscoveryError {
    pub fn start_failed(selector: &DeviceSelector, reason: impl Into<String>) -> Self {
        Self::StartFailed {
            selector: selector.clone(),
            reason: reason.into(),
        }
    }
}

/// Lifecycle of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    NotStarted,
    Started,
    EnumerationCompleted,
    Stopped,
    /// Terminated by a failure; will not report anything else.
    Aborted,
}

impl SourceStatus {
    /// Started or already past its initial scan.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Started | Self::EnumerationCompleted)
    }
}

/// A notification raised by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Added(CandidateDevice),
    Removed(PhysicalDeviceId),
    /// The initial scan of this run finished.
    EnumerationCompleted,
    /// The source terminated; it will never complete its scan.
    Aborted { reason: String },
}

/// A source event with its origin attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub selector: DeviceSelector,
    /// Controller run the emitting source was started for.
    pub epoch: u64,
    pub event: SourceEvent,
}

/// Sending half of the controller's mutation queue, bound to one source run.
///
/// A fresh sink is handed to a source on every start. Messages carry the
/// epoch of that start, so anything a stopped source still emits is
/// recognizably stale.
#[derive(Debug, Clone)]
pub struct EventSink {
    selector: DeviceSelector,
    epoch: u64,
    tx: mpsc::UnboundedSender<SourceMessage>,
}

impl EventSink {
    pub fn new(
        selector: DeviceSelector,
        epoch: u64,
        tx: mpsc::UnboundedSender<SourceMessage>,
    ) -> Self {
        Self { selector, epoch, tx }
    }

    pub fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Report a device. Returns false once the controller is gone.
    pub fn added(&self, id: PhysicalDeviceId, metadata: DeviceMetadata) -> bool {
        let candidate = CandidateDevice::new(id, self.selector.clone(), metadata);
        self.emit(SourceEvent::Added(candidate))
    }

    pub fn removed(&self, id: PhysicalDeviceId) -> bool {
        self.emit(SourceEvent::Removed(id))
    }

    pub fn enumeration_completed(&self) -> bool {
        self.emit(SourceEvent::EnumerationCompleted)
    }

    pub fn aborted(&self, reason: impl Into<String>) -> bool {
        self.emit(SourceEvent::Aborted {
            reason: reason.into(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn emit(&self, event: SourceEvent) -> bool {
        self.tx
            .send(SourceMessage {
                selector: self.selector.clone(),
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// A platform stream of device notifications for one selector.
///
/// `start` may be called again after `stop`; each start receives a new sink
/// and must begin with a full scan that ends in `enumeration_completed`.
pub trait DiscoverySource: Send {
    fn selector(&self) -> &DeviceSelector;

    fn start(&mut self, sink: EventSink) -> Result<(), DiscoveryError>;

    fn stop(&mut self);

    fn status(&self) -> SourceStatus;
}

/// Creates one source per configured selector.
pub trait SourceFactory: Send + Sync {
    fn create(&self, selector: &DeviceSelector) -> Result<Box<dyn DiscoverySource>, DiscoveryError>;
}

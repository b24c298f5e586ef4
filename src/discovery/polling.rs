//! Polling discovery source backed by `serialport::available_ports`.
//!
//! The platform port list is snapshotted on the blocking pool at a fixed
//! interval. Each snapshot is filtered by the source's selector and diffed
//! against the previous one; vanished ports are reported as removals before
//! new ports are reported as additions. The first snapshot of every start is
//! followed by an enumeration-complete notification.

use super::{DiscoveryError, DiscoverySource, EventSink, SourceFactory, SourceStatus};
use crate::device::{DeviceMetadata, DeviceSelector, PhysicalDeviceId};
use parking_lot::Mutex;
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Platform enumeration function.
pub type Enumerator = Arc<dyn Fn() -> serialport::Result<Vec<SerialPortInfo>> + Send + Sync>;

/// Which ports a polling source reports, parsed from its selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortFilter {
    All,
    Usb,
    Pci,
    Bluetooth,
    /// Ports whose system name starts with the prefix.
    NamePrefix(String),
}

impl PortFilter {
    pub fn parse(selector: &DeviceSelector) -> Result<Self, DiscoveryError> {
        let raw = selector.as_str().trim();
        if let Some(prefix) = raw.strip_prefix("name:") {
            if prefix.is_empty() {
                return Err(DiscoveryError::InvalidSelector(raw.to_string()));
            }
            return Ok(Self::NamePrefix(prefix.to_string()));
        }

        match raw.to_ascii_lowercase().as_str() {
            "all" | "*" => Ok(Self::All),
            "usb" => Ok(Self::Usb),
            "pci" => Ok(Self::Pci),
            "bluetooth" => Ok(Self::Bluetooth),
            _ => Err(DiscoveryError::InvalidSelector(raw.to_string())),
        }
    }

    pub fn matches(&self, info: &SerialPortInfo) -> bool {
        match self {
            Self::All => true,
            Self::Usb => matches!(info.port_type, SerialPortType::UsbPort(_)),
            Self::Pci => matches!(info.port_type, SerialPortType::PciPort),
            Self::Bluetooth => matches!(info.port_type, SerialPortType::BluetoothPort),
            Self::NamePrefix(prefix) => info.port_name.starts_with(prefix.as_str()),
        }
    }
}

/// Identity of the device behind a port.
///
/// USB ports include VID, PID and serial number so a different device
/// re-enumerated on the same port name gets a different id.
pub fn device_id(info: &SerialPortInfo) -> PhysicalDeviceId {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => PhysicalDeviceId::new(format!(
            "{}#{:04x}:{:04x}:{}",
            info.port_name,
            usb.vid,
            usb.pid,
            usb.serial_number.as_deref().unwrap_or_default()
        )),
        _ => PhysicalDeviceId::new(info.port_name.as_str()),
    }
}

pub fn device_metadata(info: &SerialPortInfo) -> DeviceMetadata {
    let mut metadata = DeviceMetadata::new(info.port_name.as_str());
    if let SerialPortType::UsbPort(usb) = &info.port_type {
        metadata.display_name = usb.product.clone();
        metadata.serial_number = usb.serial_number.clone();
        metadata.manufacturer = usb.manufacturer.clone();
        metadata.vid = Some(usb.vid);
        metadata.pid = Some(usb.pid);
    }
    metadata
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Changes {
    removed: Vec<PhysicalDeviceId>,
    added: Vec<(PhysicalDeviceId, DeviceMetadata)>,
}

/// Diff a snapshot against the known set and make it the new known set.
fn reconcile(
    known: &mut BTreeSet<PhysicalDeviceId>,
    snapshot: Vec<(PhysicalDeviceId, DeviceMetadata)>,
) -> Changes {
    let current: BTreeSet<PhysicalDeviceId> = snapshot.iter().map(|(id, _)| id.clone()).collect();

    let removed = known.difference(&current).cloned().collect();
    let added = snapshot
        .into_iter()
        .filter(|(id, _)| !known.contains(id))
        .collect();

    *known = current;
    Changes { removed, added }
}

/// Discovery source that polls the platform port list.
pub struct PollingSource {
    selector: DeviceSelector,
    filter: PortFilter,
    interval: Duration,
    enumerator: Enumerator,
    status: Arc<Mutex<SourceStatus>>,
    cancel: Option<CancellationToken>,
}

impl PollingSource {
    pub fn new(selector: DeviceSelector, interval: Duration) -> Result<Self, DiscoveryError> {
        Self::with_enumerator(selector, interval, Arc::new(serialport::available_ports))
    }

    pub fn with_enumerator(
        selector: DeviceSelector,
        interval: Duration,
        enumerator: Enumerator,
    ) -> Result<Self, DiscoveryError> {
        let filter = PortFilter::parse(&selector)?;
        Ok(Self {
            selector,
            filter,
            interval,
            enumerator,
            status: Arc::new(Mutex::new(SourceStatus::NotStarted)),
            cancel: None,
        })
    }

    pub fn filter(&self) -> &PortFilter {
        &self.filter
    }
}

impl DiscoverySource for PollingSource {
    fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    fn start(&mut self, sink: EventSink) -> Result<(), DiscoveryError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DiscoveryError::start_failed(&self.selector, e.to_string()))?;

        if let Some(previous) = self.cancel.take() {
            previous.cancel();
        }

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        *self.status.lock() = SourceStatus::Started;

        debug!(selector = %self.selector, interval = ?self.interval, "Polling source started");
        runtime.spawn(poll_ports(
            self.filter.clone(),
            self.interval,
            self.enumerator.clone(),
            sink,
            self.status.clone(),
            cancel,
        ));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            debug!(selector = %self.selector, "Polling source stopped");
        }
        let mut status = self.status.lock();
        if *status != SourceStatus::Aborted {
            *status = SourceStatus::Stopped;
        }
    }

    fn status(&self) -> SourceStatus {
        *self.status.lock()
    }
}

impl Drop for PollingSource {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

async fn snapshot(enumerator: &Enumerator) -> Result<Vec<SerialPortInfo>, DiscoveryError> {
    let enumerate = enumerator.clone();
    tokio::task::spawn_blocking(move || enumerate())
        .await
        .map_err(|e| {
            DiscoveryError::Enumeration(serialport::Error::new(
                serialport::ErrorKind::Unknown,
                e.to_string(),
            ))
        })?
        .map_err(DiscoveryError::from)
}

async fn poll_ports(
    filter: PortFilter,
    interval: Duration,
    enumerator: Enumerator,
    sink: EventSink,
    status: Arc<Mutex<SourceStatus>>,
    cancel: CancellationToken,
) {
    let mut known = BTreeSet::new();
    let mut enumerated = false;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let ports = match snapshot(&enumerator).await {
            Ok(ports) => ports,
            Err(e) if !enumerated => {
                error!(selector = %sink.selector(), error = %e, "Initial port enumeration failed");
                *status.lock() = SourceStatus::Aborted;
                sink.aborted(e.to_string());
                return;
            }
            Err(e) => {
                warn!(selector = %sink.selector(), error = %e, "Port enumeration failed, keeping previous snapshot");
                continue;
            }
        };
        if cancel.is_cancelled() {
            break;
        }

        let filtered = ports
            .iter()
            .filter(|info| filter.matches(info))
            .map(|info| (device_id(info), device_metadata(info)))
            .collect();
        let changes = reconcile(&mut known, filtered);

        for id in changes.removed {
            trace!(selector = %sink.selector(), device = %id, "Port vanished");
            sink.removed(id);
        }
        for (id, metadata) in changes.added {
            trace!(selector = %sink.selector(), device = %id, port = %metadata.port_name, "Port appeared");
            sink.added(id, metadata);
        }

        if !enumerated {
            enumerated = true;
            {
                let mut status = status.lock();
                if *status == SourceStatus::Started {
                    *status = SourceStatus::EnumerationCompleted;
                }
            }
            debug!(selector = %sink.selector(), ports = known.len(), "Initial enumeration complete");
            sink.enumeration_completed();
        }

        if sink.is_closed() {
            break;
        }
    }

    trace!(selector = %sink.selector(), "Polling loop exiting");
}

/// Creates a [`PollingSource`] per selector.
#[derive(Clone)]
pub struct PollingSourceFactory {
    interval: Duration,
    enumerator: Enumerator,
}

impl PollingSourceFactory {
    pub fn new(interval: Duration) -> Self {
        Self::with_enumerator(interval, Arc::new(serialport::available_ports))
    }

    pub fn with_enumerator(interval: Duration, enumerator: Enumerator) -> Self {
        Self {
            interval,
            enumerator,
        }
    }
}

impl SourceFactory for PollingSourceFactory {
    fn create(&self, selector: &DeviceSelector) -> Result<Box<dyn DiscoverySource>, DiscoveryError> {
        Ok(Box::new(PollingSource::with_enumerator(
            selector.clone(),
            self.interval,
            self.enumerator.clone(),
        )?))
    }
}

impl std::fmt::Debug for PollingSourceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingSourceFactory")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

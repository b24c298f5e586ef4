//! Device registry with debounced removal.
//!
//! The registry keeps two collections behind one lock:
//!
//! - candidates: what the platform reports as present right now, updated
//!   synchronously with add/remove notifications;
//! - logical devices: what consumers see, kept alive for a grace window after
//!   removal so a device that drops and re-enumerates does not flap.
//!
//! A candidate seen through several overlapping selectors stays present until
//! every one of them has reported it removed.
//!
//! Removal arms a per-device dispose countdown. A matching add before expiry
//! cancels it and the logical device is reused unchanged. Cancellation and
//! expiry are decided under the registry lock, so exactly one of them wins.

use crate::device::{
    CandidateDevice, DeviceSelector, DiscoveryEvent, LogicalDevice, PhysicalDeviceId,
    ValidationState,
};
use crate::validator::{DeviceValidator, Validated, ValidationError};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// What `on_device_added` did with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// A candidate with this id is already registered.
    Duplicate,
    /// The device came back within its grace window; nothing changed.
    Reappeared,
    /// Registered and waiting for the enumeration sweep.
    Pending,
    /// Validated immediately (discovery already past its sweep).
    Validated(LogicalDevice),
    /// Probed immediately and rejected; the entry was dropped.
    Rejected,
    /// The entry was disposed while its probe was running.
    Vanished,
}

/// What `on_device_removed` did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Nothing was known about this id.
    Unknown,
    /// Only a candidate existed; it was dropped.
    CandidateDropped,
    /// A dispose countdown was armed for the logical device.
    CountdownArmed,
    /// A countdown was already running.
    AlreadyDeparting,
    /// Another source still reports the device; nothing was removed.
    StillReported,
}

struct DisposeCountdown {
    serial: u64,
    cancel: CancellationToken,
}

struct LogicalEntry {
    device: LogicalDevice,
    countdown: Option<DisposeCountdown>,
}

impl LogicalEntry {
    fn cancel_countdown(&mut self) -> bool {
        match self.countdown.take() {
            Some(countdown) => {
                countdown.cancel.cancel();
                self.device.departing = false;
                true
            }
            None => false,
        }
    }
}

struct CandidateEntry {
    candidate: CandidateDevice,
    /// Selectors currently reporting this device.
    reporters: Vec<DeviceSelector>,
}

#[derive(Default)]
struct RegistryState {
    candidates: Vec<CandidateEntry>,
    /// Insertion order is the listing order.
    logical: Vec<LogicalEntry>,
    next_countdown: u64,
}

impl RegistryState {
    fn logical_position(&self, id: &PhysicalDeviceId) -> Option<usize> {
        self.logical.iter().position(|e| &e.device.id == id)
    }

    fn logical_mut(&mut self, id: &PhysicalDeviceId) -> Option<&mut LogicalEntry> {
        self.logical.iter_mut().find(|e| &e.device.id == id)
    }

    fn candidate_mut(&mut self, id: &PhysicalDeviceId) -> Option<&mut CandidateEntry> {
        self.candidates.iter_mut().find(|c| &c.candidate.id == id)
    }

    fn remove_candidate(&mut self, id: &PhysicalDeviceId) -> bool {
        let before = self.candidates.len();
        self.candidates.retain(|c| &c.candidate.id != id);
        before != self.candidates.len()
    }
}

/// Owner of candidate and logical device state.
pub struct DeviceRegistry {
    state: Arc<Mutex<RegistryState>>,
    validator: Arc<DeviceValidator>,
    grace: Duration,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl DeviceRegistry {
    pub fn new(
        validator: Arc<DeviceValidator>,
        grace: Duration,
        events: broadcast::Sender<DiscoveryEvent>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            validator,
            grace,
            events,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Apply an add notification.
    ///
    /// When `enumerated` is set a new device is probed right away instead of
    /// waiting for a sweep. The probe runs without the registry lock held.
    pub async fn on_device_added(&self, candidate: CandidateDevice, enumerated: bool) -> AddOutcome {
        let outcome = self.register(&candidate);
        if outcome != AddOutcome::Pending || !enumerated {
            return outcome;
        }
        self.probe(&candidate).await
    }

    /// Synchronous half of an add: record the candidate and create or revive
    /// its logical device. Returns `Pending` for a newly created device.
    pub fn register(&self, candidate: &CandidateDevice) -> AddOutcome {
        let mut state = self.state.lock();

        if let Some(entry) = state.candidate_mut(&candidate.id) {
            if !entry.reporters.contains(&candidate.selector) {
                entry.reporters.push(candidate.selector.clone());
            }
            trace!(
                device = %candidate.id,
                selector = %candidate.selector,
                "Ignoring duplicate add"
            );
            return AddOutcome::Duplicate;
        }
        state.candidates.push(CandidateEntry {
            candidate: candidate.clone(),
            reporters: vec![candidate.selector.clone()],
        });

        if let Some(entry) = state.logical_mut(&candidate.id) {
            if entry.cancel_countdown() {
                info!(device = %candidate.id, "Device reappeared within grace window");
            }
            return AddOutcome::Reappeared;
        }

        state.logical.push(LogicalEntry {
            device: LogicalDevice::pending(candidate),
            countdown: None,
        });
        debug!(
            device = %candidate.id,
            port = %candidate.metadata.port_name,
            selector = %candidate.selector,
            "Candidate registered"
        );
        AddOutcome::Pending
    }

    /// Validate one newly registered device outside of a sweep.
    pub async fn probe(&self, candidate: &CandidateDevice) -> AddOutcome {
        let outcome = self
            .validator
            .validate(&candidate.id, &candidate.metadata)
            .await;
        if let Err(ref e) = outcome {
            if !e.is_unrecognized() {
                warn!(device = %candidate.id, error = %e, "Validation probe failed");
            }
        }

        match self.apply_validation(&candidate.id, outcome) {
            Some(device) if device.is_validated() => AddOutcome::Validated(device),
            Some(_) => AddOutcome::Rejected,
            None => AddOutcome::Vanished,
        }
    }

    /// Record a probe result for a pending device.
    ///
    /// Accepted devices get their description and become listed. Rejected
    /// devices are dropped from both collections; the returned snapshot
    /// carries `ValidationState::Rejected`. Returns `None` when the device is
    /// no longer pending.
    pub fn apply_validation(
        &self,
        id: &PhysicalDeviceId,
        outcome: Result<Validated, ValidationError>,
    ) -> Option<LogicalDevice> {
        let mut state = self.state.lock();
        let position = state.logical_position(id)?;
        if state.logical[position].device.state != ValidationState::Pending {
            return None;
        }

        match outcome {
            Ok(validated) => {
                let entry = &mut state.logical[position];
                entry.device.description = Some(validated.description);
                entry.device.state = ValidationState::Validated;
                let device = entry.device.clone();
                info!(
                    device = %device.id,
                    description = device.description.as_deref().unwrap_or_default(),
                    "Device available"
                );
                let _ = self.events.send(DiscoveryEvent::DeviceArrived(device.clone()));
                Some(device)
            }
            Err(e) => {
                let mut entry = state.logical.remove(position);
                entry.cancel_countdown();
                state.remove_candidate(id);
                entry.device.state = ValidationState::Rejected;
                debug!(device = %id, reason = %e, "Device rejected");
                Some(entry.device)
            }
        }
    }

    /// Apply a remove notification from the source watching `selector`.
    ///
    /// The device is only treated as gone once no other source reports it.
    pub fn on_device_removed(
        &self,
        selector: &DeviceSelector,
        id: &PhysicalDeviceId,
    ) -> RemoveOutcome {
        let mut state = self.state.lock();
        if let Some(entry) = state.candidate_mut(id) {
            entry.reporters.retain(|s| s != selector);
            if !entry.reporters.is_empty() {
                trace!(device = %id, %selector, "Device still reported elsewhere");
                return RemoveOutcome::StillReported;
            }
        }
        let had_candidate = state.remove_candidate(id);

        let Some(position) = state.logical_position(id) else {
            return if had_candidate {
                RemoveOutcome::CandidateDropped
            } else {
                trace!(device = %id, "Ignoring removal of unknown device");
                RemoveOutcome::Unknown
            };
        };
        if state.logical[position].countdown.is_some() {
            return RemoveOutcome::AlreadyDeparting;
        }

        self.arm_countdown(&mut state, position);
        RemoveOutcome::CountdownArmed
    }

    /// Arm a countdown for every logical device that has no candidate and
    /// is not already departing. Returns how many were armed.
    ///
    /// After a restart or resume the candidate set starts empty; a device
    /// its sources did not report again is treated as removed.
    pub fn expire_unreported(&self) -> usize {
        let mut state = self.state.lock();
        let orphans: Vec<usize> = state
            .logical
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.countdown.is_none()
                    && !state.candidates.iter().any(|c| c.candidate.id == e.device.id)
            })
            .map(|(position, _)| position)
            .collect();

        for &position in &orphans {
            self.arm_countdown(&mut state, position);
        }
        if !orphans.is_empty() {
            debug!(armed = orphans.len(), "Unreported devices departing");
        }
        orphans.len()
    }

    fn arm_countdown(&self, state: &mut RegistryState, position: usize) {
        let serial = state.next_countdown;
        state.next_countdown += 1;

        let cancel = CancellationToken::new();
        let entry = &mut state.logical[position];
        entry.countdown = Some(DisposeCountdown {
            serial,
            cancel: cancel.clone(),
        });
        entry.device.departing = true;
        let id = entry.device.id.clone();

        debug!(device = %id, grace = ?self.grace, "Dispose countdown armed");
        spawn_countdown(
            Arc::downgrade(&self.state),
            self.events.clone(),
            id,
            serial,
            cancel,
            self.grace,
        );
    }

    /// Candidate lookup.
    pub fn find(&self, id: &PhysicalDeviceId) -> Option<CandidateDevice> {
        self.state
            .lock()
            .candidates
            .iter()
            .find(|c| &c.candidate.id == id)
            .map(|c| c.candidate.clone())
    }

    /// Logical device lookup, whatever its validation state.
    pub fn find_logical(&self, id: &PhysicalDeviceId) -> Option<LogicalDevice> {
        self.state
            .lock()
            .logical
            .iter()
            .find(|e| &e.device.id == id)
            .map(|e| e.device.clone())
    }

    /// Drop every candidate. Logical devices keep aging out on their own.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.candidates.len();
        state.candidates.clear();
        debug!(dropped, "Candidates cleared");
    }

    /// Validated devices in insertion order.
    pub fn list_devices(&self) -> Vec<LogicalDevice> {
        self.state
            .lock()
            .logical
            .iter()
            .filter(|e| e.device.is_validated())
            .map(|e| e.device.clone())
            .collect()
    }

    /// Devices still waiting for a probe, in insertion order.
    pub fn pending(&self) -> Vec<LogicalDevice> {
        self.state
            .lock()
            .logical
            .iter()
            .filter(|e| e.device.state == ValidationState::Pending)
            .map(|e| e.device.clone())
            .collect()
    }

    pub fn candidate_count(&self) -> usize {
        self.state.lock().candidates.len()
    }

    pub fn logical_count(&self) -> usize {
        self.state.lock().logical.len()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DeviceRegistry")
            .field("candidates", &state.candidates.len())
            .field("logical", &state.logical.len())
            .field("grace", &self.grace)
            .finish()
    }
}

fn spawn_countdown(
    state: Weak<Mutex<RegistryState>>,
    events: broadcast::Sender<DiscoveryEvent>,
    id: PhysicalDeviceId,
    serial: u64,
    cancel: CancellationToken,
    grace: Duration,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!(device = %id, "Dispose countdown cancelled");
            }
            _ = tokio::time::sleep(grace) => {
                let Some(state) = state.upgrade() else {
                    return;
                };
                if dispose(&state, &id, serial) {
                    info!(device = %id, "Device disposed after grace window");
                    let _ = events.send(DiscoveryEvent::DeviceDeparted(id));
                }
            }
        }
    });
}

/// Remove the logical device if countdown `serial` is still the live one.
fn dispose(state: &Mutex<RegistryState>, id: &PhysicalDeviceId, serial: u64) -> bool {
    let mut state = state.lock();
    let live = state.logical.iter().position(|e| {
        &e.device.id == id
            && e
                .countdown
                .as_ref()
                .is_some_and(|c| c.serial == serial && !c.cancel.is_cancelled())
    });

    match live {
        Some(position) => {
            state.logical.remove(position);
            true
        }
        None => false,
    }
}

//! Discovery orchestration.
//!
//! [`DiscoveryController`] owns one discovery source per configured selector,
//! the device registry, the validator and the shared transport. Every source
//! notification goes through one unbounded queue drained by a single pump
//! task, so registry mutations are applied one at a time in delivery order.
//!
//! Lifecycle:
//!
//! ```text
//! Stopped -> Starting -> Watching -> EnumerationComplete
//!                           ^  \          |
//!                           |   v         v
//!                           +-- Suspended <+
//! ```
//!
//! Once every running source has reported its initial scan, the pending
//! devices are validated one at a time and a single
//! [`DiscoveryEvent::EnumerationCompleted`] is broadcast for that sweep.
//! Devices added after the sweep are validated individually as they arrive.

use crate::config::Config;
use crate::device::{DeviceSelector, DiscoveryEvent, LogicalDevice, PhysicalDeviceId};
use crate::discovery::{
    DiscoveryError, DiscoverySource, EventSink, SourceEvent, SourceFactory, SourceMessage,
};
use crate::error::{Error, Result};
use crate::port::PortOpener;
use crate::registry::{AddOutcome, DeviceRegistry};
use crate::transport::SerialTransport;
use crate::validator::{DeviceValidator, RuleTable};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the consumer notification channel.
const EVENT_BROADCAST_CAPACITY: usize = 64;

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Stopped,
    Starting,
    /// Sources running, current sweep not finished yet.
    Watching,
    /// Sources running and the current sweep has been validated.
    EnumerationComplete,
    Suspended,
}

/// Progress of the current discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationState {
    pub watchers_started: bool,
    pub watchers_suspended: bool,
    pub completed_watcher_count: usize,
    pub total_watcher_count: usize,
    /// Set by the first finished sweep; later adds are validated on arrival.
    pub all_enumerated: bool,
    /// Number of sweeps finished over the controller's lifetime.
    pub sweep: u64,
}

struct ControllerState {
    phase: ControllerPhase,
    enumeration: EnumerationState,
    /// Bumped whenever sources are stopped; messages of older epochs are dropped.
    epoch: u64,
    /// The sweep for the current run has not fired yet.
    sweep_armed: bool,
    /// Sources counted toward the current sweep.
    running: HashSet<DeviceSelector>,
    /// Sources that finished their initial scan in the current run.
    completed: HashSet<DeviceSelector>,
    sources: Vec<Box<dyn DiscoverySource>>,
    queue: Option<mpsc::UnboundedSender<SourceMessage>>,
    pump_shutdown: Option<CancellationToken>,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            phase: ControllerPhase::Stopped,
            enumeration: EnumerationState::default(),
            epoch: 0,
            sweep_armed: false,
            running: HashSet::new(),
            completed: HashSet::new(),
            sources: Vec::new(),
            queue: None,
            pump_shutdown: None,
        }
    }

    fn sweep_ready(&self) -> bool {
        self.sweep_armed
            && !self.running.is_empty()
            && self.running.iter().all(|s| self.completed.contains(s))
    }

    fn sync_counts(&mut self) {
        self.enumeration.total_watcher_count = self.running.len();
        self.enumeration.completed_watcher_count = self.completed.len();
    }

    /// Record that `selector` finished its scan. False when it is not part
    /// of the current run or already reported.
    fn mark_completed(&mut self, selector: &DeviceSelector) -> bool {
        if !self.running.contains(selector) || !self.completed.insert(selector.clone()) {
            return false;
        }
        self.sync_counts();
        true
    }

    /// Drop an aborted source from the current run, along with any scan it
    /// had already reported.
    fn mark_aborted(&mut self, selector: &DeviceSelector) -> bool {
        if !self.running.remove(selector) {
            return false;
        }
        self.completed.remove(selector);
        self.sync_counts();
        true
    }

    /// Start every source that is not already running and begin a new run
    /// over them. Returns the failures.
    fn start_sources(&mut self) -> Vec<DiscoveryError> {
        let Some(queue) = self.queue.clone() else {
            return vec![DiscoveryError::NotRunning];
        };

        let epoch = self.epoch;
        let mut running = HashSet::new();
        let mut failures = Vec::new();
        for source in self.sources.iter_mut() {
            if source.status().is_running() {
                running.insert(source.selector().clone());
                continue;
            }
            let sink = EventSink::new(source.selector().clone(), epoch, queue.clone());
            match source.start(sink) {
                Ok(()) => {
                    running.insert(source.selector().clone());
                }
                Err(e) => {
                    error!(selector = %source.selector(), error = %e, "Discovery source failed to start");
                    failures.push(e);
                }
            }
        }

        self.enumeration.watchers_started = !running.is_empty();
        self.running = running;
        self.completed.clear();
        self.sync_counts();
        failures
    }

    fn stop_sources(&mut self) {
        for source in self.sources.iter_mut() {
            source.stop();
        }
        self.epoch += 1;
        self.enumeration.watchers_started = false;
    }
}

struct Inner {
    selectors: Vec<DeviceSelector>,
    factory: Arc<dyn SourceFactory>,
    registry: DeviceRegistry,
    validator: Arc<DeviceValidator>,
    transport: Arc<SerialTransport>,
    events: broadcast::Sender<DiscoveryEvent>,
    state: Mutex<ControllerState>,
}

impl Inner {
    async fn handle(&self, message: SourceMessage) {
        let SourceMessage {
            selector,
            epoch,
            event,
        } = message;

        match event {
            SourceEvent::Added(candidate) => {
                let (registration, enumerated) = {
                    let state = self.state.lock();
                    if epoch != state.epoch {
                        trace!(%selector, device = %candidate.id, "Dropping stale add");
                        return;
                    }
                    (
                        self.registry.register(&candidate),
                        state.enumeration.all_enumerated,
                    )
                };
                if registration == AddOutcome::Pending && enumerated {
                    self.registry.probe(&candidate).await;
                }
            }
            SourceEvent::Removed(id) => {
                let state = self.state.lock();
                if epoch != state.epoch {
                    trace!(%selector, device = %id, "Dropping stale removal");
                    return;
                }
                self.registry.on_device_removed(&selector, &id);
            }
            SourceEvent::EnumerationCompleted => {
                let ready = {
                    let mut state = self.state.lock();
                    if epoch != state.epoch {
                        return;
                    }
                    if !state.mark_completed(&selector) {
                        debug!(%selector, "Ignoring repeated enumeration completion");
                        return;
                    }
                    debug!(
                        %selector,
                        completed = state.enumeration.completed_watcher_count,
                        total = state.enumeration.total_watcher_count,
                        "Source finished enumeration"
                    );
                    state.sweep_ready()
                };
                if ready {
                    self.run_sweep(epoch).await;
                }
            }
            SourceEvent::Aborted { reason } => {
                let ready = {
                    let mut state = self.state.lock();
                    if epoch != state.epoch {
                        return;
                    }
                    error!(%selector, %reason, "Discovery source aborted");
                    if !state.mark_aborted(&selector) {
                        return;
                    }
                    if state.running.is_empty() {
                        warn!("No discovery sources left running");
                    }
                    state.sweep_ready()
                };
                if ready {
                    self.run_sweep(epoch).await;
                }
            }
        }
    }

    /// Validate every pending device, then announce the sweep once.
    async fn run_sweep(&self, epoch: u64) {
        self.state.lock().sweep_armed = false;

        let pending = self.registry.pending();
        debug!(pending = pending.len(), "Running validation sweep");
        let outcomes = self.validator.validate_batch(&pending).await;
        for (id, outcome) in outcomes {
            self.registry.apply_validation(&id, outcome);
        }

        let (sweep, devices) = {
            let mut state = self.state.lock();
            if epoch != state.epoch {
                debug!("Discovery stopped during sweep, not announcing it");
                return;
            }
            self.registry.expire_unreported();
            state.enumeration.all_enumerated = true;
            state.enumeration.sweep += 1;
            if state.phase == ControllerPhase::Watching {
                state.phase = ControllerPhase::EnumerationComplete;
            }
            (state.enumeration.sweep, self.registry.list_devices().len())
        };

        info!(sweep, devices, "Enumeration completed");
        let _ = self
            .events
            .send(DiscoveryEvent::EnumerationCompleted { sweep, devices });
    }
}

async fn pump(
    inner: Arc<Inner>,
    mut queue: mpsc::UnboundedReceiver<SourceMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        inner.handle(message).await;
    }
    trace!("Discovery event pump exiting");
}

/// Entry point for consumers: lifecycle, device listing and connections.
pub struct DiscoveryController {
    inner: Arc<Inner>,
}

impl DiscoveryController {
    pub fn new(
        config: &Config,
        factory: Arc<dyn SourceFactory>,
        opener: Arc<dyn PortOpener>,
    ) -> Self {
        let port_config = config.transport.port_configuration();
        let validator = Arc::new(DeviceValidator::new(
            opener.clone(),
            RuleTable::new(config.validation.rules()),
            port_config.clone(),
            config.validation.probe_timeout(),
        ));
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let registry = DeviceRegistry::new(
            validator.clone(),
            config.discovery.dispose_grace(),
            events.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                selectors: config.discovery.selectors(),
                factory,
                registry,
                validator,
                transport: Arc::new(SerialTransport::new(opener, port_config)),
                events,
                state: Mutex::new(ControllerState::new()),
            }),
        }
    }

    /// Create and start one source per selector.
    ///
    /// A no-op when already started. Sources that fail to start are logged
    /// and left out of the sweep count; the call only fails when none start.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.phase != ControllerPhase::Stopped {
            debug!(phase = ?state.phase, "Discovery already started");
            return Ok(());
        }

        state.phase = ControllerPhase::Starting;
        state.epoch += 1;
        state.sweep_armed = true;
        state.enumeration = EnumerationState {
            sweep: state.enumeration.sweep,
            ..EnumerationState::default()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        state.queue = Some(tx);
        state.pump_shutdown = Some(shutdown.clone());
        tokio::spawn(pump(inner.clone(), rx, shutdown));

        let mut failures = Vec::new();
        state.sources.clear();
        for selector in &inner.selectors {
            match inner.factory.create(selector) {
                Ok(source) => state.sources.push(source),
                Err(e) => {
                    error!(%selector, error = %e, "Failed to create discovery source");
                    failures.push(e);
                }
            }
        }
        failures.extend(state.start_sources());

        if !state.enumeration.watchers_started {
            self.shutdown_locked(&mut state);
            let error = failures.into_iter().next().unwrap_or(DiscoveryError::NotRunning);
            return Err(error.into());
        }

        state.phase = ControllerPhase::Watching;
        info!(
            sources = state.enumeration.total_watcher_count,
            failed = failures.len(),
            "Discovery started"
        );
        Ok(())
    }

    /// Stop every source and forget present devices.
    ///
    /// Only acts while watchers are running. Logical devices stay listed;
    /// those not reported again after resuming age out once its sweep runs.
    pub fn app_suspending(&self) -> bool {
        let mut state = self.inner.state.lock();
        if !state.enumeration.watchers_started || state.enumeration.watchers_suspended {
            debug!("Suspend ignored, discovery not running");
            return false;
        }

        state.stop_sources();
        self.inner.registry.clear();
        state.enumeration.watchers_suspended = true;
        state.phase = ControllerPhase::Suspended;
        info!("Discovery suspended");
        true
    }

    /// Restart the sources stopped by [`Self::app_suspending`].
    ///
    /// A new sweep runs once they all finish their scan; registry contents
    /// and `all_enumerated` are kept.
    pub fn app_resumed(&self) -> bool {
        let mut state = self.inner.state.lock();
        if !state.enumeration.watchers_suspended {
            debug!("Resume ignored, discovery not suspended");
            return false;
        }

        state.enumeration.watchers_suspended = false;
        state.sweep_armed = true;
        let failures = state.start_sources();
        state.phase = ControllerPhase::Watching;
        info!(
            sources = state.enumeration.total_watcher_count,
            failed = failures.len(),
            "Discovery resumed"
        );
        true
    }

    /// Stop and drop every source and the event pump.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.phase == ControllerPhase::Stopped {
            return;
        }
        self.shutdown_locked(&mut state);
        info!("Discovery stopped");
    }

    fn shutdown_locked(&self, state: &mut ControllerState) {
        state.stop_sources();
        state.sources.clear();
        state.queue = None;
        if let Some(shutdown) = state.pump_shutdown.take() {
            shutdown.cancel();
        }
        self.inner.registry.clear();
        state.enumeration.watchers_suspended = false;
        state.phase = ControllerPhase::Stopped;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    /// Validated devices in the order they were first seen.
    pub fn list_devices(&self) -> Vec<LogicalDevice> {
        self.inner.registry.list_devices()
    }

    /// Any known logical device, validated or not.
    pub fn find_device(&self, id: &PhysicalDeviceId) -> Option<LogicalDevice> {
        self.inner.registry.find_logical(id)
    }

    pub fn enumeration_state(&self) -> EnumerationState {
        self.inner.state.lock().enumeration.clone()
    }

    pub fn phase(&self) -> ControllerPhase {
        self.inner.state.lock().phase
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn transport(&self) -> Arc<SerialTransport> {
        self.inner.transport.clone()
    }

    /// Open the transport to a validated device.
    ///
    /// Connecting to the device that is already open returns the transport
    /// without reopening it.
    pub async fn connect(
        &self,
        id: &PhysicalDeviceId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<SerialTransport>> {
        let device = self
            .inner
            .registry
            .find_logical(id)
            .filter(LogicalDevice::is_validated)
            .ok_or_else(|| Error::NotConnected(id.clone()))?;
        let endpoint = device.endpoint();
        let transport = &self.inner.transport;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                warn!(device = %id, ?timeout, "Connect timed out");
                Err(Error::Timeout(timeout))
            }
            opened = transport.open(&endpoint) => opened.map(|()| transport.clone()),
        }
    }

    /// Close the transport if it is connected to `id`.
    pub fn disconnect(&self, id: &PhysicalDeviceId) -> bool {
        self.inner.transport.disconnect(id)
    }
}

impl Drop for DiscoveryController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DiscoveryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryController")
            .field("selectors", &self.inner.selectors)
            .field("phase", &self.phase())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

//! Script-driven discovery source.
//!
//! A [`ManualSource`] has no platform backend: its owner pushes events
//! through a [`ManualHandle`]. Events pushed while the source is not running
//! are dropped, the same as a platform watcher that is switched off.

use super::{DiscoveryError, DiscoverySource, EventSink, SourceFactory, SourceStatus};
use crate::device::{DeviceMetadata, DeviceSelector, PhysicalDeviceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
struct ManualState {
    status: SourceStatus,
    sink: Option<EventSink>,
    starts: usize,
    fail_next_start: Option<String>,
}

impl Default for ManualState {
    fn default() -> Self {
        Self {
            status: SourceStatus::NotStarted,
            sink: None,
            starts: 0,
            fail_next_start: None,
        }
    }
}

/// Control side of a [`ManualSource`].
#[derive(Debug, Clone)]
pub struct ManualHandle {
    selector: DeviceSelector,
    state: Arc<Mutex<ManualState>>,
}

impl ManualHandle {
    fn new(selector: DeviceSelector) -> Self {
        Self {
            selector,
            state: Arc::new(Mutex::new(ManualState::default())),
        }
    }

    pub fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    /// Report a device. Returns false if the source is not running.
    pub fn add(&self, id: impl Into<PhysicalDeviceId>, metadata: DeviceMetadata) -> bool {
        let state = self.state.lock();
        match state.sink.as_ref() {
            Some(sink) => sink.added(id.into(), metadata),
            None => false,
        }
    }

    pub fn remove(&self, id: impl Into<PhysicalDeviceId>) -> bool {
        let state = self.state.lock();
        match state.sink.as_ref() {
            Some(sink) => sink.removed(id.into()),
            None => false,
        }
    }

    /// Finish the initial scan of the current run.
    pub fn complete_enumeration(&self) -> bool {
        let mut state = self.state.lock();
        let Some(sink) = state.sink.as_ref() else {
            return false;
        };
        let sent = sink.enumeration_completed();
        state.status = SourceStatus::EnumerationCompleted;
        sent
    }

    /// Terminate the source as if its platform watcher died.
    pub fn abort(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        let Some(sink) = state.sink.take() else {
            return false;
        };
        state.status = SourceStatus::Aborted;
        sink.aborted(reason)
    }

    /// Make the next `start` fail with `reason`.
    pub fn fail_next_start(&self, reason: &str) {
        self.state.lock().fail_next_start = Some(reason.to_string());
    }

    pub fn status(&self) -> SourceStatus {
        self.state.lock().status
    }

    /// Number of successful starts so far.
    pub fn start_count(&self) -> usize {
        self.state.lock().starts
    }
}

/// Discovery source driven through a [`ManualHandle`].
#[derive(Debug)]
pub struct ManualSource {
    handle: ManualHandle,
}

impl ManualSource {
    pub fn new(selector: impl Into<DeviceSelector>) -> (Self, ManualHandle) {
        let handle = ManualHandle::new(selector.into());
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl DiscoverySource for ManualSource {
    fn selector(&self) -> &DeviceSelector {
        &self.handle.selector
    }

    fn start(&mut self, sink: EventSink) -> Result<(), DiscoveryError> {
        let mut state = self.handle.state.lock();
        if let Some(reason) = state.fail_next_start.take() {
            state.status = SourceStatus::Aborted;
            return Err(DiscoveryError::start_failed(&self.handle.selector, reason));
        }

        trace!(selector = %self.handle.selector, epoch = sink.epoch(), "Manual source started");
        state.sink = Some(sink);
        state.status = SourceStatus::Started;
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.handle.state.lock();
        if state.sink.take().is_some() {
            trace!(selector = %self.handle.selector, "Manual source stopped");
        }
        if state.status != SourceStatus::Aborted {
            state.status = SourceStatus::Stopped;
        }
    }

    fn status(&self) -> SourceStatus {
        self.handle.status()
    }
}

/// Hands out one shared [`ManualHandle`] per selector.
///
/// Handles can be fetched before the controller creates its sources; a
/// source created later for the same selector is driven by that handle.
#[derive(Debug, Default)]
pub struct ManualSourceFactory {
    handles: Mutex<HashMap<DeviceSelector, ManualHandle>>,
}

impl ManualSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, selector: impl Into<DeviceSelector>) -> ManualHandle {
        let selector = selector.into();
        self.handles
            .lock()
            .entry(selector.clone())
            .or_insert_with(|| ManualHandle::new(selector))
            .clone()
    }
}

impl SourceFactory for ManualSourceFactory {
    fn create(&self, selector: &DeviceSelector) -> Result<Box<dyn DiscoverySource>, DiscoveryError> {
        Ok(Box::new(ManualSource {
            handle: self.handle(selector.clone()),
        }))
    }
}

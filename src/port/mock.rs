//! Mock port opener for testing.
//!
//! Provides a [`MockPortOpener`] that simulates serial devices without
//! requiring hardware. Each successful open creates an in-memory duplex
//! channel; the test keeps the device end and plays the firmware.

use super::error::PortError;
use super::traits::{OpenedPort, PortConfiguration, PortIdentity, PortOpener};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;

/// Default capacity of the in-memory channel, in bytes.
const DEFAULT_BUFFER_SIZE: usize = 4096;

/// How a simulated device behaves when probed.
#[derive(Debug, Clone)]
pub struct MockDeviceProfile {
    /// Identity returned from `identify`.
    pub identity: PortIdentity,
    /// When set, every open attempt fails with [`PortError::Busy`].
    pub fail_open: bool,
    /// Artificial latency of the identification read.
    pub identify_delay: Duration,
    /// Capacity of the duplex channel. Writes beyond it block until the
    /// device end reads.
    pub buffer_size: usize,
}

impl MockDeviceProfile {
    pub fn new(identity: PortIdentity) -> Self {
        Self {
            identity,
            fail_open: false,
            identify_delay: Duration::ZERO,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn with_identify_delay(mut self, delay: Duration) -> Self {
        self.identify_delay = delay;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }
}

#[derive(Debug, Default)]
struct MockOpenerState {
    profiles: HashMap<String, MockDeviceProfile>,
    /// Device end of the most recent open, per port.
    device_ends: HashMap<String, DuplexStream>,
    open_counts: HashMap<String, usize>,
}

/// Mock port opener for testing.
///
/// # Example
/// ```
/// use serial_discovery::port::{MockDeviceProfile, MockPortOpener, PortIdentity};
///
/// let opener = MockPortOpener::new()
///     .with_device("COM3", MockDeviceProfile::new(PortIdentity::named("STM32 STLink")));
/// assert_eq!(opener.open_count("COM3"), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockPortOpener {
    state: Arc<Mutex<MockOpenerState>>,
}

impl MockPortOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a simulated device (builder form).
    pub fn with_device(self, port_name: impl Into<String>, profile: MockDeviceProfile) -> Self {
        self.add_device(port_name, profile);
        self
    }

    /// Register or replace a simulated device.
    pub fn add_device(&self, port_name: impl Into<String>, profile: MockDeviceProfile) {
        self.state.lock().profiles.insert(port_name.into(), profile);
    }

    /// Remove a simulated device. Later opens fail with `NotFound`.
    pub fn remove_device(&self, port_name: &str) {
        let mut state = self.state.lock();
        state.profiles.remove(port_name);
        state.device_ends.remove(port_name);
    }

    /// Take the device end of the most recent open of `port_name`.
    pub fn take_device_end(&self, port_name: &str) -> Option<DuplexStream> {
        self.state.lock().device_ends.remove(port_name)
    }

    /// Number of successful opens of `port_name`.
    pub fn open_count(&self, port_name: &str) -> usize {
        self.state
            .lock()
            .open_counts
            .get(port_name)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PortOpener for MockPortOpener {
    async fn open(
        &self,
        port_name: &str,
        _config: &PortConfiguration,
    ) -> Result<OpenedPort, PortError> {
        let mut state = self.state.lock();
        let profile = state
            .profiles
            .get(port_name)
            .cloned()
            .ok_or_else(|| PortError::not_found(port_name))?;

        if profile.fail_open {
            return Err(PortError::busy(port_name));
        }

        let (host, device) = tokio::io::duplex(profile.buffer_size);
        state.device_ends.insert(port_name.to_string(), device);
        *state.open_counts.entry(port_name.to_string()).or_insert(0) += 1;

        Ok(OpenedPort::new(port_name, host))
    }

    async fn identify(&self, port_name: &str) -> Result<PortIdentity, PortError> {
        let profile = self
            .state
            .lock()
            .profiles
            .get(port_name)
            .cloned()
            .ok_or_else(|| PortError::not_found(port_name))?;

        if !profile.identify_delay.is_zero() {
            tokio::time::sleep(profile.identify_delay).await;
        }
        Ok(profile.identity)
    }
}

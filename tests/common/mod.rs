//! Shared test utilities for the discovery tests.
//!
//! This module provides:
//! - A controller wired to manual sources and a mock port opener
//! - Simulated devices covering accept-by-name, accept-by-tag and reject
//! - Helpers for waiting on discovery notifications

#![allow(dead_code)]

use serial_discovery::config::Config;
use serial_discovery::discovery::{ManualHandle, ManualSourceFactory};
use serial_discovery::port::{MockDeviceProfile, MockPortOpener, PortIdentity};
use serial_discovery::{DeviceMetadata, DiscoveryController, DiscoveryEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Port of a device that identifies as "STM32 STLink".
pub const STLINK_PORT: &str = "COM3";
/// Port of a device with an unrecognized name and no product tag.
pub const UNKNOWN_PORT: &str = "COM4";
/// Port of a device that cannot be opened.
pub const BUSY_PORT: &str = "COM5";
/// Port of a device accepted by its serial-number tag.
pub const NANO_PORT: &str = "COM7";
/// Port of a device whose writes never drain.
pub const STALLED_PORT: &str = "COM8";

pub const NANO_SERIAL: &str = "NANO_0671FF";

/// Mock opener with one device of every kind the tests need.
pub fn mock_opener() -> MockPortOpener {
    MockPortOpener::new()
        .with_device(
            STLINK_PORT,
            MockDeviceProfile::new(PortIdentity::named("STM32 STLink")),
        )
        .with_device(
            UNKNOWN_PORT,
            MockDeviceProfile::new(PortIdentity::named("USB Serial Device")),
        )
        .with_device(
            BUSY_PORT,
            MockDeviceProfile::new(PortIdentity::named("STM32 STLink")).failing_open(),
        )
        .with_device(
            NANO_PORT,
            MockDeviceProfile::new(
                PortIdentity::named("USB Serial Device").with_serial_number(NANO_SERIAL),
            ),
        )
        .with_device(
            STALLED_PORT,
            MockDeviceProfile::new(PortIdentity::named("STM32 STLink")).with_buffer_size(1),
        )
}

pub fn metadata(port: &str) -> DeviceMetadata {
    DeviceMetadata::new(port)
}

/// A controller over manual sources, with its test doubles.
pub struct Harness {
    pub controller: DiscoveryController,
    pub factory: Arc<ManualSourceFactory>,
    pub opener: MockPortOpener,
    pub events: broadcast::Receiver<DiscoveryEvent>,
}

impl Harness {
    pub fn new(selectors: &[&str]) -> Self {
        let mut config = Config::default();
        config.discovery.selectors = selectors.iter().map(|s| s.to_string()).collect();
        config.discovery.dispose_grace_ms = 2500;
        config.validation.probe_timeout_ms = 500;
        Self::with_config(&config)
    }

    pub fn with_config(config: &Config) -> Self {
        let factory = Arc::new(ManualSourceFactory::new());
        let opener = mock_opener();
        let controller =
            DiscoveryController::new(config, factory.clone(), Arc::new(opener.clone()));
        let events = controller.subscribe();

        Self {
            controller,
            factory,
            opener,
            events,
        }
    }

    /// Control handle of the source for `selector`.
    pub fn source(&self, selector: &str) -> ManualHandle {
        self.factory.handle(selector)
    }

    /// Start discovery and report every device through the "usb" source,
    /// then finish its scan and wait for the sweep.
    pub async fn start_with(&mut self, devices: &[(&str, &str)]) -> (u64, usize) {
        self.controller.start().expect("discovery should start");
        let usb = self.source("usb");
        for (id, port) in devices {
            assert!(usb.add(*id, metadata(port)));
        }
        assert!(usb.complete_enumeration());
        self.next_sweep().await
    }

    /// Wait for the next enumeration-completed notification.
    pub async fn next_sweep(&mut self) -> (u64, usize) {
        loop {
            if let DiscoveryEvent::EnumerationCompleted { sweep, devices } = self.next_event().await
            {
                return (sweep, devices);
            }
        }
    }

    pub async fn next_event(&mut self) -> DiscoveryEvent {
        tokio::time::timeout(Duration::from_secs(10), self.events.recv())
            .await
            .expect("no discovery event within deadline")
            .expect("discovery event channel closed")
    }

    /// Count sweeps already delivered without waiting.
    pub fn drain_sweeps(&mut self) -> usize {
        let mut sweeps = 0;
        while let Ok(event) = self.events.try_recv() {
            if matches!(event, DiscoveryEvent::EnumerationCompleted { .. }) {
                sweeps += 1;
            }
        }
        sweeps
    }
}

/// Let the event pump drain whatever has been queued.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

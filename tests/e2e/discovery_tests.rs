//! E2E tests for discovery and validation.
//!
//! These tests verify that:
//! - Devices stay pending until every source has finished its scan
//! - The sweep accepts devices by name or serial tag and drops the rest
//! - The sweep runs exactly once whatever order completions arrive in
//! - Devices arriving after the sweep are validated on their own

use crate::common::{
    metadata, settle, Harness, BUSY_PORT, NANO_PORT, NANO_SERIAL, STLINK_PORT, UNKNOWN_PORT,
};
use pretty_assertions::assert_eq;
use serial_discovery::{ControllerPhase, DiscoveryEvent, PhysicalDeviceId, ValidationState};

#[tokio::test]
async fn test_known_device_pending_until_sweep() {
    let mut harness = Harness::new(&["usb"]);
    harness.controller.start().unwrap();
    let usb = harness.source("usb");

    usb.add("A", metadata(STLINK_PORT));
    settle().await;

    let device = harness.controller.find_device(&"A".into()).unwrap();
    assert_eq!(device.state, ValidationState::Pending);
    assert!(harness.controller.list_devices().is_empty());
    assert_eq!(harness.opener.open_count(STLINK_PORT), 0);

    usb.complete_enumeration();
    assert_eq!(harness.next_sweep().await, (1, 1));

    let listed = harness.controller.list_devices();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, PhysicalDeviceId::new("A"));
    assert_eq!(listed[0].state, ValidationState::Validated);
    assert_eq!(
        listed[0].description.as_deref(),
        Some("STM32 STLink @ COM3")
    );
}

#[tokio::test]
async fn test_unknown_device_rejected_by_sweep() {
    let mut harness = Harness::new(&["usb"]);
    let (_, devices) = harness
        .start_with(&[("A", STLINK_PORT), ("B", UNKNOWN_PORT)])
        .await;

    assert_eq!(devices, 1);
    let ids: Vec<_> = harness
        .controller
        .list_devices()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec![PhysicalDeviceId::new("A")]);
    assert!(harness.controller.find_device(&"B".into()).is_none());
    assert!(harness.controller.registry().find(&"B".into()).is_none());
}

#[tokio::test]
async fn test_serial_tag_match_uses_full_token() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("N", NANO_PORT)]).await;

    let device = harness.controller.find_device(&"N".into()).unwrap();
    assert_eq!(
        device.description,
        Some(format!("{} @ {}", NANO_SERIAL, NANO_PORT))
    );
}

#[tokio::test]
async fn test_unopenable_device_is_dropped_quietly() {
    let mut harness = Harness::new(&["usb"]);
    let (_, devices) = harness.start_with(&[("C", BUSY_PORT)]).await;

    assert_eq!(devices, 0);
    assert!(harness.controller.find_device(&"C".into()).is_none());
}

#[tokio::test]
async fn test_sweep_runs_once_whatever_the_completion_order() {
    let mut harness = Harness::new(&["usb", "bluetooth", "pci"]);
    harness.controller.start().unwrap();
    let usb = harness.source("usb");
    let bluetooth = harness.source("bluetooth");
    let pci = harness.source("pci");

    usb.add("A", metadata(STLINK_PORT));
    pci.complete_enumeration();
    bluetooth.complete_enumeration();
    settle().await;
    assert_eq!(harness.drain_sweeps(), 0);
    assert_eq!(harness.controller.enumeration_state().completed_watcher_count, 2);

    usb.complete_enumeration();
    assert_eq!(harness.next_sweep().await, (1, 1));

    // A late duplicate completion does not trigger another sweep.
    usb.complete_enumeration();
    settle().await;
    assert_eq!(harness.drain_sweeps(), 0);
    assert_eq!(harness.opener.open_count(STLINK_PORT), 1);

    let state = harness.controller.enumeration_state();
    assert!(state.all_enumerated);
    assert_eq!(state.sweep, 1);
    assert_eq!(harness.controller.phase(), ControllerPhase::EnumerationComplete);
}

#[tokio::test]
async fn test_device_after_sweep_validated_on_arrival() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[]).await;

    harness.source("usb").add("A", metadata(STLINK_PORT));
    let DiscoveryEvent::DeviceArrived(device) = harness.next_event().await else {
        panic!("expected an arrival");
    };
    assert_eq!(device.id, PhysicalDeviceId::new("A"));
    assert_eq!(device.description.as_deref(), Some("STM32 STLink @ COM3"));
    assert_eq!(harness.controller.list_devices(), vec![device]);
}

#[tokio::test]
async fn test_rejected_device_after_sweep_never_listed() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[]).await;

    harness.source("usb").add("B", metadata(UNKNOWN_PORT));
    settle().await;

    assert!(harness.controller.list_devices().is_empty());
    assert!(harness.controller.find_device(&"B".into()).is_none());
    assert_eq!(harness.opener.open_count(UNKNOWN_PORT), 1);
}

#[tokio::test]
async fn test_duplicate_adds_create_one_device() {
    let mut harness = Harness::new(&["usb", "all"]);
    harness.controller.start().unwrap();

    // The same device seen through two overlapping selectors.
    harness.source("usb").add("A", metadata(STLINK_PORT));
    harness.source("all").add("A", metadata(STLINK_PORT));
    harness.source("usb").complete_enumeration();
    harness.source("all").complete_enumeration();

    assert_eq!(harness.next_sweep().await, (1, 1));
    assert_eq!(harness.controller.registry().logical_count(), 1);
    assert_eq!(harness.opener.open_count(STLINK_PORT), 1);
}

#[tokio::test]
async fn test_repeated_completion_does_not_start_sweep() {
    let mut harness = Harness::new(&["usb", "bluetooth"]);
    harness.controller.start().unwrap();
    let usb = harness.source("usb");

    usb.add("A", metadata(STLINK_PORT));
    usb.complete_enumeration();
    usb.complete_enumeration();
    settle().await;

    assert_eq!(harness.drain_sweeps(), 0);
    let state = harness.controller.enumeration_state();
    assert!(!state.all_enumerated);
    assert_eq!(state.completed_watcher_count, 1);
    assert_eq!(harness.opener.open_count(STLINK_PORT), 0);

    harness.source("bluetooth").complete_enumeration();
    assert_eq!(harness.next_sweep().await, (1, 1));
}

#[tokio::test]
async fn test_device_stays_while_overlapping_source_reports_it() {
    let mut harness = Harness::new(&["usb", "all"]);
    harness.controller.start().unwrap();
    let usb = harness.source("usb");
    let all = harness.source("all");

    usb.add("A", metadata(STLINK_PORT));
    all.add("A", metadata(STLINK_PORT));
    usb.complete_enumeration();
    all.complete_enumeration();
    assert_eq!(harness.next_sweep().await, (1, 1));

    usb.remove("A");
    settle().await;
    let device = harness.controller.find_device(&"A".into()).unwrap();
    assert!(!device.departing);
    assert_eq!(harness.controller.registry().candidate_count(), 1);

    all.remove("A");
    settle().await;
    assert!(harness.controller.find_device(&"A".into()).unwrap().departing);
    assert_eq!(harness.controller.registry().candidate_count(), 0);
}

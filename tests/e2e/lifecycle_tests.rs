//! E2E tests for removal debouncing and the controller lifecycle.
//!
//! Grace-window tests run on paused time so the 2.5 s window elapses
//! deterministically.

use crate::common::{metadata, settle, Harness, STLINK_PORT};
use pretty_assertions::assert_eq;
use serial_discovery::discovery::SourceStatus;
use serial_discovery::{ControllerPhase, DiscoveryEvent, PhysicalDeviceId};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_reappearance_within_grace_is_a_no_op() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    let before = harness.controller.find_device(&"A".into()).unwrap();
    let usb = harness.source("usb");

    usb.remove("A");
    settle().await;
    assert!(harness.controller.registry().find(&"A".into()).is_none());
    assert!(harness.controller.find_device(&"A".into()).unwrap().departing);

    tokio::time::sleep(Duration::from_secs(1)).await;
    usb.add("A", metadata(STLINK_PORT));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(harness.controller.find_device(&"A".into()), Some(before));
    assert_eq!(harness.controller.list_devices().len(), 1);
    assert_eq!(harness.controller.registry().logical_count(), 1);
    // No re-validation on reappearance.
    assert_eq!(harness.opener.open_count(STLINK_PORT), 1);
}

#[tokio::test(start_paused = true)]
async fn test_churn_within_grace_keeps_one_device() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    let before = harness.controller.find_device(&"A".into()).unwrap();
    let usb = harness.source("usb");

    for _ in 0..5 {
        usb.remove("A");
        tokio::time::sleep(Duration::from_millis(300)).await;
        usb.add("A", metadata(STLINK_PORT));
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(harness.controller.list_devices(), vec![before]);
    assert_eq!(harness.opener.open_count(STLINK_PORT), 1);
}

#[tokio::test(start_paused = true)]
async fn test_device_disposed_after_grace() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;

    harness.source("usb").remove("A");
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(harness.controller.list_devices().is_empty());
    assert!(harness.controller.find_device(&"A".into()).is_none());
    assert_eq!(
        harness.next_event().await,
        DiscoveryEvent::DeviceDeparted(PhysicalDeviceId::new("A"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_device_listed_while_departing() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;

    harness.source("usb").remove("A");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let listed = harness.controller.list_devices();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].departing);
}

#[tokio::test(start_paused = true)]
async fn test_suspend_clears_candidates_and_keeps_devices() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;

    assert!(harness.controller.app_suspending());
    assert_eq!(harness.controller.phase(), ControllerPhase::Suspended);
    assert_eq!(harness.source("usb").status(), SourceStatus::Stopped);
    assert_eq!(harness.controller.registry().candidate_count(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.controller.list_devices().len(), 1);

    let state = harness.controller.enumeration_state();
    assert!(state.watchers_suspended);
    assert!(!state.watchers_started);
}

#[tokio::test(start_paused = true)]
async fn test_resume_runs_a_new_sweep_without_revalidating() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    harness.controller.app_suspending();

    assert!(harness.controller.app_resumed());
    assert_eq!(harness.controller.phase(), ControllerPhase::Watching);
    let usb = harness.source("usb");
    assert_eq!(usb.start_count(), 2);

    usb.add("A", metadata(STLINK_PORT));
    usb.complete_enumeration();
    assert_eq!(harness.next_sweep().await, (2, 1));

    assert_eq!(harness.opener.open_count(STLINK_PORT), 1);
    let state = harness.controller.enumeration_state();
    assert!(state.all_enumerated);
    assert_eq!(state.completed_watcher_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_device_gone_after_resume_ages_out() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    harness.controller.app_suspending();
    harness.controller.app_resumed();

    // The rescan no longer sees A and never reports it again.
    harness.source("usb").complete_enumeration();
    harness.next_sweep().await;
    assert!(harness.controller.find_device(&"A".into()).unwrap().departing);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(harness.controller.list_devices().is_empty());
}

#[tokio::test]
async fn test_lifecycle_calls_ignored_when_not_applicable() {
    let harness = Harness::new(&["usb"]);
    assert!(!harness.controller.app_suspending());
    assert!(!harness.controller.app_resumed());
    assert_eq!(harness.controller.phase(), ControllerPhase::Stopped);

    harness.controller.start().unwrap();
    assert!(!harness.controller.app_resumed());
    assert_eq!(harness.controller.phase(), ControllerPhase::Watching);
}

#[tokio::test]
async fn test_restart_after_stop_counts_sweeps_on() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;

    harness.controller.stop();
    assert_eq!(harness.controller.phase(), ControllerPhase::Stopped);
    assert!(!harness.controller.enumeration_state().watchers_started);

    let (sweep, devices) = harness.start_with(&[("A", STLINK_PORT)]).await;
    assert_eq!(sweep, 2);
    assert_eq!(devices, 1);
    assert_eq!(harness.opener.open_count(STLINK_PORT), 1);
}

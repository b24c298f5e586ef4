//! E2E tests for connecting to validated devices and bounded byte I/O.

use crate::common::{metadata, settle, Harness, NANO_PORT, STALLED_PORT, STLINK_PORT};
use pretty_assertions::assert_eq;
use serial_discovery::{CancellationToken, Error, IoOutcome, IoStatus, PhysicalDeviceId};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

const TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::test]
async fn test_connect_twice_is_idempotent() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    let cancel = CancellationToken::new();

    // One open from validation, one from the first connect.
    harness.controller.connect(&"A".into(), TIMEOUT, &cancel).await.unwrap();
    assert_eq!(harness.opener.open_count(STLINK_PORT), 2);

    let transport = harness.controller.connect(&"A".into(), TIMEOUT, &cancel).await.unwrap();
    assert_eq!(harness.opener.open_count(STLINK_PORT), 2);
    assert!(transport.is_connected());
    assert_eq!(
        transport.connected_device().map(|e| e.id),
        Some(PhysicalDeviceId::new("A"))
    );
}

#[tokio::test]
async fn test_connect_rejects_unvalidated_devices() {
    let harness = Harness::new(&["usb"]);
    harness.controller.start().unwrap();
    harness.source("usb").add("A", metadata(STLINK_PORT));
    settle().await;

    // Still pending: the sweep has not run.
    let err = harness
        .controller
        .connect(&"A".into(), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected(_)));

    let err = harness
        .controller
        .connect(&"missing".into(), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected(_)));
}

#[tokio::test]
async fn test_connect_with_cancelled_token() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness
        .controller
        .connect(&"A".into(), TIMEOUT, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancellation());
    assert!(!harness.controller.transport().is_connected());
}

#[tokio::test]
async fn test_round_trip_through_connected_device() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    let cancel = CancellationToken::new();
    let transport = harness.controller.connect(&"A".into(), TIMEOUT, &cancel).await.unwrap();
    let mut device = harness.opener.take_device_end(STLINK_PORT).unwrap();

    let sent = transport.send(b"\x01PING", TIMEOUT, &cancel).await.unwrap();
    assert_eq!(sent, IoOutcome::completed(5));
    let mut request = [0u8; 5];
    device.read_exact(&mut request).await.unwrap();
    assert_eq!(&request, b"\x01PING");

    device.write_all(b"\x02PONG").await.unwrap();
    let reply = transport.receive(64, TIMEOUT, &cancel).await.unwrap();
    assert_eq!(reply, IoOutcome::completed(b"\x02PONG".to_vec()));
}

#[tokio::test]
async fn test_short_read_returns_what_arrived() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("N", NANO_PORT)]).await;
    let cancel = CancellationToken::new();
    let transport = harness.controller.connect(&"N".into(), TIMEOUT, &cancel).await.unwrap();
    let mut device = harness.opener.take_device_end(NANO_PORT).unwrap();

    device.write_all(b"abc").await.unwrap();
    let received = transport.receive(1024, TIMEOUT, &cancel).await.unwrap();
    assert_eq!(received, IoOutcome::completed(b"abc".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_send_returns_zero_after_timeout() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("S", STALLED_PORT)]).await;
    let cancel = CancellationToken::new();
    let transport = harness.controller.connect(&"S".into(), TIMEOUT, &cancel).await.unwrap();
    // Held but never read, so the write cannot complete.
    let _device = harness.opener.take_device_end(STALLED_PORT).unwrap();

    let started = Instant::now();
    let sent = transport.send(&[0x55; 256], TIMEOUT, &cancel).await.unwrap();

    assert_eq!(sent, IoOutcome::new(0, IoStatus::TimedOut));
    assert!(started.elapsed() >= TIMEOUT);
    assert!(started.elapsed() < TIMEOUT + Duration::from_millis(100));
    assert!(transport.last_activity().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_receive_frees_the_gate() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    let transport = harness
        .controller
        .connect(&"A".into(), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    let mut device = harness.opener.take_device_end(STLINK_PORT).unwrap();

    let cancel = CancellationToken::new();
    let pending = {
        let transport = transport.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { transport.receive(16, Duration::from_secs(30), &cancel).await })
    };
    while !transport.read_in_flight() {
        tokio::task::yield_now().await;
    }
    cancel.cancel();

    let cancelled = pending.await.unwrap().unwrap();
    assert_eq!(cancelled, IoOutcome::new(Vec::new(), IoStatus::Cancelled));
    assert!(!transport.read_in_flight());

    device.write_all(b"next").await.unwrap();
    let started = Instant::now();
    let next = transport
        .receive(16, TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(next, IoOutcome::completed(b"next".to_vec()));
    assert!(started.elapsed() < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_receives_do_not_overlap() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    let transport = harness
        .controller
        .connect(&"A".into(), TIMEOUT, &CancellationToken::new())
        .await
        .unwrap();
    let mut device = harness.opener.take_device_end(STLINK_PORT).unwrap();

    let mut readers = Vec::new();
    for _ in 0..3 {
        let transport = transport.clone();
        readers.push(tokio::spawn(async move {
            let outcome = transport
                .receive(1, Duration::from_secs(30), &CancellationToken::new())
                .await
                .unwrap();
            (Instant::now(), outcome)
        }));
    }
    while !transport.read_in_flight() {
        tokio::task::yield_now().await;
    }

    // One byte at a time: each read takes exactly one and frees the gate.
    for byte in [b'x', b'y', b'z'] {
        tokio::time::sleep(Duration::from_millis(100)).await;
        device.write_all(&[byte]).await.unwrap();
    }

    let mut received = Vec::new();
    let mut finished = Vec::new();
    for reader in readers {
        let (at, outcome) = reader.await.unwrap();
        assert_eq!(outcome.status, IoStatus::Completed);
        received.extend(outcome.value);
        finished.push(at);
    }
    received.sort_unstable();
    assert_eq!(received, b"xyz".to_vec());

    // Completions are spread across the three writes.
    finished.sort_unstable();
    assert!(finished[1] - finished[0] >= Duration::from_millis(100));
    assert!(finished[2] - finished[1] >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_disconnect_ends_io() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    let cancel = CancellationToken::new();
    let transport = harness.controller.connect(&"A".into(), TIMEOUT, &cancel).await.unwrap();

    assert!(!harness.controller.disconnect(&"B".into()));
    assert!(harness.controller.disconnect(&"A".into()));

    let sent = transport.send(b"late", TIMEOUT, &cancel).await.unwrap();
    assert_eq!(sent, IoOutcome::new(0, IoStatus::NotConnected));
    let received = transport.receive(8, TIMEOUT, &cancel).await.unwrap();
    assert_eq!(received.status, IoStatus::NotConnected);
}

#[tokio::test]
async fn test_last_activity_moves_forward() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    let cancel = CancellationToken::new();
    let transport = harness.controller.connect(&"A".into(), TIMEOUT, &cancel).await.unwrap();
    let _device = harness.opener.take_device_end(STLINK_PORT).unwrap();

    transport.send(b"one", TIMEOUT, &cancel).await.unwrap();
    let first = transport.last_activity().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    transport.send(b"two", TIMEOUT, &cancel).await.unwrap();
    let second = transport.last_activity().unwrap();
    assert!(second >= first);

    // An empty write is not activity.
    transport.send(b"", TIMEOUT, &cancel).await.unwrap();
    assert_eq!(transport.last_activity(), Some(second));
}

#[tokio::test]
async fn test_unbounded_timeout_round_trip() {
    let mut harness = Harness::new(&["usb"]);
    harness.start_with(&[("A", STLINK_PORT)]).await;
    let cancel = CancellationToken::new();
    let transport = harness.controller.connect(&"A".into(), TIMEOUT, &cancel).await.unwrap();
    let mut device = harness.opener.take_device_end(STLINK_PORT).unwrap();

    let sent = transport.send(b"hi", Duration::MAX, &cancel).await.unwrap();
    assert_eq!(sent, IoOutcome::completed(2));
    let mut request = [0u8; 2];
    device.read_exact(&mut request).await.unwrap();

    device.write_all(b"yo").await.unwrap();
    let reply = transport.receive(usize::MAX, Duration::MAX, &cancel).await.unwrap();
    assert_eq!(reply, IoOutcome::completed(b"yo".to_vec()));
}

//! End-to-end tests for serial discovery.
//!
//! These tests drive a real controller through manual sources and a mock
//! port opener, covering the path from add notifications through the
//! validation sweep to byte I/O on a connected device.

pub mod discovery_tests;
pub mod lifecycle_tests;
pub mod transport_tests;

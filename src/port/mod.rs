//! Port abstraction layer for serial communication.
//!
//! Provides the [`PortOpener`] seam through which validation and transport
//! reach the platform, a tokio-serial backed implementation, and an
//! in-memory mock for tests.

pub mod async_port;
pub mod error;
pub mod mock;
pub mod traits;

pub use async_port::TokioPortOpener;
pub use error::PortError;
pub use mock::{MockDeviceProfile, MockPortOpener};
pub use traits::*;

//! Serial device discovery, validation and transport.
//!
//! This library discovers devices attached over a serial channel, probes
//! each new one to decide whether it is a supported device, and exposes a
//! cancellable, deadline-bound byte stream to the validated ones.
//!
//! # Modules
//!
//! - `device`: Device data model shared by all layers
//! - `discovery`: Discovery source contract, polling and manual sources
//! - `registry`: Candidate and logical device state with debounced removal
//! - `validator`: Identification probe and rule table
//! - `transport`: Cancellable byte-stream I/O to the connected device
//! - `controller`: Lifecycle orchestration and enumeration sweeps
//! - `port`: Port abstraction over tokio-serial with an in-memory mock
//! - `config`: Configuration management with TOML support
//! - `logging`: Tracing subscriber installation
//! - `error`: Unified error handling

pub mod config;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod port;
pub mod registry;
pub mod transport;
pub mod validator;

// Re-export commonly used types for convenience
pub use controller::{ControllerPhase, DiscoveryController, EnumerationState};
pub use device::{
    CandidateDevice, DeviceEndpoint, DeviceMetadata, DeviceSelector, DiscoveryEvent,
    LogicalDevice, PhysicalDeviceId, ValidationState,
};
pub use discovery::{
    DiscoveryError, DiscoverySource, EventSink, ManualHandle, ManualSourceFactory,
    PollingSourceFactory, SourceEvent, SourceFactory, SourceStatus,
};
pub use error::{Error, Result};
pub use port::{
    MockDeviceProfile, MockPortOpener, PortConfiguration, PortError, PortIdentity, PortOpener,
    TokioPortOpener,
};
pub use registry::{AddOutcome, DeviceRegistry, RemoveOutcome};
pub use transport::{IoOutcome, IoStatus, SerialTransport};
pub use validator::{DeviceValidator, IdentityRule, RuleTable, ValidationError};

/// Re-exported so callers can build tokens without a direct dependency.
pub use tokio_util::sync::CancellationToken;

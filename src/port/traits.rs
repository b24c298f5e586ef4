//! Core traits for serial port abstraction.
//!
//! Defines the [`PortOpener`] trait that lets both real serial ports and
//! mock implementations be opened and identified interchangeably.

use super::error::PortError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Line settings applied when a port is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfiguration {
    /// Baud rate (bits per second).
    pub baud_rate: u32,

    /// Number of data bits (5, 6, 7, or 8).
    pub data_bits: DataBits,

    /// Flow control mode.
    pub flow_control: FlowControl,

    /// Parity checking mode.
    pub parity: Parity,

    /// Number of stop bits.
    pub stop_bits: StopBits,

    /// Driver-level read/write timeout.
    pub timeout: Duration,
}

impl Default for PortConfiguration {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Flow control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Parity checking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Byte stream over an open serial channel.
pub trait SerialStreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SerialStreamIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An exclusively opened port. Dropping it closes the channel.
pub struct OpenedPort {
    name: String,
    stream: Box<dyn SerialStreamIo>,
}

impl OpenedPort {
    pub fn new(name: impl Into<String>, stream: impl SerialStreamIo + 'static) -> Self {
        Self {
            name: name.into(),
            stream: Box::new(stream),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_stream(self) -> Box<dyn SerialStreamIo> {
        self.stream
    }
}

impl std::fmt::Debug for OpenedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedPort")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Identification metadata read from the platform for an open port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortIdentity {
    pub display_name: Option<String>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
}

impl PortIdentity {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }
}

/// Platform seam for opening and identifying serial ports.
///
/// Implementations must open ports exclusively: a second `open` of the same
/// port while the first [`OpenedPort`] is alive may fail with
/// [`PortError::Busy`].
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open the named port with the given line settings.
    async fn open(
        &self,
        port_name: &str,
        config: &PortConfiguration,
    ) -> Result<OpenedPort, PortError>;

    /// Read identification metadata for the named port.
    async fn identify(&self, port_name: &str) -> Result<PortIdentity, PortError>;
}

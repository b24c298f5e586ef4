//! Async serial port implementation using tokio-serial.
//!
//! [`TokioPortOpener`] opens real serial channels with native async I/O and
//! reads identification strings from the platform's port enumeration.

use super::error::PortError;
use super::traits::{OpenedPort, PortConfiguration, PortIdentity, PortOpener};
use async_trait::async_trait;
use tracing::trace;

/// Opens ports through tokio-serial.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPortOpener;

impl TokioPortOpener {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PortOpener for TokioPortOpener {
    async fn open(
        &self,
        port_name: &str,
        config: &PortConfiguration,
    ) -> Result<OpenedPort, PortError> {
        let builder = tokio_serial::new(port_name, config.baud_rate)
            .data_bits(config.data_bits.into())
            .flow_control(config.flow_control.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .timeout(config.timeout);

        let stream = tokio_serial::SerialStream::open(&builder).map_err(|e| match e.kind {
            tokio_serial::ErrorKind::NoDevice => PortError::not_found(port_name),
            tokio_serial::ErrorKind::InvalidInput => PortError::config(e.to_string()),
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                PortError::busy(port_name)
            }
            _ => PortError::Io(std::io::Error::other(e.to_string())),
        })?;

        trace!(port = %port_name, baud = config.baud_rate, "Opened serial stream");
        Ok(OpenedPort::new(port_name, stream))
    }

    async fn identify(&self, port_name: &str) -> Result<PortIdentity, PortError> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| PortError::Io(std::io::Error::other(e)))??;

        ports
            .into_iter()
            .find(|info| info.port_name == port_name)
            .map(|info| identity_from_port_type(&info.port_type))
            .ok_or_else(|| PortError::not_found(port_name))
    }
}

/// Extract identification strings from a platform port descriptor.
///
/// Only USB ports carry descriptor strings; everything else yields an empty
/// identity.
pub fn identity_from_port_type(port_type: &serialport::SerialPortType) -> PortIdentity {
    match port_type {
        serialport::SerialPortType::UsbPort(usb) => PortIdentity {
            display_name: usb.product.clone(),
            serial_number: usb.serial_number.clone(),
            manufacturer: usb.manufacturer.clone(),
        },
        _ => PortIdentity::default(),
    }
}

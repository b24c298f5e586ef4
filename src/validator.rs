//! Device validation probe.
//!
//! A freshly seen device is opened, its identification metadata is read, and
//! the result is classified against an explicit [`IdentityRule`] table. The
//! port is always closed again before the verdict is returned: validation is
//! a probe, not a hold-open.

use crate::device::{DeviceMetadata, LogicalDevice, PhysicalDeviceId};
use crate::port::{PortConfiguration, PortError, PortIdentity, PortOpener};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One entry of the identification rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityRule {
    /// Accept when the display name equals this string.
    DisplayName(String),
    /// Accept when the serial-number token contains this substring.
    SerialTag(String),
}

impl IdentityRule {
    pub fn display_name(name: impl Into<String>) -> Self {
        Self::DisplayName(name.into())
    }

    pub fn serial_tag(tag: impl Into<String>) -> Self {
        Self::SerialTag(tag.into())
    }

    /// Label used in the device description when this rule matches.
    pub fn label_for(&self, identity: &PortIdentity) -> Option<String> {
        match self {
            Self::DisplayName(name) => identity
                .display_name
                .as_deref()
                .filter(|candidate| candidate.trim() == name)
                .map(|_| name.clone()),
            Self::SerialTag(tag) => identity
                .serial_number
                .as_deref()
                .filter(|serial| !tag.is_empty() && serial.contains(tag.as_str()))
                .map(str::to_string),
        }
    }
}

/// Ordered rule table; the first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTable {
    rules: Vec<IdentityRule>,
}

impl RuleTable {
    pub fn new(rules: Vec<IdentityRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[IdentityRule] {
        &self.rules
    }

    /// Return the description label for an accepted identity.
    pub fn classify(&self, identity: &PortIdentity) -> Option<String> {
        self.rules.iter().find_map(|rule| rule.label_for(identity))
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new(vec![
            IdentityRule::display_name("STM32 STLink"),
            IdentityRule::serial_tag("NANO_"),
        ])
    }
}

/// Reasons a probe did not accept a device.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Failed to open {port}: {source}")]
    OpenFailed {
        port: String,
        #[source]
        source: PortError,
    },

    #[error("Failed to identify {port}: {source}")]
    IdentifyFailed {
        port: String,
        #[source]
        source: PortError,
    },

    #[error("Probe of {port} timed out after {timeout:?}")]
    Timeout { port: String, timeout: Duration },

    #[error("{port} did not match any known identity")]
    Unrecognized { port: String, identity: PortIdentity },
}

impl ValidationError {
    /// True when the device answered but is not one of ours.
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Self::Unrecognized { .. })
    }
}

/// An accepted device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validated {
    /// `<name-or-tag> @ <port>`
    pub description: String,
    pub identity: PortIdentity,
}

/// Probes candidate devices and classifies them.
pub struct DeviceValidator {
    opener: Arc<dyn PortOpener>,
    rules: RuleTable,
    port_config: PortConfiguration,
    probe_timeout: Duration,
}

impl DeviceValidator {
    pub fn new(
        opener: Arc<dyn PortOpener>,
        rules: RuleTable,
        port_config: PortConfiguration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            opener,
            rules,
            port_config,
            probe_timeout,
        }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Probe one device.
    ///
    /// Open failures, identification failures and timeouts are all reported
    /// as errors; callers treat every error as a rejection.
    pub async fn validate(
        &self,
        id: &PhysicalDeviceId,
        metadata: &DeviceMetadata,
    ) -> Result<Validated, ValidationError> {
        let port = metadata.port_name.as_str();

        let probe = async {
            let opened = self
                .opener
                .open(port, &self.port_config)
                .await
                .map_err(|source| ValidationError::OpenFailed {
                    port: port.to_string(),
                    source,
                })?;
            let identity = self.opener.identify(port).await;
            drop(opened);

            identity.map_err(|source| ValidationError::IdentifyFailed {
                port: port.to_string(),
                source,
            })
        };

        // Timing out drops the probe future, which closes the port.
        let identity = tokio::time::timeout(self.probe_timeout, probe)
            .await
            .map_err(|_| ValidationError::Timeout {
                port: port.to_string(),
                timeout: self.probe_timeout,
            })??;
        let identity = merge_identity(identity, metadata);

        match self.rules.classify(&identity) {
            Some(label) => {
                let description = format!("{} @ {}", label, port);
                debug!(device = %id, %description, "Device validated");
                Ok(Validated {
                    description,
                    identity,
                })
            }
            None => {
                debug!(
                    device = %id,
                    port = %port,
                    name = ?identity.display_name,
                    serial = ?identity.serial_number,
                    "Device not recognized"
                );
                Err(ValidationError::Unrecognized {
                    port: port.to_string(),
                    identity,
                })
            }
        }
    }

    /// Probe every device in order, one at a time.
    ///
    /// Probes never overlap: each opens its port exclusively.
    pub async fn validate_batch(
        &self,
        devices: &[LogicalDevice],
    ) -> Vec<(PhysicalDeviceId, Result<Validated, ValidationError>)> {
        let mut outcomes = Vec::with_capacity(devices.len());

        for device in devices {
            let outcome = self.validate(&device.id, &device.metadata).await;
            if let Err(ref e) = outcome {
                if !e.is_unrecognized() {
                    warn!(device = %device.id, error = %e, "Validation probe failed");
                }
            }
            outcomes.push((device.id.clone(), outcome));
        }

        let accepted = outcomes.iter().filter(|(_, o)| o.is_ok()).count();
        info!(
            probed = outcomes.len(),
            accepted,
            "Validation sweep finished"
        );
        outcomes
    }
}

impl std::fmt::Debug for DeviceValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceValidator")
            .field("rules", &self.rules)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

/// Fill gaps in the probed identity from the add-notification metadata.
fn merge_identity(mut identity: PortIdentity, metadata: &DeviceMetadata) -> PortIdentity {
    if identity.display_name.is_none() {
        identity.display_name = metadata.display_name.clone();
    }
    if identity.serial_number.is_none() {
        identity.serial_number = metadata.serial_number.clone();
    }
    if identity.manufacturer.is_none() {
        identity.manufacturer = metadata.manufacturer.clone();
    }
    identity
}

//! Message Relay
//!
//! Carries frames between a device and its cloud session. Each side only
//! ever sees the key it issued or expects: devices get the gateway's local
//! key, the cloud gets its own issued key (or the device's real key before
//! one is issued).

use serde_json::Value;

use crate::domain::device::{ApiKey, DeviceId};
use crate::domain::protocol;
use crate::infrastructure::metrics::{self, Direction};
use crate::infrastructure::registry::SharedRegistry;

/// Relay failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// The device has no open cloud session.
    #[error("device {0} has no cloud link")]
    NoCloudLink(DeviceId),
    /// The device has no open local socket.
    #[error("device {0} is not online")]
    DeviceNotOnline(DeviceId),
    /// No key is known for cloud-bound traffic.
    #[error("device {0} has no apikey")]
    MissingApiKey(DeviceId),
    /// The frame is not a JSON object.
    #[error("frame is not a JSON object")]
    InvalidFrame,
}

/// Bidirectional frame relay with key substitution.
#[derive(Debug, Clone)]
pub struct MessageRelay {
    registry: SharedRegistry,
    local_apikey: ApiKey,
}

impl MessageRelay {
    /// Create a relay over the registry's links.
    #[must_use]
    pub const fn new(registry: SharedRegistry, local_apikey: ApiKey) -> Self {
        Self {
            registry,
            local_apikey,
        }
    }

    /// Key handed to devices.
    #[must_use]
    pub const fn local_apikey(&self) -> &ApiKey {
        &self.local_apikey
    }

    /// Send a device-originated frame to the cloud.
    ///
    /// # Errors
    ///
    /// `NoCloudLink` if no cloud session is open, `MissingApiKey` if neither
    /// the cloud nor the device key is known.
    pub fn forward_to_cloud(&self, device_id: &DeviceId, mut message: Value) -> Result<(), RelayError> {
        let Some(link) = self.registry.cloud_link(device_id) else {
            tracing::warn!(device_id = %device_id, "No cloud link, frame not relayed");
            return Err(RelayError::NoCloudLink(device_id.clone()));
        };
        let apikey = self
            .registry
            .read(device_id, |record| {
                record.cloud_bound_key().map(|key| key.expose().to_string())
            })
            .flatten()
            .ok_or_else(|| RelayError::MissingApiKey(device_id.clone()))?;

        if !protocol::substitute_apikey(&mut message, &apikey) {
            return Err(RelayError::InvalidFrame);
        }
        link.send_json(&message)
            .map_err(|_| RelayError::NoCloudLink(device_id.clone()))?;

        metrics::record_relay(Direction::ToCloud);
        tracing::debug!(device_id = %device_id, "Relayed frame to cloud");
        Ok(())
    }

    /// Send a frame to the device.
    ///
    /// The cached switch state follows `params.switch` when present.
    ///
    /// # Errors
    ///
    /// `DeviceNotOnline` if no local socket is open.
    pub fn forward_to_device(&self, device_id: &DeviceId, mut message: Value) -> Result<(), RelayError> {
        let Some(link) = self.registry.local_link(device_id) else {
            return Err(RelayError::DeviceNotOnline(device_id.clone()));
        };
        if !protocol::substitute_apikey(&mut message, self.local_apikey.expose()) {
            return Err(RelayError::InvalidFrame);
        }
        link.send_json(&message)
            .map_err(|_| RelayError::DeviceNotOnline(device_id.clone()))?;

        if let Some(switch) = protocol::switch_param(&message) {
            self.registry
                .update(device_id, |record| record.switch_state = switch);
        }

        metrics::record_relay(Direction::ToDevice);
        tracing::debug!(device_id = %device_id, "Relayed frame to device");
        Ok(())
    }
}

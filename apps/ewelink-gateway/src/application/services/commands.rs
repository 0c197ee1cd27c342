//! Command Service
//!
//! Operator-facing operations: switch a relay, kick a device, list and
//! inspect devices, rename a device.

use std::sync::Arc;

use serde_json::json;

use super::relay::{MessageRelay, RelayError};
use crate::application::ports::CloudSessions;
use crate::domain::device::{DeviceFilter, DeviceId, DeviceSnapshot, SwitchState};
use crate::domain::protocol;
use crate::infrastructure::events::{GatewayEvent, SharedEventBus, UpdateOrigin};
use crate::infrastructure::metrics;
use crate::infrastructure::registry::{CLOSE_NORMAL, SharedRegistry};

/// Close reason sent to kicked devices.
pub const KICK_REASON: &str = "kicked";

/// Command failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The device has never been seen.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    /// The device has no open local socket.
    #[error("device {0} is not online")]
    DeviceNotOnline(DeviceId),
    /// Only `On` and `Off` can be commanded.
    #[error("switch state must be on or off")]
    InvalidSwitchState,
    /// Alias is empty.
    #[error("alias cannot be empty")]
    EmptyAlias,
}

/// Operator command interface.
#[derive(Clone)]
pub struct CommandService {
    registry: SharedRegistry,
    relay: Arc<MessageRelay>,
    events: SharedEventBus,
    cloud: Option<Arc<dyn CloudSessions>>,
}

impl std::fmt::Debug for CommandService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandService")
            .field("cloud_sessions", &self.cloud.is_some())
            .finish_non_exhaustive()
    }
}

impl CommandService {
    /// Create a command service.
    #[must_use]
    pub fn new(registry: SharedRegistry, relay: Arc<MessageRelay>, events: SharedEventBus) -> Self {
        Self {
            registry,
            relay,
            events,
            cloud: None,
        }
    }

    /// Attach cloud session control so kicks also cancel cloud retries.
    #[must_use]
    pub fn with_cloud_sessions(mut self, cloud: Arc<dyn CloudSessions>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Switch a device's relay.
    ///
    /// # Errors
    ///
    /// `UnknownDevice` for a device never seen, `DeviceNotOnline` if it has no
    /// open local socket (nothing is sent), `InvalidSwitchState` for `Unknown`.
    pub fn switch_device(&self, device_id: &DeviceId, state: SwitchState) -> Result<(), CommandError> {
        let switch = state.as_param().ok_or(CommandError::InvalidSwitchState)?;
        if !self.registry.contains(device_id) {
            return Err(CommandError::UnknownDevice(device_id.clone()));
        }

        let frame = protocol::app_update(
            device_id.as_str(),
            self.relay.local_apikey().expose(),
            switch,
            protocol::new_sequence(),
        );
        self.relay
            .forward_to_device(device_id, frame)
            .map_err(|_| CommandError::DeviceNotOnline(device_id.clone()))?;

        self.registry
            .update(device_id, |record| record.stats.commands_sent += 1);
        metrics::record_command("switch");
        tracing::info!(device_id = %device_id, switch, "Switch command sent");

        let params = json!({ "switch": switch });
        if self.registry.cloud_link(device_id).is_some() {
            let report = protocol::device_update(device_id.as_str(), "", params.clone());
            match self.relay.forward_to_cloud(device_id, report) {
                Ok(()) | Err(RelayError::NoCloudLink(_)) => {}
                Err(e) => tracing::warn!(device_id = %device_id, error = %e, "State report to cloud failed"),
            }
        }

        self.events.publish(GatewayEvent::DeviceUpdated {
            device_id: device_id.clone(),
            params,
            origin: UpdateOrigin::Operator,
        });
        Ok(())
    }

    /// Disconnect a device from the gateway and from the cloud.
    ///
    /// # Errors
    ///
    /// `UnknownDevice` for a device never seen.
    pub fn kick_device(&self, device_id: &DeviceId) -> Result<(), CommandError> {
        if !self.registry.contains(device_id) {
            return Err(CommandError::UnknownDevice(device_id.clone()));
        }

        if let Some(local) = self.registry.local_link(device_id) {
            local.close(CLOSE_NORMAL, KICK_REASON);
        }
        match &self.cloud {
            Some(cloud) => cloud.stop(device_id),
            None => {
                if let Some(link) = self.registry.cloud_link(device_id) {
                    link.close(CLOSE_NORMAL, KICK_REASON);
                }
            }
        }

        metrics::record_command("kick");
        tracing::info!(device_id = %device_id, "Device kicked");
        Ok(())
    }

    /// Devices matching `filter`, sorted by alias.
    #[must_use]
    pub fn list_devices(&self, filter: DeviceFilter) -> Vec<DeviceSnapshot> {
        let mut devices: Vec<_> = self
            .registry
            .snapshots()
            .into_iter()
            .filter(|device| device.matches(filter))
            .collect();
        devices.sort_by(|a, b| a.alias.cmp(&b.alias).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    /// One device.
    ///
    /// # Errors
    ///
    /// `UnknownDevice` for a device never seen.
    pub fn device(&self, device_id: &DeviceId) -> Result<DeviceSnapshot, CommandError> {
        self.registry
            .snapshot(device_id)
            .ok_or_else(|| CommandError::UnknownDevice(device_id.clone()))
    }

    /// Rename a device.
    ///
    /// # Errors
    ///
    /// `UnknownDevice` for a device never seen, `EmptyAlias` for a blank name.
    pub fn set_alias(&self, device_id: &DeviceId, alias: &str) -> Result<(), CommandError> {
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(CommandError::EmptyAlias);
        }
        let changed = self
            .registry
            .update(device_id, |record| {
                let changed = record.alias != alias;
                record.alias = alias.to_string();
                changed
            })
            .ok_or_else(|| CommandError::UnknownDevice(device_id.clone()))?;

        if changed {
            self.events.publish(GatewayEvent::AliasUpdated {
                device_id: device_id.clone(),
                alias: alias.to_string(),
            });
        }
        Ok(())
    }
}

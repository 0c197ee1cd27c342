//! Dispatch Service
//!
//! Answers the device's `POST /dispatch/device` with the address of a local
//! WebSocket listener. TLS callers are sent to the modern port, plain callers
//! to the legacy port.

use std::net::IpAddr;

use crate::domain::device::{ApiKey, DeviceId};
use crate::domain::protocol::{DispatchRequest, DispatchResponse};
use crate::infrastructure::config::ServerSettings;
use crate::infrastructure::metrics::{self, Transport};
use crate::infrastructure::registry::{DispatchInfo, SharedRegistry};

/// Rejected dispatch request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Body is not a JSON dispatch request.
    #[error("malformed dispatch request: {0}")]
    Malformed(String),
    /// `deviceid` is missing or empty.
    #[error("missing deviceid")]
    MissingDeviceId,
}

/// Listener a device is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    /// Advertised host.
    pub host: String,
    /// WebSocket port.
    pub port: u16,
}

impl From<DispatchTarget> for DispatchResponse {
    fn from(target: DispatchTarget) -> Self {
        Self::ok(target.host, target.port)
    }
}

/// Dispatch request handler.
#[derive(Debug, Clone)]
pub struct DispatchService {
    registry: SharedRegistry,
    server_ip: String,
    legacy_port: u16,
    modern_ws_port: u16,
}

impl DispatchService {
    /// Create a dispatch service advertising the configured listeners.
    #[must_use]
    pub fn new(registry: SharedRegistry, settings: &ServerSettings) -> Self {
        Self {
            registry,
            server_ip: settings.server_ip.clone(),
            legacy_port: settings.legacy_port,
            modern_ws_port: settings.modern_ws_port,
        }
    }

    /// Parse a request body.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the body is not a JSON object.
    pub fn parse(body: &[u8]) -> Result<DispatchRequest, DispatchError> {
        serde_json::from_slice(body).map_err(|e| DispatchError::Malformed(e.to_string()))
    }

    /// Record the request and pick the listener for the device.
    ///
    /// # Errors
    ///
    /// Returns `MissingDeviceId` without touching the registry when
    /// `deviceid` is absent or empty.
    pub fn handle(
        &self,
        request: DispatchRequest,
        secure: bool,
        remote: IpAddr,
    ) -> Result<DispatchTarget, DispatchError> {
        let device_id = request
            .deviceid
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(DeviceId::from)
            .ok_or(DispatchError::MissingDeviceId)?;

        let apikey_preview = request.apikey.as_deref().map(|key| ApiKey::new(key).preview());
        tracing::info!(
            device_id = %device_id,
            remote = %remote,
            secure,
            apikey = apikey_preview.as_deref(),
            model = request.model.as_deref(),
            "Dispatch request"
        );

        let info = DispatchInfo {
            apikey: request.apikey,
            model: request.model,
            rom_version: request.rom_version,
        };
        self.registry.record_dispatch(&device_id, info, remote);
        metrics::record_dispatch(Transport::from_secure(secure));

        let port = if secure {
            self.modern_ws_port
        } else {
            self.legacy_port
        };
        Ok(DispatchTarget {
            host: self.server_ip.clone(),
            port,
        })
    }
}

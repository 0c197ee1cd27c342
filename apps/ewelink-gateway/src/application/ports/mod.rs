//! Port Interfaces
//!
//! Contracts between the application services and the infrastructure
//! adapters that talk to the vendor cloud.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CloudDiscovery`: Asks the vendor dispatch endpoint where a device's
//!   cloud session should connect
//! - `CloudSessions`: Stops a device's cloud session and any pending retry

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::device::DeviceId;

// =============================================================================
// Cloud Discovery
// =============================================================================

/// Device identity sent to the vendor dispatch endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryRequest {
    /// Always `"ws"`.
    pub accept: String,
    /// Protocol version.
    pub version: u32,
    /// Unix timestamp, seconds.
    pub ts: i64,
    /// Device identifier.
    pub deviceid: String,
    /// Device's real credential.
    pub apikey: String,
    /// Hardware model.
    pub model: String,
    /// Firmware version.
    #[serde(rename = "romVersion")]
    pub rom_version: String,
    /// Devices report their id here too.
    pub imei: String,
}

impl DiscoveryRequest {
    /// Build a request for a device.
    #[must_use]
    pub fn new(
        device_id: &DeviceId,
        apikey: &str,
        model: &str,
        rom_version: &str,
        version: u32,
    ) -> Self {
        Self {
            accept: "ws".to_string(),
            version,
            ts: chrono::Utc::now().timestamp(),
            deviceid: device_id.to_string(),
            apikey: apikey.to_string(),
            model: model.to_string(),
            rom_version: rom_version.to_string(),
            imei: device_id.to_string(),
        }
    }
}

/// Where a device's cloud session should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEndpoint {
    /// Host or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl CloudEndpoint {
    /// WebSocket URL for this endpoint.
    #[must_use]
    pub fn ws_url(&self, scheme: &str) -> String {
        format!("{scheme}://{}:{}/api/ws", self.host, self.port)
    }
}

/// Discovery failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// Request could not be sent or timed out.
    #[error("dispatch request failed: {0}")]
    Request(String),
    /// Non-success HTTP status.
    #[error("dispatch returned HTTP {0}")]
    Status(u16),
    /// Dispatch replied with a nonzero `error`.
    #[error("dispatch rejected device (error {0})")]
    Rejected(i64),
    /// Reply did not carry a usable endpoint.
    #[error("malformed dispatch response: {0}")]
    Malformed(String),
}

/// Vendor dispatch lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudDiscovery: Send + Sync {
    /// Resolve the cloud endpoint for a device.
    async fn discover(&self, request: &DiscoveryRequest) -> Result<CloudEndpoint, DiscoveryError>;
}

// =============================================================================
// Cloud Session Control
// =============================================================================

/// Control over running cloud sessions.
#[cfg_attr(test, mockall::automock)]
pub trait CloudSessions: Send + Sync {
    /// Close the device's cloud session and cancel any pending retry.
    fn stop(&self, device_id: &DeviceId);
}

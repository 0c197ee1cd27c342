//! Device Model
//!
//! Per-device state tracked by the gateway: identity, credentials, the two
//! connection state machines (local and cloud), and the cached switch state.
//!
//! # Design
//!
//! The three per-device dimensions are independent enums. Whether a device
//! is "online" is always computed from the local and cloud states and is
//! never stored on its own.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

// =============================================================================
// Identifiers and Credentials
// =============================================================================

/// Vendor-assigned device identifier.
///
/// Opaque string; immutable once observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A protocol credential (`apikey` field of eWeLink frames).
///
/// Redacted in `Debug` and serialized only as a short preview.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Number of leading characters shown in previews.
    const PREVIEW_LEN: usize = 8;

    /// Wrap a raw key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the raw key for use in protocol frames.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Truncated form suitable for logs.
    #[must_use]
    pub fn preview(&self) -> String {
        let head: String = self.0.chars().take(Self::PREVIEW_LEN).collect();
        format!("{head}...")
    }

    /// Whether the key is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ApiKey").field(&"[REDACTED]").finish()
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.preview())
    }
}

// =============================================================================
// State Machines
// =============================================================================

/// Connection state shared by the local and cloud state machines.
///
/// Ordered by progress: `Offline < Dispatch < WsConnected < Registered < Online`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No session.
    #[default]
    Offline,
    /// Dispatch request seen, socket not yet open.
    Dispatch,
    /// Socket open.
    WsConnected,
    /// Registration handshake completed.
    Registered,
    /// Session fully operational.
    Online,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::Dispatch => "DISPATCH",
            Self::WsConnected => "WS_CONNECTED",
            Self::Registered => "REGISTERED",
            Self::Online => "ONLINE",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    /// Relay closed.
    On,
    /// Relay open.
    Off,
    /// Not yet observed.
    #[default]
    Unknown,
}

impl SwitchState {
    /// Parse the `params.switch` protocol value.
    #[must_use]
    pub fn from_param(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    /// The `params.switch` protocol value, if known.
    #[must_use]
    pub const fn as_param(&self) -> Option<&'static str> {
        match self {
            Self::On => Some("on"),
            Self::Off => Some("off"),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_param().unwrap_or("unknown"))
    }
}

/// A device is online only when both sessions are online.
#[must_use]
pub fn is_online(local: ConnectionState, cloud: ConnectionState) -> bool {
    local == ConnectionState::Online && cloud == ConnectionState::Online
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-device protocol counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    /// Dispatch requests received.
    pub dispatch_requests: u64,
    /// Device sockets identified as this device.
    pub websocket_connections: u64,
    /// `register` frames received.
    pub register_requests: u64,
    /// `register` replies sent.
    pub register_acks: u64,
    /// `update` frames received from the device.
    pub update_requests: u64,
    /// `update` acks sent to the device.
    pub update_acks: u64,
    /// `query` frames received.
    pub query_requests: u64,
    /// `date` frames received.
    pub date_requests: u64,
    /// WebSocket pings observed.
    pub pings: u64,
    /// Frames received from the vendor cloud.
    pub cloud_messages: u64,
    /// Operator commands sent to the device.
    pub commands_sent: u64,
    /// Sockets that stayed silent past the first-message deadline.
    pub first_message_stalls: u64,
}

// =============================================================================
// Device Record
// =============================================================================

/// Default alias prefix for devices the operator has not named yet.
pub const NEW_ALIAS_PREFIX: &str = "new-";

/// Everything the gateway knows about one device.
///
/// Link handles live next to the record in the registry; the record itself
/// is plain data.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Device identifier.
    pub id: DeviceId,
    /// Human-assigned name.
    pub alias: String,
    /// Hardware model, from dispatch or registration.
    pub model: Option<String>,
    /// Firmware version, from dispatch or registration.
    pub rom_version: Option<String>,
    /// The device's real credential.
    pub apikey: Option<ApiKey>,
    /// Credential issued by the cloud at registration.
    pub cloud_apikey: Option<ApiKey>,
    /// Local session state.
    pub local_state: ConnectionState,
    /// Cloud session state.
    pub cloud_state: ConnectionState,
    /// Cached relay state.
    pub switch_state: SwitchState,
    /// Time of the last frame, ping, or dispatch from the device.
    pub last_seen: DateTime<Utc>,
    /// Time the record was created.
    pub first_seen: DateTime<Utc>,
    /// Last remote address the device used.
    pub remote_addr: Option<IpAddr>,
    /// Original `register` frame, reused for cloud registration.
    pub register_frame: Option<serde_json::Value>,
    /// Protocol counters.
    pub stats: DeviceStats,
}

impl DeviceRecord {
    /// Create a record for a newly observed device.
    #[must_use]
    pub fn new(id: DeviceId) -> Self {
        let now = Utc::now();
        Self {
            alias: format!("{NEW_ALIAS_PREFIX}{id}"),
            id,
            model: None,
            rom_version: None,
            apikey: None,
            cloud_apikey: None,
            local_state: ConnectionState::Offline,
            cloud_state: ConnectionState::Offline,
            switch_state: SwitchState::Unknown,
            last_seen: now,
            first_seen: now,
            remote_addr: None,
            register_frame: None,
            stats: DeviceStats::default(),
        }
    }

    /// Whether both sessions are online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        is_online(self.local_state, self.cloud_state)
    }

    /// Key for cloud-bound traffic: the latest cloud-issued key, falling
    /// back to the device's own key.
    #[must_use]
    pub fn cloud_bound_key(&self) -> Option<&ApiKey> {
        self.cloud_apikey.as_ref().or(self.apikey.as_ref())
    }

    /// Whether the alias is still the generated placeholder.
    #[must_use]
    pub fn has_placeholder_alias(&self) -> bool {
        self.alias.starts_with(NEW_ALIAS_PREFIX)
    }

    /// Mark activity from the device.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Owned, link-free copy of the record.
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id.clone(),
            alias: self.alias.clone(),
            model: self.model.clone(),
            rom_version: self.rom_version.clone(),
            local_state: self.local_state,
            cloud_state: self.cloud_state,
            switch_state: self.switch_state,
            is_online: self.is_online(),
            has_cloud_apikey: self.cloud_apikey.is_some(),
            last_seen: self.last_seen,
            remote_addr: self.remote_addr,
            stats: self.stats,
        }
    }
}

/// Read-only view of a device for the command interface and health output.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    /// Device identifier.
    pub id: DeviceId,
    /// Human-assigned name.
    pub alias: String,
    /// Hardware model.
    pub model: Option<String>,
    /// Firmware version.
    pub rom_version: Option<String>,
    /// Local session state.
    pub local_state: ConnectionState,
    /// Cloud session state.
    pub cloud_state: ConnectionState,
    /// Cached relay state.
    pub switch_state: SwitchState,
    /// Derived from the two session states at snapshot time.
    pub is_online: bool,
    /// Whether the cloud has issued its own key.
    pub has_cloud_apikey: bool,
    /// Time of the last activity.
    pub last_seen: DateTime<Utc>,
    /// Last remote address.
    pub remote_addr: Option<IpAddr>,
    /// Protocol counters.
    pub stats: DeviceStats,
}

impl DeviceSnapshot {
    /// Check whether this device passes a list filter.
    #[must_use]
    pub fn matches(&self, filter: DeviceFilter) -> bool {
        match filter {
            DeviceFilter::All => true,
            DeviceFilter::Online => self.is_online,
            DeviceFilter::Offline => !self.is_online,
            DeviceFilter::On => self.switch_state == SwitchState::On,
            DeviceFilter::Off => self.switch_state == SwitchState::Off,
        }
    }
}

// =============================================================================
// List Filter
// =============================================================================

/// Filter for `list_devices`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceFilter {
    /// Every known device.
    #[default]
    All,
    /// Local and cloud both online.
    Online,
    /// Anything not fully online.
    Offline,
    /// Switch cached as on.
    On,
    /// Switch cached as off.
    Off,
}

impl FromStr for DeviceFilter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            _ => Err(FilterParseError(s.to_string())),
        }
    }
}

/// Unknown list filter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device filter '{0}' (expected ONLINE | OFFLINE | ON | OFF | ALL)")]
pub struct FilterParseError(pub String);

// =============================================================================
// Tests
// =============================================================================

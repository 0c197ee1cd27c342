//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.
//! Every setting has a default matching the device firmware's expectations,
//! so an empty environment yields a working LAN gateway.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::device::ApiKey;

/// Key handed to devices in every local reply.
pub const DEFAULT_LOCAL_APIKEY: &str = "941c6e45-1111-4660-aa88-c9bd422f909d";

/// Vendor dispatch endpoint.
pub const DEFAULT_CLOUD_DISPATCH_URL: &str = "https://eu-disp.coolkit.cc/dispatch/device";

// =============================================================================
// Listener Settings
// =============================================================================

/// Listener addresses and ports.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Address advertised to devices in dispatch replies.
    pub server_ip: String,
    /// Address the listeners bind to.
    pub bind_addr: IpAddr,
    /// Plain HTTP dispatch and WebSocket port.
    pub legacy_port: u16,
    /// HTTPS dispatch and secure WebSocket port.
    pub dispatch_port: u16,
    /// Secure WebSocket port handed out to TLS dispatch clients.
    pub modern_ws_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_ip: "192.168.1.11".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            legacy_port: 8081,
            dispatch_port: 443,
            modern_ws_port: 8082,
            health_port: 9100,
        }
    }
}

/// TLS material for the secure listeners.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// PEM certificate chain. A self-signed certificate is generated when unset.
    pub cert_path: Option<PathBuf>,
    /// PEM private key.
    pub key_path: Option<PathBuf>,
}

// =============================================================================
// Local Session Settings
// =============================================================================

/// Device-facing session timing.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Key handed to devices in place of their real key.
    pub local_apikey: ApiKey,
    /// Deadline for the first frame carrying `deviceid`.
    pub identification_timeout: Duration,
    /// Silence after which a pre-identified socket is reported.
    pub first_message_timeout: Duration,
    /// Maximum gap between WebSocket pings after registration.
    pub ping_timeout: Duration,
    /// How often the ping gap is checked.
    pub ping_check_interval: Duration,
    /// How long a dispatch identifies sockets from the same address.
    pub dispatch_correlation_window: Duration,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            local_apikey: ApiKey::new(DEFAULT_LOCAL_APIKEY),
            identification_timeout: Duration::from_secs(120),
            first_message_timeout: Duration::from_secs(300),
            ping_timeout: Duration::from_secs(180),
            ping_check_interval: Duration::from_secs(300),
            dispatch_correlation_window: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Cloud Session Settings
// =============================================================================

/// Reconnection backoff for cloud sessions.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Delay before the first retry.
    pub delay_initial: Duration,
    /// Upper bound on the delay.
    pub delay_max: Duration,
    /// Delay multiplier per attempt.
    pub delay_multiplier: f64,
    /// Consecutive failures before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            delay_initial: Duration::from_secs(5),
            delay_max: Duration::from_secs(60),
            delay_multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Upstream vendor cloud settings.
#[derive(Debug, Clone)]
pub struct CloudSettings {
    /// Whether devices are relayed to the vendor cloud at all.
    pub enabled: bool,
    /// Vendor dispatch endpoint.
    pub dispatch_url: String,
    /// Scheme of the cloud WebSocket URL (`wss` or `ws`).
    pub ws_scheme: String,
    /// Dispatch request timeout.
    pub http_timeout: Duration,
    /// Deadline for the registration reply.
    pub registration_timeout: Duration,
    /// Application heartbeat period.
    pub heartbeat_interval: Duration,
    /// Reconnection backoff.
    pub reconnect: ReconnectSettings,
    /// Model reported when the device never sent one.
    pub default_model: String,
    /// Firmware version reported when the device never sent one.
    pub default_rom_version: String,
    /// Protocol version reported in synthesized registrations.
    pub protocol_version: u32,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dispatch_url: DEFAULT_CLOUD_DISPATCH_URL.to_string(),
            ws_scheme: "wss".to_string(),
            http_timeout: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            reconnect: ReconnectSettings::default(),
            default_model: "ITA-GZ1-GL".to_string(),
            default_rom_version: "3.5.0".to_string(),
            protocol_version: 8,
        }
    }
}

// =============================================================================
// Gateway Configuration
// =============================================================================

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listener settings.
    pub server: ServerSettings,
    /// TLS material.
    pub tls: TlsSettings,
    /// Device-facing session settings.
    pub local: LocalSettings,
    /// Vendor cloud settings.
    pub cloud: CloudSettings,
    /// Event bus channel capacity.
    pub event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            tls: TlsSettings::default(),
            local: LocalSettings::default(),
            cloud: CloudSettings::default(),
            event_capacity: 1024,
        }
    }
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an empty or unparseable value
    /// where that matters, or if only one of the TLS paths is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_addr = match std::env::var("GATEWAY_BIND_ADDR") {
            Ok(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidValue("GATEWAY_BIND_ADDR".to_string(), value))?,
            Err(_) => defaults.server.bind_addr,
        };

        let server = ServerSettings {
            server_ip: parse_env_string("GATEWAY_SERVER_IP", defaults.server.server_ip)?,
            bind_addr,
            legacy_port: parse_env_u16("GATEWAY_LEGACY_PORT", defaults.server.legacy_port),
            dispatch_port: parse_env_u16("GATEWAY_DISPATCH_PORT", defaults.server.dispatch_port),
            modern_ws_port: parse_env_u16("GATEWAY_MODERN_WS_PORT", defaults.server.modern_ws_port),
            health_port: parse_env_u16("GATEWAY_HEALTH_PORT", defaults.server.health_port),
        };

        let tls = TlsSettings {
            cert_path: std::env::var("GATEWAY_TLS_CERT_PATH").ok().map(PathBuf::from),
            key_path: std::env::var("GATEWAY_TLS_KEY_PATH").ok().map(PathBuf::from),
        };
        match (&tls.cert_path, &tls.key_path) {
            (Some(_), None) => {
                return Err(ConfigError::MissingEnvVar("GATEWAY_TLS_KEY_PATH".to_string()));
            }
            (None, Some(_)) => {
                return Err(ConfigError::MissingEnvVar("GATEWAY_TLS_CERT_PATH".to_string()));
            }
            _ => {}
        }

        let local_apikey = parse_env_string("GATEWAY_LOCAL_APIKEY", DEFAULT_LOCAL_APIKEY.to_string())?;

        let local = LocalSettings {
            local_apikey: ApiKey::new(local_apikey),
            identification_timeout: parse_env_duration_secs(
                "GATEWAY_IDENTIFICATION_TIMEOUT_SECS",
                defaults.local.identification_timeout,
            ),
            first_message_timeout: parse_env_duration_secs(
                "GATEWAY_FIRST_MESSAGE_TIMEOUT_SECS",
                defaults.local.first_message_timeout,
            ),
            ping_timeout: parse_env_duration_secs(
                "GATEWAY_PING_TIMEOUT_SECS",
                defaults.local.ping_timeout,
            ),
            ping_check_interval: parse_env_duration_secs(
                "GATEWAY_PING_CHECK_INTERVAL_SECS",
                defaults.local.ping_check_interval,
            ),
            dispatch_correlation_window: parse_env_duration_secs(
                "GATEWAY_DISPATCH_CORRELATION_SECS",
                defaults.local.dispatch_correlation_window,
            ),
        };

        let reconnect = ReconnectSettings {
            delay_initial: parse_env_duration_secs(
                "GATEWAY_RECONNECT_DELAY_INITIAL_SECS",
                defaults.cloud.reconnect.delay_initial,
            ),
            delay_max: parse_env_duration_secs(
                "GATEWAY_RECONNECT_DELAY_MAX_SECS",
                defaults.cloud.reconnect.delay_max,
            ),
            delay_multiplier: defaults.cloud.reconnect.delay_multiplier,
            max_attempts: parse_env_u32(
                "GATEWAY_MAX_RECONNECT_ATTEMPTS",
                defaults.cloud.reconnect.max_attempts,
            ),
        };

        let cloud = CloudSettings {
            enabled: parse_env_bool("GATEWAY_CLOUD_ENABLED", defaults.cloud.enabled),
            dispatch_url: parse_env_string("GATEWAY_CLOUD_DISPATCH_URL", defaults.cloud.dispatch_url)?,
            ws_scheme: parse_env_string("GATEWAY_CLOUD_WS_SCHEME", defaults.cloud.ws_scheme)?,
            http_timeout: parse_env_duration_secs(
                "GATEWAY_CLOUD_HTTP_TIMEOUT_SECS",
                defaults.cloud.http_timeout,
            ),
            registration_timeout: parse_env_duration_secs(
                "GATEWAY_CLOUD_REGISTRATION_TIMEOUT_SECS",
                defaults.cloud.registration_timeout,
            ),
            heartbeat_interval: parse_env_duration_secs(
                "GATEWAY_CLOUD_HEARTBEAT_INTERVAL_SECS",
                defaults.cloud.heartbeat_interval,
            ),
            reconnect,
            default_model: parse_env_string("GATEWAY_DEFAULT_MODEL", defaults.cloud.default_model)?,
            default_rom_version: parse_env_string(
                "GATEWAY_DEFAULT_ROM_VERSION",
                defaults.cloud.default_rom_version,
            )?,
            protocol_version: parse_env_u32(
                "GATEWAY_PROTOCOL_VERSION",
                defaults.cloud.protocol_version,
            ),
        };

        Ok(Self {
            server,
            tls,
            local,
            cloud,
            event_capacity: parse_env_usize("GATEWAY_EVENT_CAPACITY", defaults.event_capacity),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {0} has invalid value '{1}'")]
    InvalidValue(String, String),
}

fn parse_env_string(key: &str, default: String) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

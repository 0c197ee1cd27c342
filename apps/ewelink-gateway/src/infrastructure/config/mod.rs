//! Configuration Module
//!
//! Configuration loading for the gateway.

mod settings;

pub use settings::{
    CloudSettings, ConfigError, DEFAULT_CLOUD_DISPATCH_URL, DEFAULT_LOCAL_APIKEY, GatewayConfig,
    LocalSettings, ReconnectSettings, ServerSettings, TlsSettings,
};

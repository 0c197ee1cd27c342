#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! eWeLink Gateway - Local Cloud for Sonoff Devices
//!
//! Stands in for the vendor cloud on the LAN: devices dispatch to the
//! gateway and hold their WebSocket session with it, so they can be switched
//! locally. Each registered device is mirrored to the real vendor cloud, so
//! the vendor app keeps working.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Device model and protocol frames
//!   - `device`: Identity, keys, state machines, snapshots
//!   - `protocol`: eWeLink JSON frame builders and classifiers
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Vendor dispatch lookup, cloud session control
//!   - `services`: Message relay, operator commands
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `registry`: Device records and live links
//!   - `events`: Lifecycle event bus
//!   - `local`: Dispatch endpoint and device WebSocket sessions
//!   - `cloud`: Vendor dispatch client, cloud sessions, retry cycles
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Device ──dispatch──► Local listeners ──► Registry ◄── CommandService
//!    ▲                      │                 │
//!    └──── /api/ws ─────────┘            EventBus
//!                                             │
//!                           Cloud manager ◄───┘ ──► Vendor cloud (wss)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Device model and protocol frames with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::device::{
    ApiKey, ConnectionState, DeviceFilter, DeviceId, DeviceSnapshot, DeviceStats, SwitchState,
};

// Application services
pub use application::ports::{CloudDiscovery, CloudEndpoint, DiscoveryError, DiscoveryRequest};
pub use application::services::{CommandError, CommandService, MessageRelay, RelayError};

// Infrastructure config
pub use infrastructure::config::{
    CloudSettings, ConfigError, GatewayConfig, LocalSettings, ReconnectSettings, ServerSettings,
    TlsSettings,
};

// Registry and events
pub use infrastructure::events::{EventBus, GatewayEvent, SharedEventBus, UpdateOrigin};
pub use infrastructure::registry::{DeviceRegistry, RegistryCounts, SharedRegistry};

// Device-facing listeners
pub use infrastructure::local::{
    DispatchService, ListenerAddrs, LocalListeners, LocalServerState, ServerError, ServerTls,
    TlsError,
};

// Cloud sessions
pub use infrastructure::cloud::{
    CloudConnectionManager, CloudServices, HttpCloudDiscovery, insecure_client_config,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};

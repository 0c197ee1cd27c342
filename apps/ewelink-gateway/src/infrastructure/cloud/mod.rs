//! Cloud-Facing Side
//!
//! Mirrors each registered device to the vendor cloud: dispatch lookup,
//! the WebSocket session with its heartbeat, and the per-device retry cycle.

mod discovery;
mod heartbeat;
mod manager;
mod reconnect;
mod session;
mod tls;

pub use discovery::{HttpCloudDiscovery, parse_dispatch_reply};
pub use heartbeat::CloudHeartbeat;
pub use manager::{
    CloudConnectionManager, DROPPED_BEFORE_REGISTRATION_REASON, MAX_RECONNECT_REASON,
};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use session::{
    CloudServices, CloudSession, CloudSessionError, REGISTRATION_TIMEOUT_REASON, SessionOutcome,
};
pub use tls::insecure_client_config;

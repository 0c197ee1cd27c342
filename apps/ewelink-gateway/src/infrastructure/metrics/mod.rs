//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Dispatch**: Device discovery requests by transport
//! - **Local**: Device sockets, frames, evictions and closes
//! - **Cloud**: Upstream sessions, registrations and reconnects
//! - **Relay**: Frames carried between the two sides
//! - **Commands**: Operator commands
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Dispatch
    describe_counter!(
        "ewelink_gateway_dispatch_requests_total",
        "Total device dispatch requests by transport"
    );

    // Local sockets
    describe_gauge!(
        "ewelink_gateway_local_connections",
        "Number of open device sockets"
    );
    describe_counter!(
        "ewelink_gateway_local_frames_total",
        "Total frames received from devices by action"
    );
    describe_counter!(
        "ewelink_gateway_duplicate_evictions_total",
        "Total device sockets replaced by a newer connection"
    );
    describe_counter!(
        "ewelink_gateway_local_closes_total",
        "Total device socket closes by reason"
    );
    describe_counter!(
        "ewelink_gateway_first_message_stalls_total",
        "Total device sockets silent past the first-message deadline"
    );

    // Cloud sessions
    describe_gauge!(
        "ewelink_gateway_cloud_connections",
        "Number of open cloud sessions"
    );
    describe_counter!(
        "ewelink_gateway_cloud_registrations_total",
        "Total cloud registration outcomes"
    );
    describe_counter!(
        "ewelink_gateway_cloud_reconnects_total",
        "Total cloud reconnection attempts"
    );

    // Relay and commands
    describe_counter!(
        "ewelink_gateway_relay_messages_total",
        "Total frames relayed by direction"
    );
    describe_counter!(
        "ewelink_gateway_commands_total",
        "Total operator commands by type"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Transport a dispatch request arrived on.
#[derive(Debug, Clone, Copy)]
pub enum Transport {
    /// Plain HTTP.
    Plain,
    /// HTTPS.
    Tls,
}

impl Transport {
    /// Label for a request's transport.
    #[must_use]
    pub const fn from_secure(secure: bool) -> Self {
        if secure { Self::Tls } else { Self::Plain }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Tls => "tls",
        }
    }
}

/// Relay direction.
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    /// Device to cloud.
    ToCloud,
    /// Cloud or operator to device.
    ToDevice,
}

impl Direction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ToCloud => "to_cloud",
            Self::ToDevice => "to_device",
        }
    }
}

/// Cloud registration outcome.
#[derive(Debug, Clone, Copy)]
pub enum RegistrationOutcome {
    /// Registration accepted.
    Accepted,
    /// Cloud replied with an error.
    Rejected,
    /// No reply before the deadline.
    TimedOut,
}

impl RegistrationOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a device dispatch request.
pub fn record_dispatch(transport: Transport) {
    counter!(
        "ewelink_gateway_dispatch_requests_total",
        "transport" => transport.as_str()
    )
    .increment(1);
}

/// Adjust the open device socket gauge.
pub fn adjust_local_connections(delta: f64) {
    gauge!("ewelink_gateway_local_connections").increment(delta);
}

/// Record a frame received from a device.
pub fn record_local_frame(action: &str) {
    counter!(
        "ewelink_gateway_local_frames_total",
        "action" => action.to_string()
    )
    .increment(1);
}

/// Record a device socket replaced by a newer one.
pub fn record_duplicate_eviction() {
    counter!("ewelink_gateway_duplicate_evictions_total").increment(1);
}

/// Record a device socket close.
pub fn record_local_close(reason: &str) {
    counter!(
        "ewelink_gateway_local_closes_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a device socket that stayed silent.
pub fn record_first_message_stall() {
    counter!("ewelink_gateway_first_message_stalls_total").increment(1);
}

/// Adjust the open cloud session gauge.
pub fn adjust_cloud_connections(delta: f64) {
    gauge!("ewelink_gateway_cloud_connections").increment(delta);
}

/// Record a cloud registration outcome.
pub fn record_cloud_registration(outcome: RegistrationOutcome) {
    counter!(
        "ewelink_gateway_cloud_registrations_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a cloud reconnection attempt.
pub fn record_cloud_reconnect() {
    counter!("ewelink_gateway_cloud_reconnects_total").increment(1);
}

/// Record a relayed frame.
pub fn record_relay(direction: Direction) {
    counter!(
        "ewelink_gateway_relay_messages_total",
        "direction" => direction.as_str()
    )
    .increment(1);
}

/// Record an operator command.
pub fn record_command(command: &'static str) {
    counter!(
        "ewelink_gateway_commands_total",
        "command" => command
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

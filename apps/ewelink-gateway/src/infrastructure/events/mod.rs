//! Event Bus
//!
//! Process-wide publish/subscribe channel for device and cloud lifecycle
//! events, built on a tokio broadcast channel.
//!
//! # Architecture
//!
//! One `EventBus` instance is created at startup and shared behind an `Arc`.
//! Publishers never block: with no subscribers an event is dropped, and a
//! subscriber that falls behind sees `RecvError::Lagged` and skips ahead.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::domain::device::DeviceId;

// =============================================================================
// Events
// =============================================================================

/// Side that produced a state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOrigin {
    /// Reported by the device itself.
    Device,
    /// Command from the vendor app via the cloud.
    Cloud,
    /// Command from the local operator.
    Operator,
}

/// Lifecycle event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum GatewayEvent {
    /// A device socket was identified.
    #[serde(rename = "device:connected")]
    DeviceConnected {
        /// Device identifier.
        device_id: DeviceId,
        /// Remote address of the socket.
        remote_addr: IpAddr,
        /// Whether the socket arrived over TLS.
        secure: bool,
    },
    /// A device completed the local registration handshake.
    #[serde(rename = "device:registered")]
    DeviceRegistered {
        /// Device identifier.
        device_id: DeviceId,
    },
    /// A switch state change was observed or commanded.
    #[serde(rename = "device:updated")]
    DeviceUpdated {
        /// Device identifier.
        device_id: DeviceId,
        /// The frame's `params` object.
        params: Value,
        /// Who produced the change.
        origin: UpdateOrigin,
    },
    /// The active local link of a device closed.
    #[serde(rename = "device:disconnected")]
    DeviceDisconnected {
        /// Device identifier.
        device_id: DeviceId,
        /// Close reason.
        reason: String,
    },
    /// The device alias changed.
    #[serde(rename = "device:alias-updated")]
    AliasUpdated {
        /// Device identifier.
        device_id: DeviceId,
        /// New alias.
        alias: String,
    },
    /// The cloud accepted the device registration.
    #[serde(rename = "cloudConnectionEstablished")]
    CloudConnectionEstablished {
        /// Device identifier.
        device_id: DeviceId,
    },
    /// Cloud discovery, registration or reconnection failed.
    #[serde(rename = "cloudConnectionFailed")]
    CloudConnectionFailed {
        /// Device identifier.
        device_id: DeviceId,
        /// Failure reason.
        reason: String,
    },
    /// The cloud link of a device closed.
    #[serde(rename = "cloudConnectionClosed")]
    CloudConnectionClosed {
        /// Device identifier.
        device_id: DeviceId,
    },
}

impl GatewayEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DeviceConnected { .. } => "device:connected",
            Self::DeviceRegistered { .. } => "device:registered",
            Self::DeviceUpdated { .. } => "device:updated",
            Self::DeviceDisconnected { .. } => "device:disconnected",
            Self::AliasUpdated { .. } => "device:alias-updated",
            Self::CloudConnectionEstablished { .. } => "cloudConnectionEstablished",
            Self::CloudConnectionFailed { .. } => "cloudConnectionFailed",
            Self::CloudConnectionClosed { .. } => "cloudConnectionClosed",
        }
    }

    /// Device the event concerns.
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        match self {
            Self::DeviceConnected { device_id, .. }
            | Self::DeviceRegistered { device_id }
            | Self::DeviceUpdated { device_id, .. }
            | Self::DeviceDisconnected { device_id, .. }
            | Self::AliasUpdated { device_id, .. }
            | Self::CloudConnectionEstablished { device_id }
            | Self::CloudConnectionFailed { device_id, .. }
            | Self::CloudConnectionClosed { device_id } => device_id,
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Broadcast hub for `GatewayEvent`s.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    /// Create a bus with the default capacity.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers, or `None` if nobody is listening.
    pub fn publish(&self, event: GatewayEvent) -> Option<usize> {
        tracing::debug!(event = event.name(), device_id = %event.device_id(), "Publishing event");
        self.tx.send(event).ok()
    }

    /// Get a new receiver. It only sees events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Shared event bus reference.
pub type SharedEventBus = Arc<EventBus>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(id: &str) -> GatewayEvent {
        GatewayEvent::DeviceRegistered {
            device_id: DeviceId::from(id),
        }
    }

    #[test]
    fn publish_without_receivers_returns_none() {
        let bus = EventBus::with_defaults();
        assert!(bus.publish(registered("1000abcdef")).is_none());
    }

    #[test]
    fn receiver_count_tracks_subscriptions() {
        let bus = EventBus::with_defaults();
        {
            let _rx1 = bus.subscribe();
            let _rx2 = bus.subscribe();
            assert_eq!(bus.receiver_count(), 2);
        }
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::with_defaults();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(registered("1000abcdef")), Some(2));

        assert_eq!(rx1.recv().await.unwrap(), registered("1000abcdef"));
        assert_eq!(rx2.recv().await.unwrap(), registered("1000abcdef"));
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..4 {
            let _ = bus.publish(registered(&format!("dev{i}")));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(rx.recv().await.unwrap(), registered("dev2"));
    }

    #[test]
    fn event_names_and_serialization() {
        let event = GatewayEvent::CloudConnectionFailed {
            device_id: DeviceId::from("1000abcdef"),
            reason: "max reconnect attempts".to_string(),
        };
        assert_eq!(event.name(), "cloudConnectionFailed");
        assert_eq!(event.device_id().as_str(), "1000abcdef");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "cloudConnectionFailed");
        assert_eq!(json["device_id"], "1000abcdef");

        let alias = GatewayEvent::AliasUpdated {
            device_id: DeviceId::from("1000abcdef"),
            alias: "Kitchen".to_string(),
        };
        assert_eq!(alias.name(), "device:alias-updated");
    }
}

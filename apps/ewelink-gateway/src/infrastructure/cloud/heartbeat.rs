//! Cloud Heartbeat
//!
//! Keeps a registered cloud session alive with periodic `query` frames. The
//! heartbeat runs under the session's context and stops with it.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::domain::device::DeviceId;
use crate::domain::protocol;
use crate::infrastructure::registry::{LinkHandle, SharedRegistry};

/// Periodic application heartbeat for one cloud session.
#[derive(Debug, Clone)]
pub struct CloudHeartbeat {
    registry: SharedRegistry,
    device_id: DeviceId,
    link: LinkHandle,
    period: Duration,
}

impl CloudHeartbeat {
    /// Create a heartbeat for a cloud link.
    #[must_use]
    pub const fn new(
        registry: SharedRegistry,
        device_id: DeviceId,
        link: LinkHandle,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            device_id,
            link,
            period,
        }
    }

    /// Spawn the heartbeat loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Send a heartbeat every period until the link's context is cancelled
    /// or the link stops taking frames.
    pub async fn run(self) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.link.context().timers().cancelled() => {
                    tracing::debug!(device_id = %self.device_id, "Cloud heartbeat cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.beat() {
                        break;
                    }
                }
            }
        }
    }

    fn beat(&self) -> bool {
        let apikey = self
            .registry
            .read(&self.device_id, |record| {
                record.cloud_bound_key().map(|key| key.expose().to_string())
            })
            .flatten();
        let Some(apikey) = apikey else {
            tracing::debug!(device_id = %self.device_id, "No key for cloud heartbeat");
            return true;
        };

        let frame = protocol::cloud_heartbeat(self.device_id.as_str(), &apikey);
        if self.link.send_json(&frame).is_err() {
            tracing::debug!(device_id = %self.device_id, "Cloud link closed, heartbeat stopped");
            return false;
        }
        tracing::trace!(device_id = %self.device_id, "Cloud heartbeat sent");
        true
    }
}

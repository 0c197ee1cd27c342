//! Cloud Connection Manager
//!
//! Listens on the event bus and keeps one cloud session cycle per device:
//! a registered device gets a session, a disconnected one loses it. A cycle
//! retries dropped sessions with backoff, but only once the cloud has
//! accepted the device in that cycle and only while the device is still
//! online locally.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::session::{CloudServices, CloudSession, SessionOutcome};
use crate::application::ports::CloudSessions;
use crate::domain::device::{ConnectionState, DeviceId};
use crate::infrastructure::events::GatewayEvent;
use crate::infrastructure::metrics;
use crate::infrastructure::registry::CLOSE_NORMAL;

/// Failure reason once the retry budget is spent.
pub const MAX_RECONNECT_REASON: &str = "max reconnect attempts";

/// Failure reason when the first session drops before the cloud answers.
pub const DROPPED_BEFORE_REGISTRATION_REASON: &str = "closed before registration";

const DEVICE_GONE_REASON: &str = "device disconnected";

#[derive(Debug)]
struct Cycle {
    id: u64,
    cancel: CancellationToken,
}

/// Owns the cloud session cycles of all devices.
#[derive(Debug)]
pub struct CloudConnectionManager {
    services: CloudServices,
    cycles: Mutex<HashMap<DeviceId, Cycle>>,
    next_cycle: AtomicU64,
    shutdown: CancellationToken,
}

impl CloudConnectionManager {
    /// Create a manager. Cycles are cancelled with `shutdown`.
    #[must_use]
    pub fn new(services: CloudServices, shutdown: CancellationToken) -> Self {
        Self {
            services,
            cycles: Mutex::new(HashMap::new()),
            next_cycle: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Subscribe to the event bus and spawn the event loop.
    ///
    /// The subscription is taken before this returns, so events published
    /// afterwards are never missed.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.services.events.subscribe();
        tokio::spawn(Arc::clone(self).run(events))
    }

    async fn run(self: Arc<Self>, mut events: broadcast::Receiver<GatewayEvent>) {
        tracing::info!(enabled = self.services.settings.enabled, "Cloud connection manager started");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(GatewayEvent::DeviceRegistered { device_id }) => self.connect(&device_id),
                    Ok(GatewayEvent::DeviceDisconnected { device_id, .. }) => self.disconnect(&device_id),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Cloud manager lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        for (_, cycle) in self.cycles.lock().drain() {
            cycle.cancel.cancel();
        }
        tracing::info!("Cloud connection manager stopped");
    }

    /// Start a session cycle for a device unless one is already running.
    pub fn connect(self: &Arc<Self>, device_id: &DeviceId) {
        if !self.services.settings.enabled {
            return;
        }
        if self.services.registry.cloud_link(device_id).is_some() {
            tracing::debug!(device_id = %device_id, "Cloud link already open");
            return;
        }

        let cycle_id = self.next_cycle.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        {
            let mut cycles = self.cycles.lock();
            if cycles
                .get(device_id)
                .is_some_and(|cycle| !cycle.cancel.is_cancelled())
            {
                tracing::debug!(device_id = %device_id, "Cloud cycle already running");
                return;
            }
            cycles.insert(
                device_id.clone(),
                Cycle {
                    id: cycle_id,
                    cancel: cancel.clone(),
                },
            );
        }

        tracing::info!(device_id = %device_id, cycle = cycle_id, "Starting cloud session cycle");
        tokio::spawn(Arc::clone(self).run_cycle(device_id.clone(), cycle_id, cancel));
    }

    /// Cancel the device's cycle and close its cloud link.
    pub fn disconnect(&self, device_id: &DeviceId) {
        if let Some(cycle) = self.cycles.lock().remove(device_id) {
            cycle.cancel.cancel();
            tracing::debug!(device_id = %device_id, cycle = cycle.id, "Cloud cycle cancelled");
        }
        if let Some(link) = self.services.registry.cloud_link(device_id) {
            link.close(CLOSE_NORMAL, DEVICE_GONE_REASON);
        }
    }

    /// Number of running cycles.
    #[must_use]
    pub fn active_cycles(&self) -> usize {
        self.cycles.lock().len()
    }

    async fn run_cycle(self: Arc<Self>, device_id: DeviceId, cycle_id: u64, cancel: CancellationToken) {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::from_settings(
            &self.services.settings.reconnect,
        ));
        let mut registered_in_cycle = false;

        loop {
            let outcome = CloudSession::new(&self.services, &device_id, &cancel).run().await;
            match outcome {
                SessionOutcome::Cancelled | SessionOutcome::ClosedByRequest => break,
                SessionOutcome::Dropped { registered: true } => {
                    policy.reset();
                    registered_in_cycle = true;
                }
                SessionOutcome::Failed(e) if !registered_in_cycle => {
                    tracing::warn!(device_id = %device_id, error = %e, "Cloud connection failed");
                    self.fail(&device_id, &e.to_string());
                    break;
                }
                SessionOutcome::Dropped { registered: false } if !registered_in_cycle => {
                    tracing::warn!(device_id = %device_id, "Cloud session dropped before registration");
                    self.fail(&device_id, DROPPED_BEFORE_REGISTRATION_REASON);
                    break;
                }
                SessionOutcome::RegistrationRejected | SessionOutcome::RegistrationTimedOut
                    if !registered_in_cycle =>
                {
                    break;
                }
                SessionOutcome::Failed(e) => {
                    tracing::warn!(device_id = %device_id, error = %e, "Cloud reconnect failed");
                }
                SessionOutcome::RegistrationRejected
                | SessionOutcome::RegistrationTimedOut
                | SessionOutcome::Dropped { registered: false } => {}
            }

            if cancel.is_cancelled() || !self.should_retry(&device_id) {
                break;
            }
            let Some(delay) = policy.next_delay() else {
                tracing::error!(
                    device_id = %device_id,
                    attempts = policy.attempt_count(),
                    "Cloud reconnect attempts exhausted"
                );
                self.fail(&device_id, MAX_RECONNECT_REASON);
                break;
            };

            metrics::record_cloud_reconnect();
            tracing::info!(
                device_id = %device_id,
                attempt = policy.attempt_count(),
                delay_ms = delay.as_millis(),
                "Reconnecting to cloud"
            );
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            if !self.should_retry(&device_id) {
                break;
            }
        }

        self.finish_cycle(&device_id, cycle_id);
    }

    /// A retry is worth it while the device is online locally and no other
    /// cloud link has appeared.
    fn should_retry(&self, device_id: &DeviceId) -> bool {
        let registry = &self.services.registry;
        let locally_online = registry
            .read(device_id, |record| record.local_state == ConnectionState::Online)
            .unwrap_or(false);
        locally_online && registry.cloud_link(device_id).is_none()
    }

    fn fail(&self, device_id: &DeviceId, reason: &str) {
        self.services
            .registry
            .set_cloud_state(device_id, ConnectionState::Offline);
        self.services
            .events
            .publish(GatewayEvent::CloudConnectionFailed {
                device_id: device_id.clone(),
                reason: reason.to_string(),
            });
    }

    fn finish_cycle(&self, device_id: &DeviceId, cycle_id: u64) {
        let mut cycles = self.cycles.lock();
        if cycles.get(device_id).is_some_and(|cycle| cycle.id == cycle_id) {
            cycles.remove(device_id);
        }
    }
}

impl CloudSessions for CloudConnectionManager {
    fn stop(&self, device_id: &DeviceId) {
        self.disconnect(device_id);
    }
}

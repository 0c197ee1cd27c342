//! Device Registry
//!
//! Authoritative in-memory store of device records and their live links.
//!
//! # Concurrency
//!
//! All state sits behind `parking_lot::RwLock`s and no lock is ever held
//! across an `.await`. Link replacement happens entirely inside one write
//! lock, so at most one active local link and one active cloud link exist per
//! device at any moment.
//!
//! Readers only ever get `DeviceSnapshot`s; link handles are returned as
//! clones for sending.

mod context;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

pub use context::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_POLICY, ConnectionContext, LinkClosed, LinkHandle,
    Outbound,
};

use crate::domain::device::{ApiKey, ConnectionState, DeviceId, DeviceRecord, DeviceSnapshot};
use crate::infrastructure::metrics;

/// Close reason sent to a socket superseded by a newer one.
pub const REPLACED_REASON: &str = "replaced";

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug)]
struct DeviceEntry {
    record: DeviceRecord,
    local: Option<LinkHandle>,
    cloud: Option<LinkHandle>,
}

impl DeviceEntry {
    fn new(id: DeviceId) -> Self {
        Self {
            record: DeviceRecord::new(id),
            local: None,
            cloud: None,
        }
    }
}

/// Metadata carried by a dispatch request.
#[derive(Debug, Clone, Default)]
pub struct DispatchInfo {
    /// Device credential.
    pub apikey: Option<String>,
    /// Hardware model.
    pub model: Option<String>,
    /// Firmware version.
    pub rom_version: Option<String>,
}

/// Device counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    /// Known devices.
    pub total: usize,
    /// Devices with local state `Online`.
    pub local_online: usize,
    /// Devices with cloud state `Online`.
    pub cloud_online: usize,
    /// Devices online on both sides.
    pub online: usize,
    /// Open local links.
    pub local_links: usize,
    /// Open cloud links.
    pub cloud_links: usize,
}

// =============================================================================
// Registry
// =============================================================================

/// In-memory device registry.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
    by_addr: RwLock<HashMap<IpAddr, (DeviceId, Instant)>>,
}

/// Shared registry reference.
pub type SharedRegistry = Arc<DeviceRegistry>;

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Record a dispatch request.
    ///
    /// Creates the device if unknown, stores the metadata, and sets the local
    /// state to `Dispatch` unless a socket is already live. The remote address
    /// is remembered for socket correlation.
    pub fn record_dispatch(
        &self,
        id: &DeviceId,
        info: DispatchInfo,
        remote: IpAddr,
    ) -> DeviceSnapshot {
        let snapshot = {
            let mut devices = self.devices.write();
            let entry = devices
                .entry(id.clone())
                .or_insert_with(|| DeviceEntry::new(id.clone()));
            let record = &mut entry.record;
            if let Some(apikey) = info.apikey.filter(|key| !key.is_empty()) {
                record.apikey = Some(ApiKey::new(apikey));
            }
            if info.model.is_some() {
                record.model = info.model;
            }
            if info.rom_version.is_some() {
                record.rom_version = info.rom_version;
            }
            if entry.local.as_ref().is_none_or(|link| !link.is_open()) {
                record.local_state = ConnectionState::Dispatch;
            }
            record.remote_addr = Some(remote);
            record.stats.dispatch_requests += 1;
            record.touch();
            record.snapshot()
        };

        self.by_addr
            .write()
            .insert(remote, (id.clone(), Instant::now()));
        snapshot
    }

    /// Device that dispatched from `remote` within `window`, if any.
    #[must_use]
    pub fn correlate(&self, remote: IpAddr, window: Duration) -> Option<DeviceId> {
        self.by_addr
            .read()
            .get(&remote)
            .filter(|(_, at)| at.elapsed() <= window)
            .map(|(id, _)| id.clone())
    }

    /// Create the device if unknown. Returns `true` if it was created.
    pub fn ensure(&self, id: &DeviceId) -> bool {
        let mut devices = self.devices.write();
        if devices.contains_key(id) {
            return false;
        }
        devices.insert(id.clone(), DeviceEntry::new(id.clone()));
        true
    }

    /// Whether the device is known.
    #[must_use]
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.read().contains_key(id)
    }

    /// Mutate a record in place. Returns `None` if the device is unknown.
    pub fn update<R>(&self, id: &DeviceId, f: impl FnOnce(&mut DeviceRecord) -> R) -> Option<R> {
        self.devices
            .write()
            .get_mut(id)
            .map(|entry| f(&mut entry.record))
    }

    /// Read a record. Returns `None` if the device is unknown.
    pub fn read<R>(&self, id: &DeviceId, f: impl FnOnce(&DeviceRecord) -> R) -> Option<R> {
        self.devices.read().get(id).map(|entry| f(&entry.record))
    }

    /// Snapshot of one device.
    #[must_use]
    pub fn snapshot(&self, id: &DeviceId) -> Option<DeviceSnapshot> {
        self.read(id, DeviceRecord::snapshot)
    }

    /// Snapshots of every device, in no particular order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices
            .read()
            .values()
            .map(|entry| entry.record.snapshot())
            .collect()
    }

    /// Set the local state.
    pub fn set_local_state(&self, id: &DeviceId, state: ConnectionState) {
        self.update(id, |record| record.local_state = state);
    }

    /// Set the cloud state.
    pub fn set_cloud_state(&self, id: &DeviceId, state: ConnectionState) {
        self.update(id, |record| record.cloud_state = state);
    }

    /// Set the local state to `Offline` if no local link is live.
    pub fn mark_offline_if_unlinked(&self, id: &DeviceId) {
        let mut devices = self.devices.write();
        if let Some(entry) = devices.get_mut(id) {
            if entry.local.as_ref().is_none_or(|link| !link.is_open()) {
                entry.record.local_state = ConnectionState::Offline;
            }
        }
    }

    // =========================================================================
    // Local Links
    // =========================================================================

    /// Make `link` the device's local link (atomic replace-and-close).
    ///
    /// Any previous link is deactivated, its timers are cancelled, and it is
    /// asked to close with 1001 before the new link is stored. Creates the
    /// device if unknown and raises the local state to `WsConnected`.
    ///
    /// Returns the connection id of the replaced link, if any.
    pub fn claim_local(&self, id: &DeviceId, link: LinkHandle, remote: IpAddr) -> Option<u64> {
        let mut devices = self.devices.write();
        let entry = devices
            .entry(id.clone())
            .or_insert_with(|| DeviceEntry::new(id.clone()));

        let replaced = entry.local.take().and_then(|old| {
            if old.id() == link.id() {
                return None;
            }
            let was_active = old.context().deactivate();
            old.close(CLOSE_GOING_AWAY, REPLACED_REASON);
            was_active.then_some(old.id())
        });
        if replaced.is_some() {
            metrics::record_duplicate_eviction();
            tracing::info!(device_id = %id, new_conn = link.id(), "Replaced previous device socket");
        }

        entry.local = Some(link);
        let record = &mut entry.record;
        if record.local_state < ConnectionState::WsConnected {
            record.local_state = ConnectionState::WsConnected;
        }
        record.remote_addr = Some(remote);
        record.stats.websocket_connections += 1;
        record.touch();
        replaced
    }

    /// Clear the local link if it is still `ctx_id`, and mark the device
    /// `Offline`.
    ///
    /// Returns `false` for a superseded context; the registry is untouched.
    pub fn release_local(&self, id: &DeviceId, ctx_id: u64) -> bool {
        let mut devices = self.devices.write();
        let Some(entry) = devices.get_mut(id) else {
            return false;
        };
        if entry.local.as_ref().map(LinkHandle::id) != Some(ctx_id) {
            return false;
        }
        entry.local = None;
        entry.record.local_state = ConnectionState::Offline;
        true
    }

    /// Live local link, if open.
    #[must_use]
    pub fn local_link(&self, id: &DeviceId) -> Option<LinkHandle> {
        self.devices
            .read()
            .get(id)
            .and_then(|entry| entry.local.clone())
            .filter(LinkHandle::is_open)
    }

    /// Whether `ctx_id` is the device's current local link.
    #[must_use]
    pub fn is_current_local(&self, id: &DeviceId, ctx_id: u64) -> bool {
        self.devices
            .read()
            .get(id)
            .and_then(|entry| entry.local.as_ref())
            .is_some_and(|link| link.id() == ctx_id)
    }

    // =========================================================================
    // Cloud Links
    // =========================================================================

    /// Make `link` the device's cloud link, closing any previous one.
    ///
    /// Returns the connection id of the replaced link, if any.
    pub fn claim_cloud(&self, id: &DeviceId, link: LinkHandle) -> Option<u64> {
        let mut devices = self.devices.write();
        let entry = devices
            .entry(id.clone())
            .or_insert_with(|| DeviceEntry::new(id.clone()));

        let replaced = entry.cloud.take().and_then(|old| {
            if old.id() == link.id() {
                return None;
            }
            let was_active = old.context().deactivate();
            old.close(CLOSE_GOING_AWAY, REPLACED_REASON);
            was_active.then_some(old.id())
        });
        entry.cloud = Some(link);
        replaced
    }

    /// Clear the cloud link if it is still `ctx_id`, and mark the cloud side
    /// `Offline`.
    ///
    /// Returns `false` for a superseded context.
    pub fn release_cloud(&self, id: &DeviceId, ctx_id: u64) -> bool {
        let mut devices = self.devices.write();
        let Some(entry) = devices.get_mut(id) else {
            return false;
        };
        if entry.cloud.as_ref().map(LinkHandle::id) != Some(ctx_id) {
            return false;
        }
        entry.cloud = None;
        entry.record.cloud_state = ConnectionState::Offline;
        true
    }

    /// Live cloud link, if open.
    #[must_use]
    pub fn cloud_link(&self, id: &DeviceId) -> Option<LinkHandle> {
        self.devices
            .read()
            .get(id)
            .and_then(|entry| entry.cloud.clone())
            .filter(LinkHandle::is_open)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Device counts by state.
    #[must_use]
    pub fn counts(&self) -> RegistryCounts {
        let devices = self.devices.read();
        devices
            .values()
            .fold(RegistryCounts::default(), |mut counts, entry| {
                let record = &entry.record;
                counts.total += 1;
                if record.local_state == ConnectionState::Online {
                    counts.local_online += 1;
                }
                if record.cloud_state == ConnectionState::Online {
                    counts.cloud_online += 1;
                }
                if record.is_online() {
                    counts.online += 1;
                }
                if entry.local.as_ref().is_some_and(LinkHandle::is_open) {
                    counts.local_links += 1;
                }
                if entry.cloud.as_ref().is_some_and(LinkHandle::is_open) {
                    counts.cloud_links += 1;
                }
                counts
            })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::sync::mpsc;

    use super::*;

    const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));

    fn link() -> (LinkHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LinkHandle::new(ConnectionContext::new(), tx), rx)
    }

    fn id() -> DeviceId {
        DeviceId::from("1000abcdef")
    }

    #[test]
    fn dispatch_creates_record_and_correlates() {
        let registry = DeviceRegistry::new();
        let info = DispatchInfo {
            apikey: Some("device-key".to_string()),
            model: Some("PSF-B01-GL".to_string()),
            rom_version: Some("3.5.0".to_string()),
        };

        let snapshot = registry.record_dispatch(&id(), info, ADDR);
        assert_eq!(snapshot.local_state, ConnectionState::Dispatch);
        assert_eq!(snapshot.model.as_deref(), Some("PSF-B01-GL"));
        assert_eq!(snapshot.stats.dispatch_requests, 1);

        assert_eq!(registry.correlate(ADDR, Duration::from_secs(300)), Some(id()));
        assert_eq!(
            registry.correlate(IpAddr::V4(Ipv4Addr::LOCALHOST), Duration::from_secs(300)),
            None
        );
        assert_eq!(
            registry.read(&id(), |r| r.apikey.clone().unwrap().expose().to_string()),
            Some("device-key".to_string())
        );
    }

    #[test]
    fn correlation_expires() {
        let registry = DeviceRegistry::new();
        registry.record_dispatch(&id(), DispatchInfo::default(), ADDR);
        assert_eq!(registry.correlate(ADDR, Duration::ZERO), None);
    }

    #[test]
    fn dispatch_keeps_state_while_socket_live() {
        let registry = DeviceRegistry::new();
        let (local, _rx) = link();
        registry.claim_local(&id(), local, ADDR);
        registry.set_local_state(&id(), ConnectionState::Online);

        let snapshot = registry.record_dispatch(&id(), DispatchInfo::default(), ADDR);
        assert_eq!(snapshot.local_state, ConnectionState::Online);
    }

    #[tokio::test]
    async fn claim_replaces_and_closes_previous_link() {
        let registry = DeviceRegistry::new();
        let (first, mut first_rx) = link();
        let first_ctx = first.context().clone();
        let first_id = first.id();
        let (second, _second_rx) = link();
        let second_id = second.id();

        assert_eq!(registry.claim_local(&id(), first, ADDR), None);
        assert_eq!(registry.claim_local(&id(), second, ADDR), Some(first_id));

        assert!(!first_ctx.is_active());
        assert!(first_ctx.timers().is_cancelled());
        assert_eq!(
            first_rx.recv().await,
            Some(Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: REPLACED_REASON.to_string()
            })
        );
        assert_eq!(registry.local_link(&id()).unwrap().id(), second_id);
        assert_eq!(registry.counts().local_links, 1);
    }

    #[test]
    fn stale_release_is_noop() {
        let registry = DeviceRegistry::new();
        let (first, _rx1) = link();
        let first_id = first.id();
        let (second, _rx2) = link();
        registry.claim_local(&id(), first, ADDR);
        registry.claim_local(&id(), second, ADDR);
        registry.set_local_state(&id(), ConnectionState::Online);

        assert!(!registry.release_local(&id(), first_id));
        assert_eq!(
            registry.snapshot(&id()).unwrap().local_state,
            ConnectionState::Online
        );
        assert!(registry.local_link(&id()).is_some());
    }

    #[test]
    fn release_of_current_link_goes_offline() {
        let registry = DeviceRegistry::new();
        let (local, _rx) = link();
        let local_id = local.id();
        registry.claim_local(&id(), local, ADDR);

        assert!(registry.release_local(&id(), local_id));
        assert_eq!(
            registry.snapshot(&id()).unwrap().local_state,
            ConnectionState::Offline
        );
        assert!(registry.local_link(&id()).is_none());
    }

    #[test]
    fn cloud_link_lifecycle() {
        let registry = DeviceRegistry::new();
        registry.ensure(&id());
        let (cloud, _rx) = link();
        let cloud_id = cloud.id();
        registry.claim_cloud(&id(), cloud);
        registry.set_cloud_state(&id(), ConnectionState::Online);
        assert!(registry.cloud_link(&id()).is_some());

        assert!(registry.release_cloud(&id(), cloud_id));
        assert!(registry.cloud_link(&id()).is_none());
        assert_eq!(
            registry.snapshot(&id()).unwrap().cloud_state,
            ConnectionState::Offline
        );
    }

    #[test]
    fn deactivated_link_is_not_returned() {
        let registry = DeviceRegistry::new();
        let (local, _rx) = link();
        let ctx = local.context().clone();
        registry.claim_local(&id(), local, ADDR);
        ctx.deactivate();
        assert!(registry.local_link(&id()).is_none());
    }

    #[test]
    fn counts_by_state() {
        let registry = DeviceRegistry::new();
        registry.ensure(&id());
        registry.ensure(&DeviceId::from("1000fedcba"));
        registry.set_local_state(&id(), ConnectionState::Online);
        registry.set_cloud_state(&id(), ConnectionState::Online);
        registry.set_local_state(&DeviceId::from("1000fedcba"), ConnectionState::Online);

        let counts = registry.counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.local_online, 2);
        assert_eq!(counts.cloud_online, 1);
        assert_eq!(counts.online, 1);
    }

    #[test]
    fn ensure_reports_creation() {
        let registry = DeviceRegistry::new();
        assert!(registry.ensure(&id()));
        assert!(!registry.ensure(&id()));
        assert!(registry.contains(&id()));
    }
}

//! Device Socket Supervision
//!
//! Timers that watch a device socket: the identification deadline, the
//! first-message diagnostic, and the post-registration ping check. Every
//! timer runs under the socket's `ConnectionContext` token and re-checks the
//! active-flag before reporting, so a closed or superseded socket never acts
//! on a stale timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::infrastructure::registry::ConnectionContext;

/// Timer outcome delivered to the socket's reader loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionEvent {
    /// No frame carrying `deviceid` arrived in time.
    IdentificationTimeout,
    /// A pre-identified socket stayed silent.
    FirstMessageStall,
    /// No ping within the allowed gap after registration.
    PingTimeout {
        /// Time since the last ping.
        elapsed: Duration,
    },
}

// =============================================================================
// Link Activity
// =============================================================================

/// Activity flags shared between the reader loop and its timers.
#[derive(Debug)]
pub struct LinkActivity {
    last_ping: RwLock<Instant>,
    received_any: AtomicBool,
    identified: AtomicBool,
}

impl Default for LinkActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkActivity {
    /// Create fresh activity state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_ping: RwLock::new(Instant::now()),
            received_any: AtomicBool::new(false),
            identified: AtomicBool::new(false),
        }
    }

    /// Record a WebSocket ping.
    pub fn record_ping(&self) {
        *self.last_ping.write() = Instant::now();
    }

    /// Restart the ping clock.
    pub fn reset_ping(&self) {
        self.record_ping();
    }

    /// Time since the last ping.
    #[must_use]
    pub fn time_since_ping(&self) -> Duration {
        self.last_ping.read().elapsed()
    }

    /// Record any received frame.
    pub fn record_frame(&self) {
        self.received_any.store(true, Ordering::Release);
    }

    /// Whether anything has been received.
    #[must_use]
    pub fn has_received(&self) -> bool {
        self.received_any.load(Ordering::Acquire)
    }

    /// Record that a frame carrying `deviceid` arrived.
    pub fn mark_identified(&self) {
        self.identified.store(true, Ordering::Release);
    }

    /// Whether the socket has identified itself.
    #[must_use]
    pub fn is_identified(&self) -> bool {
        self.identified.load(Ordering::Acquire)
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Spawns the timers of one device socket.
#[derive(Debug, Clone)]
pub struct Supervisor {
    ctx: ConnectionContext,
    activity: Arc<LinkActivity>,
    events: mpsc::Sender<SupervisionEvent>,
}

impl Supervisor {
    /// Create a supervisor for a socket.
    #[must_use]
    pub const fn new(
        ctx: ConnectionContext,
        activity: Arc<LinkActivity>,
        events: mpsc::Sender<SupervisionEvent>,
    ) -> Self {
        Self {
            ctx,
            activity,
            events,
        }
    }

    /// Report `IdentificationTimeout` unless the socket identifies itself
    /// within `timeout`.
    pub fn arm_identification(&self, timeout: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            if this.sleep(timeout).await && !this.activity.is_identified() {
                this.report(SupervisionEvent::IdentificationTimeout).await;
            }
        });
    }

    /// Report `FirstMessageStall` if nothing at all arrives within `timeout`.
    pub fn arm_first_message(&self, timeout: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            if this.sleep(timeout).await && !this.activity.has_received() {
                this.report(SupervisionEvent::FirstMessageStall).await;
            }
        });
    }

    /// Every `check_interval`, report `PingTimeout` once the gap since the
    /// last ping exceeds `timeout`. Stops after reporting.
    pub fn start_ping_check(&self, check_interval: Duration, timeout: Duration) {
        self.activity.reset_ping();
        let this = self.clone();
        tokio::spawn(async move {
            let start = Instant::now() + check_interval;
            let mut interval = tokio::time::interval_at(start, check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = this.ctx.timers().cancelled() => break,
                    _ = interval.tick() => {
                        let elapsed = this.activity.time_since_ping();
                        if elapsed > timeout {
                            this.report(SupervisionEvent::PingTimeout { elapsed }).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Sleep unless cancelled first. Returns `true` if the full time elapsed.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.ctx.timers().cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    async fn report(&self, event: SupervisionEvent) {
        if !self.ctx.is_active() {
            return;
        }
        if self.events.send(event).await.is_err() {
            tracing::debug!(conn = self.ctx.id(), "Supervision channel closed");
        }
    }
}

//! Connection Context and Link Handles
//!
//! One `ConnectionContext` exists per live socket (local or cloud). It scopes
//! every timer of that socket and carries the shared active-flag that
//! supervision checks before any write.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// WebSocket close code: normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code: going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// WebSocket close code: policy violation.
pub const CLOSE_POLICY: u16 = 1008;

// =============================================================================
// Connection Context
// =============================================================================

/// Per-socket lifecycle scope.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    id: u64,
    active: Arc<AtomicBool>,
    timers: CancellationToken,
    created_at: Instant,
}

impl ConnectionContext {
    /// Create an active context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            active: Arc::new(AtomicBool::new(true)),
            timers: CancellationToken::new(),
            created_at: Instant::now(),
        }
    }

    /// Connection id, unique within the process.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Whether the socket is still the live one.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Token that every timer of this socket runs under.
    #[must_use]
    pub const fn timers(&self) -> &CancellationToken {
        &self.timers
    }

    /// Age of the socket.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Mark inactive and cancel every timer.
    ///
    /// Returns whether the context was active before the call.
    pub fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        self.timers.cancel();
        was_active
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Link Handles
// =============================================================================

/// Frame queued for a socket's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame.
    Text(String),
    /// Close the socket with a code and reason.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write error: the socket's writer is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("link closed")]
pub struct LinkClosed;

/// Handle to a live socket, stored in the registry.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    ctx: ConnectionContext,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl LinkHandle {
    /// Create a handle from a context and the socket's outbound queue.
    #[must_use]
    pub const fn new(ctx: ConnectionContext, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { ctx, tx }
    }

    /// The socket's context.
    #[must_use]
    pub const fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Connection id of the socket.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.ctx.id()
    }

    /// Whether the socket can still take frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ctx.is_active() && !self.tx.is_closed()
    }

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Returns `LinkClosed` if the context was deactivated or the writer is gone.
    pub fn send_text(&self, text: String) -> Result<(), LinkClosed> {
        if !self.ctx.is_active() {
            return Err(LinkClosed);
        }
        self.tx.send(Outbound::Text(text)).map_err(|_| LinkClosed)
    }

    /// Queue a JSON frame.
    ///
    /// # Errors
    ///
    /// Returns `LinkClosed` if the context was deactivated or the writer is gone.
    pub fn send_json(&self, frame: &serde_json::Value) -> Result<(), LinkClosed> {
        self.send_text(frame.to_string())
    }

    /// Ask the socket to close. Works even after deactivation.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = ConnectionContext::new();
        let b = ConnectionContext::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn deactivate_cancels_timers_once() {
        let ctx = ConnectionContext::new();
        let clone = ctx.clone();
        assert!(ctx.is_active());

        assert!(ctx.deactivate());
        assert!(!clone.is_active());
        assert!(clone.timers().is_cancelled());
        assert!(!ctx.deactivate());
    }

    #[tokio::test]
    async fn inactive_link_refuses_text_but_still_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ConnectionContext::new();
        let link = LinkHandle::new(ctx.clone(), tx);

        link.send_text("a".to_string()).unwrap();
        ctx.deactivate();
        assert_eq!(link.send_text("b".to_string()), Err(LinkClosed));
        link.close(CLOSE_GOING_AWAY, "replaced");

        assert_eq!(rx.recv().await, Some(Outbound::Text("a".to_string())));
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: "replaced".to_string()
            })
        );
    }
}

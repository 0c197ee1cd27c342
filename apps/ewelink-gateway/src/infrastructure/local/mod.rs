//! Device-Facing Side
//!
//! Impersonates the vendor cloud on the LAN: the dispatch endpoint, the
//! device WebSocket sessions and their supervision timers, served over plain
//! and TLS listeners.

mod connection;
mod dispatch;
mod server;
mod supervision;
mod tls;

pub use connection::{IDENTIFICATION_TIMEOUT_REASON, PING_TIMEOUT_REASON, SHUTDOWN_REASON};
pub use dispatch::{DispatchError, DispatchService, DispatchTarget};
pub use server::{
    ListenerAddrs, LocalListeners, LocalServerState, SERVER_HEADER, ServerError, router,
    serve_plain, serve_tls,
};
pub use supervision::{LinkActivity, SupervisionEvent, Supervisor};
pub use tls::{HANDSHAKE_TIMEOUT, PeerAddr, ServerTls, TlsError, TlsListener};

//! Device-Facing HTTP and WebSocket Server
//!
//! Every listener serves the same router:
//!
//! - `POST /dispatch/device` - Dispatch request, answered with a listener address
//! - `GET /api/ws` - Device WebSocket session
//!
//! Anything else is a 404. Three listeners run side by side: the legacy plain
//! port, the TLS dispatch port, and the TLS port handed to TLS dispatch
//! callers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::serve::Listener;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::connection;
use super::dispatch::DispatchService;
use super::tls::{PeerAddr, ServerTls, TlsError, TlsListener};
use crate::application::services::MessageRelay;
use crate::domain::protocol::{self, DispatchResponse};
use crate::infrastructure::config::{LocalSettings, ServerSettings};
use crate::infrastructure::events::SharedEventBus;
use crate::infrastructure::registry::SharedRegistry;

/// `Server` header sent with dispatch replies.
pub const SERVER_HEADER: &str = "openresty";

/// Local server error.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind a listener.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: SocketAddr,
        /// Underlying error.
        source: io::Error,
    },
    /// TLS material could not be turned into an acceptor.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// The HTTP server stopped with an error.
    #[error("server failed: {0}")]
    Serve(#[source] io::Error),
}

// =============================================================================
// State
// =============================================================================

/// State shared by every device-facing listener and socket.
#[derive(Debug)]
pub struct LocalServerState {
    /// Device registry.
    pub registry: SharedRegistry,
    /// Lifecycle event bus.
    pub events: SharedEventBus,
    /// Device/cloud relay.
    pub relay: MessageRelay,
    /// Dispatch handler.
    pub dispatch: DispatchService,
    /// Session timing and the local key.
    pub settings: LocalSettings,
    /// Cancelled on gateway shutdown.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone)]
struct ListenerState {
    shared: Arc<LocalServerState>,
    secure: bool,
}

/// Build the router for one listener.
pub fn router(shared: Arc<LocalServerState>, secure: bool) -> Router {
    Router::new()
        .route("/dispatch/device", post(dispatch_handler))
        .route("/api/ws", get(websocket_handler))
        .fallback(not_found_handler)
        .with_state(ListenerState { shared, secure })
}

// =============================================================================
// Handlers
// =============================================================================

async fn dispatch_handler(
    State(state): State<ListenerState>,
    ConnectInfo(PeerAddr(remote)): ConnectInfo<PeerAddr>,
    body: Bytes,
) -> Response {
    let result = DispatchService::parse(&body)
        .and_then(|request| state.shared.dispatch.handle(request, state.secure, remote.ip()));

    match result {
        Ok(target) => (
            StatusCode::OK,
            [(header::SERVER, SERVER_HEADER)],
            Json(DispatchResponse::from(target)),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(remote = %remote, error = %e, "Dispatch request rejected");
            (
                StatusCode::BAD_REQUEST,
                [(header::SERVER, SERVER_HEADER)],
                Json(protocol::dispatch_error(&e.to_string())),
            )
                .into_response()
        }
    }
}

async fn websocket_handler(
    State(state): State<ListenerState>,
    ConnectInfo(PeerAddr(remote)): ConnectInfo<PeerAddr>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let ListenerState { shared, secure } = state;
    upgrade.on_upgrade(move |socket| connection::serve(socket, remote, secure, shared))
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

// =============================================================================
// Listeners
// =============================================================================

/// Bound addresses of the three listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerAddrs {
    /// Plain dispatch and WebSocket.
    pub legacy: SocketAddr,
    /// TLS dispatch and WebSocket.
    pub dispatch: SocketAddr,
    /// TLS WebSocket handed to TLS dispatch callers.
    pub modern: SocketAddr,
}

/// The three bound device-facing listeners, not yet serving.
#[derive(Debug)]
pub struct LocalListeners {
    legacy: TcpListener,
    dispatch: TlsListener,
    modern: TlsListener,
}

impl LocalListeners {
    /// Bind every listener from `settings`.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if a port cannot be bound or the TLS material is
    /// unusable.
    pub async fn bind(settings: &ServerSettings, tls: &ServerTls) -> Result<Self, ServerError> {
        let acceptor = tls.acceptor()?;
        let legacy = bind_tcp(SocketAddr::new(settings.bind_addr, settings.legacy_port)).await?;
        let dispatch =
            bind_tcp(SocketAddr::new(settings.bind_addr, settings.dispatch_port)).await?;
        let modern = bind_tcp(SocketAddr::new(settings.bind_addr, settings.modern_ws_port)).await?;

        Ok(Self {
            legacy,
            dispatch: TlsListener::new(dispatch, acceptor.clone()).map_err(ServerError::Serve)?,
            modern: TlsListener::new(modern, acceptor).map_err(ServerError::Serve)?,
        })
    }

    /// Addresses the listeners are bound to.
    ///
    /// # Errors
    ///
    /// Returns the socket error if an address cannot be read.
    pub fn local_addrs(&self) -> io::Result<ListenerAddrs> {
        Ok(ListenerAddrs {
            legacy: self.legacy.local_addr()?,
            dispatch: self.dispatch.local_addr()?,
            modern: self.modern.local_addr()?,
        })
    }

    /// Serve every listener until `state.shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns the first listener failure.
    pub async fn serve(self, state: Arc<LocalServerState>) -> Result<(), ServerError> {
        let shutdown = state.shutdown.clone();
        tokio::try_join!(
            serve_plain(self.legacy, router(Arc::clone(&state), false), shutdown.clone()),
            serve_tls(self.dispatch, router(Arc::clone(&state), true), shutdown.clone()),
            serve_tls(self.modern, router(state, true), shutdown),
        )?;
        tracing::info!("Local listeners stopped");
        Ok(())
    }
}

async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    tracing::info!(addr = %addr, "Device listener bound");
    Ok(listener)
}

/// Serve `router` on a plain listener.
///
/// # Errors
///
/// Returns `ServerError::Serve` if the server fails.
pub async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    axum::serve(listener, router.into_make_service_with_connect_info::<PeerAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServerError::Serve)
}

/// Serve `router` on a TLS listener.
///
/// # Errors
///
/// Returns `ServerError::Serve` if the server fails.
pub async fn serve_tls(
    listener: TlsListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    axum::serve(listener, router.into_make_service_with_connect_info::<PeerAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServerError::Serve)
}

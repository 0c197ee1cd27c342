//! TLS for the Device-Facing Listeners
//!
//! Devices reach the secure listeners by IP and do not validate the
//! certificate chain, so any certificate works. The certificate is loaded
//! from PEM files when configured, and generated with `rcgen` otherwise.
//!
//! # Configuration
//!
//! - `GATEWAY_TLS_CERT_PATH`: PEM certificate chain
//! - `GATEWAY_TLS_KEY_PATH`: PEM private key
//!
//! # Serving
//!
//! `TlsListener` wraps a `TcpListener` and completes TLS handshakes in the
//! background before handing streams to axum, so the same router serves
//! plain and TLS listeners.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::infrastructure::config::TlsSettings;

/// Deadline for a client to finish the TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Failed to read certificate file.
    #[error("failed to read certificate file: {0}")]
    CertificateRead(#[from] std::io::Error),

    /// Failed to generate self-signed certificate.
    #[error("failed to generate certificate: {0}")]
    CertificateGeneration(String),

    /// Invalid certificate or key format.
    #[error("invalid certificate or key format: {0}")]
    InvalidFormat(String),

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    Configuration(String),
}

// =============================================================================
// Certificate Material
// =============================================================================

/// Certificate and key for the secure listeners, PEM encoded.
#[derive(Clone)]
pub struct ServerTls {
    cert: String,
    key: String,
}

impl std::fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTls")
            .field("cert_len", &self.cert.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl ServerTls {
    /// Load certificate material from PEM files.
    ///
    /// # Errors
    ///
    /// Returns `CertificateRead` if either file cannot be read.
    pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, TlsError> {
        Ok(Self {
            cert: fs::read_to_string(cert_path)?,
            key: fs::read_to_string(key_path)?,
        })
    }

    /// Wrap PEM strings.
    #[must_use]
    pub fn from_pem(cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// Generate a self-signed certificate.
    ///
    /// Names that parse as IP addresses become IP SANs.
    ///
    /// # Errors
    ///
    /// Returns `CertificateGeneration` if key or certificate generation fails.
    pub fn generate_self_signed(common_name: &str, subject_alt_names: &[&str]) -> Result<Self, TlsError> {
        let key_pair =
            KeyPair::generate().map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

        let sans: Vec<String> = subject_alt_names.iter().map(|s| (*s).to_string()).collect();
        let mut params = CertificateParams::new(sans)
            .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "eWeLink Gateway");

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

        tracing::info!(
            common_name = %common_name,
            san_count = subject_alt_names.len(),
            "Generated self-signed certificate"
        );

        Ok(Self {
            cert: cert.pem(),
            key: key_pair.serialize_pem(),
        })
    }

    /// Load from the configured paths, or generate a certificate for
    /// `server_ip` when none are set.
    ///
    /// # Errors
    ///
    /// Returns `TlsError` if loading or generation fails.
    pub fn from_settings(settings: &TlsSettings, server_ip: &str) -> Result<Self, TlsError> {
        match (&settings.cert_path, &settings.key_path) {
            (Some(cert_path), Some(key_path)) => {
                tracing::info!(
                    cert = %cert_path.display(),
                    key = %key_path.display(),
                    "Loading TLS certificate"
                );
                Self::from_files(cert_path, key_path)
            }
            _ => Self::generate_self_signed(server_ip, &[server_ip, "localhost"]),
        }
    }

    /// Build a rustls server configuration (TLS 1.2 and 1.3).
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for unparseable PEM and `Configuration` if
    /// rustls rejects the certificate or key.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let certs = CertificateDer::pem_slice_iter(self.cert.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::InvalidFormat(format!("certificate: {e}")))?;
        if certs.is_empty() {
            return Err(TlsError::InvalidFormat("no certificate found".to_string()));
        }
        let key = PrivateKeyDer::from_pem_slice(self.key.as_bytes())
            .map_err(|e| TlsError::InvalidFormat(format!("private key: {e}")))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Configuration(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Configuration(e.to_string()))?;

        Ok(Arc::new(config))
    }

    /// Build a TLS acceptor.
    ///
    /// # Errors
    ///
    /// See [`ServerTls::server_config`].
    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Queue of completed handshakes waiting for `accept`.
const READY_CAPACITY: usize = 64;

type Handshaken = (TlsStream<TcpStream>, SocketAddr);

/// TCP listener that yields TLS streams.
///
/// A background task accepts TCP connections and runs each handshake in its
/// own task, so a silent peer never holds up the next one. `accept` only
/// yields completed handshakes. Failed or slow handshakes are logged and
/// dropped. Dropping the listener stops the task and any pending handshakes.
pub struct TlsListener {
    local_addr: SocketAddr,
    ready: mpsc::Receiver<Handshaken>,
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl TlsListener {
    /// Wrap a bound TCP listener and start accepting on it.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the bound address cannot be read.
    pub fn new(inner: TcpListener, acceptor: TlsAcceptor) -> io::Result<Self> {
        Self::with_handshake_timeout(inner, acceptor, HANDSHAKE_TIMEOUT)
    }

    /// Same as [`TlsListener::new`] with an explicit handshake deadline.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the bound address cannot be read.
    pub fn with_handshake_timeout(
        inner: TcpListener,
        acceptor: TlsAcceptor,
        handshake_timeout: Duration,
    ) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;
        let (tx, ready) = mpsc::channel(READY_CAPACITY);
        tokio::spawn(accept_loop(inner, acceptor, handshake_timeout, tx));
        Ok(Self { local_addr, ready })
    }
}

async fn accept_loop(
    mut inner: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    ready: mpsc::Sender<Handshaken>,
) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            () = ready.closed() => break,
            (stream, addr) = Listener::accept(&mut inner) => {
                handshakes.spawn(handshake(
                    acceptor.clone(),
                    stream,
                    addr,
                    handshake_timeout,
                    ready.clone(),
                ));
            }
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
    tracing::debug!(addr = ?inner.local_addr().ok(), "TLS accept loop stopped");
}

async fn handshake(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    addr: SocketAddr,
    handshake_timeout: Duration,
    ready: mpsc::Sender<Handshaken>,
) {
    match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => {
            if ready.send((tls, addr)).await.is_err() {
                tracing::debug!(remote = %addr, "Listener gone, TLS stream dropped");
            }
        }
        Ok(Err(e)) => {
            tracing::debug!(remote = %addr, error = %e, "TLS handshake failed");
        }
        Err(_) => {
            tracing::debug!(remote = %addr, "TLS handshake timed out");
        }
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(handshaken) => handshaken,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

// =============================================================================
// Connect Info
// =============================================================================

/// Remote address of a device connection, for both plain and TLS listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, TcpListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

impl Connected<IncomingStream<'_, TlsListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

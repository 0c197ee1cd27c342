//! Cloud Session
//!
//! One connection to the vendor cloud on behalf of a device:
//!
//! 1. Resolve the cloud server through the vendor dispatch endpoint
//! 2. Open the WebSocket and send the device's registration
//! 3. Wait for the registration reply (bounded by the registration timeout)
//! 4. Relay app commands to the device and acknowledge them
//!
//! A session ends on cancellation, on a close request from another component,
//! or when the socket drops. The outcome tells the manager whether a retry
//! makes sense.

use std::fmt;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::heartbeat::CloudHeartbeat;
use crate::application::ports::{CloudDiscovery, DiscoveryError, DiscoveryRequest};
use crate::application::services::MessageRelay;
use crate::domain::device::{ApiKey, ConnectionState, DeviceId};
use crate::domain::protocol::{self, CloudFrame, RegisterDefaults};
use crate::infrastructure::config::CloudSettings;
use crate::infrastructure::events::{GatewayEvent, SharedEventBus, UpdateOrigin};
use crate::infrastructure::metrics::{self, RegistrationOutcome};
use crate::infrastructure::registry::{
    CLOSE_NORMAL, CLOSE_POLICY, ConnectionContext, LinkHandle, Outbound, SharedRegistry,
};

type CloudSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type CloudSink = SplitSink<CloudSocket, Message>;

/// Failure reason for a registration that got no reply.
pub const REGISTRATION_TIMEOUT_REASON: &str = "registration timeout";

/// Errors that keep a session from reaching the cloud.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudSessionError {
    /// The device is not in the registry.
    #[error("device is not known")]
    UnknownDevice,
    /// The device never sent its own key.
    #[error("device apikey unknown")]
    MissingApiKey,
    /// Vendor dispatch failed.
    #[error("cloud discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    /// WebSocket connection failed.
    #[error("cloud connect failed: {0}")]
    Connect(String),
    /// WebSocket connection did not complete in time.
    #[error("cloud connect timed out")]
    ConnectTimeout,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The session's token was cancelled.
    Cancelled,
    /// Another component closed the cloud link.
    ClosedByRequest,
    /// The cloud could not be reached.
    Failed(CloudSessionError),
    /// The cloud answered the registration with an error.
    RegistrationRejected,
    /// No registration reply arrived in time.
    RegistrationTimedOut,
    /// The socket dropped.
    Dropped {
        /// Whether the registration had been accepted on this socket.
        registered: bool,
    },
}

// =============================================================================
// Services
// =============================================================================

/// Everything a cloud session needs.
#[derive(Clone)]
pub struct CloudServices {
    /// Device registry.
    pub registry: SharedRegistry,
    /// Lifecycle event bus.
    pub events: SharedEventBus,
    /// Device/cloud relay.
    pub relay: MessageRelay,
    /// Vendor dispatch lookup.
    pub discovery: Arc<dyn CloudDiscovery>,
    /// Cloud settings.
    pub settings: CloudSettings,
    /// TLS client configuration for `wss` sessions.
    pub tls: Arc<rustls::ClientConfig>,
}

impl fmt::Debug for CloudServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudServices")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Session
// =============================================================================

/// A single cloud session for one device.
pub struct CloudSession<'a> {
    services: &'a CloudServices,
    device_id: &'a DeviceId,
    cancel: &'a CancellationToken,
}

impl<'a> CloudSession<'a> {
    /// Prepare a session; nothing happens until [`CloudSession::run`].
    #[must_use]
    pub const fn new(
        services: &'a CloudServices,
        device_id: &'a DeviceId,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            services,
            device_id,
            cancel,
        }
    }

    /// Connect, register, and relay until the session ends.
    pub async fn run(self) -> SessionOutcome {
        let socket = tokio::select! {
            () = self.cancel.cancelled() => return SessionOutcome::Cancelled,
            result = self.connect() => match result {
                Ok(socket) => socket,
                Err(e) => return SessionOutcome::Failed(e),
            },
        };

        let registry = &self.services.registry;
        let ctx = ConnectionContext::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let link = LinkHandle::new(ctx.clone(), tx);
        registry.claim_cloud(self.device_id, link.clone());
        registry.set_cloud_state(self.device_id, ConnectionState::WsConnected);
        metrics::adjust_cloud_connections(1.0);
        tracing::info!(device_id = %self.device_id, conn = ctx.id(), "Cloud socket connected");

        let outcome = self.drive(socket, &link, rx).await;

        ctx.deactivate();
        if registry.release_cloud(self.device_id, ctx.id()) {
            self.services
                .events
                .publish(GatewayEvent::CloudConnectionClosed {
                    device_id: self.device_id.clone(),
                });
        }
        metrics::adjust_cloud_connections(-1.0);
        tracing::info!(device_id = %self.device_id, outcome = ?outcome, "Cloud session ended");
        outcome
    }

    async fn connect(&self) -> Result<CloudSocket, CloudSessionError> {
        let settings = &self.services.settings;
        let request = self.discovery_request()?;
        let endpoint = self.services.discovery.discover(&request).await?;
        let url = endpoint.ws_url(&settings.ws_scheme);
        tracing::info!(device_id = %self.device_id, url = %url, "Connecting to cloud");

        let connector = Connector::Rustls(Arc::clone(&self.services.tls));
        let connect =
            tokio_tungstenite::connect_async_tls_with_config(&url, None, false, Some(connector));
        match tokio::time::timeout(settings.http_timeout, connect).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(CloudSessionError::Connect(e.to_string())),
            Err(_) => Err(CloudSessionError::ConnectTimeout),
        }
    }

    fn discovery_request(&self) -> Result<DiscoveryRequest, CloudSessionError> {
        let settings = &self.services.settings;
        self.services
            .registry
            .read(self.device_id, |record| {
                let apikey = record.apikey.as_ref().ok_or(CloudSessionError::MissingApiKey)?;
                Ok(DiscoveryRequest::new(
                    self.device_id,
                    apikey.expose(),
                    record.model.as_deref().unwrap_or(&settings.default_model),
                    record
                        .rom_version
                        .as_deref()
                        .unwrap_or(&settings.default_rom_version),
                    settings.protocol_version,
                ))
            })
            .unwrap_or(Err(CloudSessionError::UnknownDevice))
    }

    fn registration_frame(&self) -> Option<Value> {
        let settings = &self.services.settings;
        self.services
            .registry
            .read(self.device_id, |record| {
                let apikey = record.apikey.as_ref()?;
                let defaults = RegisterDefaults {
                    version: settings.protocol_version,
                    rom_version: record
                        .rom_version
                        .as_deref()
                        .unwrap_or(&settings.default_rom_version),
                    model: record.model.as_deref().unwrap_or(&settings.default_model),
                };
                Some(protocol::cloud_register(
                    record.register_frame.as_ref(),
                    self.device_id.as_str(),
                    apikey.expose(),
                    &defaults,
                ))
            })
            .flatten()
    }

    async fn drive(
        &self,
        socket: CloudSocket,
        link: &LinkHandle,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> SessionOutcome {
        let (mut write, mut read) = socket.split();
        let registry = &self.services.registry;

        let Some(register) = self.registration_frame() else {
            close(&mut write, CLOSE_NORMAL, "no apikey").await;
            return SessionOutcome::Failed(CloudSessionError::MissingApiKey);
        };
        if let Err(e) = write.send(Message::Text(register.to_string().into())).await {
            tracing::warn!(device_id = %self.device_id, error = %e, "Cloud registration send failed");
            return SessionOutcome::Dropped { registered: false };
        }
        registry.set_cloud_state(self.device_id, ConnectionState::Registered);
        tracing::debug!(device_id = %self.device_id, "Cloud registration sent");

        let deadline = tokio::time::sleep(self.services.settings.registration_timeout);
        tokio::pin!(deadline);
        let mut registered = false;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    close(&mut write, CLOSE_NORMAL, "device disconnected").await;
                    return SessionOutcome::Cancelled;
                }
                () = &mut deadline, if !registered => {
                    tracing::warn!(device_id = %self.device_id, "Cloud registration timed out");
                    metrics::record_cloud_registration(RegistrationOutcome::TimedOut);
                    self.fail(REGISTRATION_TIMEOUT_REASON);
                    close(&mut write, CLOSE_POLICY, REGISTRATION_TIMEOUT_REASON).await;
                    return SessionOutcome::RegistrationTimedOut;
                }
                Some(outbound) = rx.recv() => match outbound {
                    Outbound::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            tracing::warn!(device_id = %self.device_id, error = %e, "Cloud write failed");
                            return SessionOutcome::Dropped { registered };
                        }
                    }
                    Outbound::Close { code, reason } => {
                        close(&mut write, code, &reason).await;
                        return SessionOutcome::ClosedByRequest;
                    }
                },
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(outcome) = self.on_text(text.as_str(), &mut registered, link) {
                            close(&mut write, CLOSE_POLICY, "registration rejected").await;
                            return outcome;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return SessionOutcome::Dropped { registered };
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(
                            device_id = %self.device_id,
                            frame = ?frame,
                            "Cloud sent close frame"
                        );
                        return SessionOutcome::Dropped { registered };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(device_id = %self.device_id, error = %e, "Cloud socket error");
                        return SessionOutcome::Dropped { registered };
                    }
                    None => {
                        tracing::info!(device_id = %self.device_id, "Cloud socket ended");
                        return SessionOutcome::Dropped { registered };
                    }
                },
            }
        }
    }

    /// Handle a cloud frame. Returns an outcome if the session must end.
    fn on_text(&self, text: &str, registered: &mut bool, link: &LinkHandle) -> Option<SessionOutcome> {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(device_id = %self.device_id, error = %e, "Malformed frame from cloud");
                return None;
            }
        };
        self.services
            .registry
            .update(self.device_id, |record| record.stats.cloud_messages += 1);

        match protocol::classify_cloud(&frame, *registered) {
            CloudFrame::Rejected { code, reason } if !*registered => {
                tracing::warn!(
                    device_id = %self.device_id,
                    code,
                    reason = reason.as_deref(),
                    "Cloud rejected registration"
                );
                metrics::record_cloud_registration(RegistrationOutcome::Rejected);
                self.fail(&format!("registration rejected (error {code})"));
                return Some(SessionOutcome::RegistrationRejected);
            }
            CloudFrame::Rejected { code, reason } => {
                tracing::warn!(
                    device_id = %self.device_id,
                    code,
                    reason = reason.as_deref(),
                    "Cloud reported an error"
                );
            }
            CloudFrame::RegistrationAccepted { apikey } => {
                *registered = true;
                self.on_registered(ApiKey::new(apikey), link);
            }
            CloudFrame::AppUpdate => self.on_app_update(frame, link),
            CloudFrame::Ack => {
                tracing::debug!(device_id = %self.device_id, "Cloud ack");
            }
            CloudFrame::Other => {
                tracing::debug!(device_id = %self.device_id, frame = %frame, "Unhandled cloud frame");
            }
        }
        None
    }

    fn on_registered(&self, cloud_apikey: ApiKey, link: &LinkHandle) {
        tracing::info!(
            device_id = %self.device_id,
            cloud_apikey = %cloud_apikey.preview(),
            "Cloud registration accepted"
        );
        self.services.registry.update(self.device_id, |record| {
            record.cloud_apikey = Some(cloud_apikey);
            record.cloud_state = ConnectionState::Online;
        });
        CloudHeartbeat::new(
            Arc::clone(&self.services.registry),
            self.device_id.clone(),
            link.clone(),
            self.services.settings.heartbeat_interval,
        )
        .spawn();
        metrics::record_cloud_registration(RegistrationOutcome::Accepted);
        self.services
            .events
            .publish(GatewayEvent::CloudConnectionEstablished {
                device_id: self.device_id.clone(),
            });
    }

    /// Relay an app command to the device and acknowledge it to the cloud.
    fn on_app_update(&self, frame: Value, link: &LinkHandle) {
        let original_sequence = protocol::sequence_of(&frame);
        let params = frame.get("params").cloned().unwrap_or_else(|| json!({}));

        let mut command = frame;
        protocol::set_sequence(&mut command, protocol::new_sequence());
        if let Err(e) = self.services.relay.forward_to_device(self.device_id, command) {
            tracing::warn!(device_id = %self.device_id, error = %e, "App command not delivered");
            return;
        }

        let apikey = self
            .services
            .registry
            .read(self.device_id, |record| {
                record.cloud_bound_key().map(|key| key.expose().to_string())
            })
            .flatten()
            .unwrap_or_default();
        let ack = protocol::app_ack(self.device_id.as_str(), &apikey, original_sequence);
        if link.send_json(&ack).is_err() {
            tracing::debug!(device_id = %self.device_id, "Cloud link closed before app ack");
        }

        tracing::info!(device_id = %self.device_id, params = %params, "App command relayed");
        self.services.events.publish(GatewayEvent::DeviceUpdated {
            device_id: self.device_id.clone(),
            params,
            origin: UpdateOrigin::Cloud,
        });
    }

    fn fail(&self, reason: &str) {
        self.services
            .registry
            .set_cloud_state(self.device_id, ConnectionState::Offline);
        self.services
            .events
            .publish(GatewayEvent::CloudConnectionFailed {
                device_id: self.device_id.clone(),
                reason: reason.to_string(),
            });
    }
}

async fn close(write: &mut CloudSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = write.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Cloud close failed");
    }
}

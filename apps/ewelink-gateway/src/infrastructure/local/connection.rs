//! Device WebSocket Session
//!
//! Runs one device socket from accept to close:
//!
//! ```text
//! WAIT_IDENTIFY ──(frame with deviceid)──► IDENTIFIED ──(register)──► REGISTERED
//!                                                                        │
//!                                            (ping or frame) ◄───────────┘
//!                                                   │
//!                                                   ▼
//!                                                ACTIVE
//! ```
//!
//! The socket is split: the reader loop below owns protocol handling, and a
//! writer task drains the link's outbound queue. Replies are queued in
//! receive order, so a `register` reply always precedes the reply to any
//! later frame.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::server::LocalServerState;
use super::supervision::{LinkActivity, SupervisionEvent, Supervisor};
use crate::domain::device::{ApiKey, ConnectionState, DeviceId};
use crate::domain::protocol::{self, Action};
use crate::infrastructure::events::{GatewayEvent, UpdateOrigin};
use crate::infrastructure::metrics;
use crate::infrastructure::registry::{
    CLOSE_GOING_AWAY, CLOSE_POLICY, ConnectionContext, LinkHandle, Outbound,
};

/// Close reason for a socket that never identified itself.
pub const IDENTIFICATION_TIMEOUT_REASON: &str = "identification timeout";

/// Close reason for a registered socket that stopped pinging.
pub const PING_TIMEOUT_REASON: &str = "ping timeout";

/// Close reason sent to devices on gateway shutdown.
pub const SHUTDOWN_REASON: &str = "server shutdown";

const SUPERVISION_CHANNEL_CAPACITY: usize = 8;

/// Run a device socket until it closes.
pub async fn serve(
    socket: WebSocket,
    remote: SocketAddr,
    secure: bool,
    state: Arc<LocalServerState>,
) {
    let ctx = ConnectionContext::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let link = LinkHandle::new(ctx.clone(), tx);
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, rx, ctx.id()));

    metrics::adjust_local_connections(1.0);
    tracing::debug!(conn = ctx.id(), remote = %remote, secure, "Device socket opened");

    let (supervision_tx, mut supervision_rx) = mpsc::channel(SUPERVISION_CHANNEL_CAPACITY);
    let activity = Arc::new(LinkActivity::new());
    let supervisor = Supervisor::new(ctx.clone(), Arc::clone(&activity), supervision_tx);

    let mut session = DeviceSession {
        state,
        ctx,
        link,
        activity,
        supervisor,
        remote,
        secure,
        device_id: None,
        correlated: None,
        registered: false,
        online: false,
    };
    session.start();

    let shutdown = session.state.shutdown.clone();
    let mut closing = false;
    let mut close_reason: Option<String> = None;

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(message)) => {
                    if !session.on_message(message) {
                        close_reason.get_or_insert_with(|| "closed by device".to_string());
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(conn = session.ctx.id(), error = %e, "Device socket error");
                    close_reason.get_or_insert_with(|| "socket error".to_string());
                    break;
                }
                None => {
                    close_reason.get_or_insert_with(|| "closed by device".to_string());
                    break;
                }
            },
            Some(event) = supervision_rx.recv() => session.on_supervision(event),
            result = &mut writer => {
                close_reason = result.ok().flatten().or_else(|| Some("write failed".to_string()));
                break;
            }
            () = shutdown.cancelled(), if !closing => {
                closing = true;
                session.link.close(CLOSE_GOING_AWAY, SHUTDOWN_REASON);
            }
        }
    }

    let reason = close_reason.unwrap_or_default();
    session.finish(&reason);
    if !writer.is_finished() {
        writer.abort();
    }
    metrics::adjust_local_connections(-1.0);
    metrics::record_local_close(&reason);
}

/// Drain the outbound queue into the socket.
///
/// Returns the close reason when a close was requested.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    conn: u64,
) -> Option<String> {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!(conn, error = %e, "Device socket write failed");
                    return None;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.clone().into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    tracing::debug!(conn, error = %e, "Device socket close failed");
                }
                return Some(reason);
            }
        }
    }
    None
}

// =============================================================================
// Session
// =============================================================================

struct DeviceSession {
    state: Arc<LocalServerState>,
    ctx: ConnectionContext,
    link: LinkHandle,
    activity: Arc<LinkActivity>,
    supervisor: Supervisor,
    remote: SocketAddr,
    secure: bool,
    /// Device this socket claimed.
    device_id: Option<DeviceId>,
    /// Device that dispatched from the same address shortly before.
    correlated: Option<DeviceId>,
    registered: bool,
    online: bool,
}

impl DeviceSession {
    fn start(&mut self) {
        let settings = &self.state.settings;
        if let Some(device_id) = self
            .state
            .registry
            .correlate(self.remote.ip(), settings.dispatch_correlation_window)
        {
            self.state.registry.update(&device_id, |record| {
                if record.local_state < ConnectionState::WsConnected {
                    record.local_state = ConnectionState::WsConnected;
                }
            });
            tracing::info!(
                device_id = %device_id,
                conn = self.ctx.id(),
                remote = %self.remote,
                "Device socket pre-identified from dispatch"
            );
            self.supervisor.arm_first_message(settings.first_message_timeout);
            self.correlated = Some(device_id);
        }
        self.supervisor
            .arm_identification(settings.identification_timeout);
    }

    fn local_apikey(&self) -> &ApiKey {
        self.state.relay.local_apikey()
    }

    /// Handle one received message. Returns `false` when the peer closed.
    fn on_message(&mut self, message: Message) -> bool {
        if !self.ctx.is_active() && !matches!(message, Message::Close(_)) {
            tracing::debug!(
                conn = self.ctx.id(),
                device_id = ?self.device_id.as_ref().map(DeviceId::as_str),
                "Frame on superseded socket ignored"
            );
            return true;
        }
        match message {
            Message::Text(text) => {
                self.activity.record_frame();
                self.on_text(text.as_str());
            }
            Message::Ping(_) => {
                self.activity.record_frame();
                self.activity.record_ping();
                if let Some(device_id) = &self.device_id {
                    self.state.registry.update(device_id, |record| {
                        record.stats.pings += 1;
                        record.touch();
                    });
                }
                self.mark_alive();
            }
            Message::Binary(_) => {
                self.activity.record_frame();
                tracing::debug!(conn = self.ctx.id(), "Ignoring binary frame");
            }
            Message::Pong(_) => {}
            Message::Close(frame) => {
                tracing::debug!(
                    conn = self.ctx.id(),
                    code = frame.as_ref().map(|f| f.code),
                    "Device sent close"
                );
                return false;
            }
        }
        true
    }

    fn on_text(&mut self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    conn = self.ctx.id(),
                    device_id = ?self.device_id.as_ref().map(DeviceId::as_str),
                    error = %e,
                    "Malformed frame from device"
                );
                return;
            }
        };

        let device_id = match &self.device_id {
            Some(device_id) => device_id.clone(),
            None => {
                let Some(device_id) = protocol::device_id_of(&frame).map(DeviceId::from) else {
                    tracing::debug!(conn = self.ctx.id(), "Frame before identification ignored");
                    return;
                };
                self.identify(&device_id);
                device_id
            }
        };

        self.state.registry.update(&device_id, |record| record.touch());
        self.mark_alive();

        let action = Action::of(&frame);
        metrics::record_local_frame(action.as_ref().map_or("none", Action::as_str));

        if let Some(code) = protocol::error_code(&frame).filter(|code| *code != 0) {
            let reason = frame.get("reason").and_then(Value::as_str);
            tracing::warn!(device_id = %device_id, code, reason, "Device reported an error");
            return;
        }

        match action {
            Some(Action::Register) => self.on_register(&device_id, frame),
            Some(Action::Update) => self.on_update(&device_id, frame),
            Some(Action::Query) => self.on_query(&device_id),
            Some(Action::Date) => self.on_date(&device_id),
            Some(Action::Other(name)) => {
                tracing::debug!(device_id = %device_id, action = %name, "Unhandled device action");
            }
            None if protocol::is_command_result(&frame) => {
                tracing::debug!(
                    device_id = %device_id,
                    sequence = ?protocol::sequence_of(&frame),
                    "Command result from device"
                );
                if let Err(e) = self.state.relay.forward_to_cloud(&device_id, frame) {
                    tracing::debug!(device_id = %device_id, error = %e, "Command result not relayed");
                }
            }
            None => {
                tracing::debug!(device_id = %device_id, "Device frame without action");
            }
        }
    }

    /// Claim the device for this socket.
    fn identify(&mut self, device_id: &DeviceId) {
        self.activity.mark_identified();
        let replaced = self
            .state
            .registry
            .claim_local(device_id, self.link.clone(), self.remote.ip());
        if let Some(correlated) = self.correlated.as_ref().filter(|id| *id != device_id) {
            tracing::debug!(
                device_id = %device_id,
                correlated = %correlated,
                "Socket identified as a different device than dispatched"
            );
            self.state.registry.mark_offline_if_unlinked(correlated);
        }
        self.device_id = Some(device_id.clone());

        tracing::info!(
            device_id = %device_id,
            conn = self.ctx.id(),
            remote = %self.remote,
            secure = self.secure,
            replaced_conn = replaced,
            "Device socket identified"
        );
        self.state.events.publish(GatewayEvent::DeviceConnected {
            device_id: device_id.clone(),
            remote_addr: self.remote.ip(),
            secure: self.secure,
        });
    }

    fn on_register(&mut self, device_id: &DeviceId, frame: Value) {
        let apikey = protocol::apikey_of(&frame).map(ApiKey::new);
        let alias = protocol::device_name_param(&frame).map(ToString::to_string);
        let model = frame.get("model").and_then(Value::as_str).map(ToString::to_string);
        let rom_version = frame
            .get("romVersion")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let changed_alias = self
            .state
            .registry
            .update(device_id, |record| {
                record.stats.register_requests += 1;
                if apikey.is_some() {
                    record.apikey = apikey;
                }
                if model.is_some() {
                    record.model = model;
                }
                if rom_version.is_some() {
                    record.rom_version = rom_version;
                }
                record.register_frame = Some(frame);
                match alias {
                    Some(alias) if alias != record.alias => {
                        record.alias.clone_from(&alias);
                        Some(alias)
                    }
                    _ => None,
                }
            })
            .flatten();

        if let Some(alias) = changed_alias {
            self.state.events.publish(GatewayEvent::AliasUpdated {
                device_id: device_id.clone(),
                alias,
            });
        }

        let reply = protocol::register_reply(device_id.as_str(), self.local_apikey().expose());
        if self.reply(device_id, &reply) {
            self.state.registry.update(device_id, |record| {
                record.stats.register_acks += 1;
                record.local_state = ConnectionState::Registered;
            });
        }

        if !self.registered {
            let settings = &self.state.settings;
            self.supervisor
                .start_ping_check(settings.ping_check_interval, settings.ping_timeout);
        }
        self.registered = true;
        self.online = false;

        tracing::info!(device_id = %device_id, "Device registered");
        self.state.events.publish(GatewayEvent::DeviceRegistered {
            device_id: device_id.clone(),
        });
    }

    fn on_update(&self, device_id: &DeviceId, frame: Value) {
        let switch = protocol::switch_param(&frame);
        self.state.registry.update(device_id, |record| {
            record.stats.update_requests += 1;
            if let Some(switch) = switch {
                record.switch_state = switch;
            }
        });

        let reply = protocol::ack(device_id.as_str(), self.local_apikey().expose());
        if self.reply(device_id, &reply) {
            self.state
                .registry
                .update(device_id, |record| record.stats.update_acks += 1);
        }

        let params = frame.get("params").cloned().unwrap_or_else(|| json!({}));
        tracing::debug!(device_id = %device_id, params = %params, "Device update");
        self.state.events.publish(GatewayEvent::DeviceUpdated {
            device_id: device_id.clone(),
            params,
            origin: UpdateOrigin::Device,
        });

        if let Err(e) = self.state.relay.forward_to_cloud(device_id, frame) {
            tracing::debug!(device_id = %device_id, error = %e, "Device update not relayed");
        }
    }

    fn on_query(&self, device_id: &DeviceId) {
        let switch = self
            .state
            .registry
            .update(device_id, |record| {
                record.stats.query_requests += 1;
                record.switch_state
            })
            .unwrap_or_default();
        let reply = protocol::query_reply(device_id.as_str(), self.local_apikey().expose(), switch);
        self.reply(device_id, &reply);
    }

    fn on_date(&self, device_id: &DeviceId) {
        self.state
            .registry
            .update(device_id, |record| record.stats.date_requests += 1);
        let reply = protocol::date_reply(device_id.as_str(), self.local_apikey().expose());
        self.reply(device_id, &reply);
    }

    /// Queue a reply. Returns `false` if the socket can no longer write.
    fn reply(&self, device_id: &DeviceId, frame: &Value) -> bool {
        if self.link.send_json(frame).is_err() {
            tracing::debug!(device_id = %device_id, conn = self.ctx.id(), "Reply dropped, socket inactive");
            return false;
        }
        true
    }

    /// First sign of life after registration sets the local state `Online`.
    fn mark_alive(&mut self) {
        if !self.registered || self.online || !self.ctx.is_active() {
            return;
        }
        let Some(device_id) = &self.device_id else {
            return;
        };
        self.online = true;
        self.state.registry.update(device_id, |record| {
            if record.local_state == ConnectionState::Registered {
                record.local_state = ConnectionState::Online;
            }
        });
        tracing::debug!(device_id = %device_id, "Device online");
    }

    fn on_supervision(&self, event: SupervisionEvent) {
        let device_id = self.device_id.as_ref().or(self.correlated.as_ref());
        match event {
            SupervisionEvent::IdentificationTimeout => {
                tracing::warn!(
                    conn = self.ctx.id(),
                    remote = %self.remote,
                    correlated = ?device_id.map(DeviceId::as_str),
                    "Device socket never identified itself"
                );
                self.link.close(CLOSE_POLICY, IDENTIFICATION_TIMEOUT_REASON);
            }
            SupervisionEvent::FirstMessageStall => {
                tracing::warn!(
                    conn = self.ctx.id(),
                    remote = %self.remote,
                    device_id = ?device_id.map(DeviceId::as_str),
                    age_secs = self.ctx.age().as_secs(),
                    "Device socket silent since accept"
                );
                if let Some(device_id) = device_id {
                    self.state
                        .registry
                        .update(device_id, |record| record.stats.first_message_stalls += 1);
                }
                metrics::record_first_message_stall();
            }
            SupervisionEvent::PingTimeout { elapsed } => {
                tracing::warn!(
                    device_id = ?device_id.map(DeviceId::as_str),
                    elapsed_secs = elapsed.as_secs(),
                    "Device stopped pinging"
                );
                self.link.close(CLOSE_GOING_AWAY, PING_TIMEOUT_REASON);
            }
        }
    }

    /// Tear down: cancel timers, then release the link if it is still ours.
    fn finish(&self, reason: &str) {
        self.ctx.deactivate();

        if let Some(device_id) = &self.device_id {
            if self.state.registry.release_local(device_id, self.ctx.id()) {
                tracing::info!(device_id = %device_id, reason, "Device disconnected");
                self.state.events.publish(GatewayEvent::DeviceDisconnected {
                    device_id: device_id.clone(),
                    reason: reason.to_string(),
                });
            } else {
                tracing::debug!(device_id = %device_id, conn = self.ctx.id(), "Superseded socket closed");
            }
        } else if let Some(correlated) = &self.correlated {
            self.state.registry.mark_offline_if_unlinked(correlated);
        }
    }
}

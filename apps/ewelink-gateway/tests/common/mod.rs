//! Shared fixtures for the gateway integration tests.
//!
//! A gateway on `127.0.0.1:0`, device clients over `tokio-tungstenite`, a
//! fake vendor cloud WebSocket server, and a `wiremock` vendor dispatch.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ewelink_gateway::{
    CloudConnectionManager, CloudServices, CloudSettings, CommandService, DeviceRegistry,
    DispatchService, EventBus, GatewayEvent, HttpCloudDiscovery, ListenerAddrs, LocalListeners,
    LocalServerState, LocalSettings, MessageRelay, ReconnectSettings, ServerSettings, ServerTls,
    SharedEventBus, SharedRegistry, insecure_client_config,
};

/// How long any single step may take.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Key the gateway hands to devices in these tests.
pub const LOCAL_KEY: &str = "local-test-key-0000";

// =============================================================================
// Gateway
// =============================================================================

/// A running gateway wired the way `main` wires it.
pub struct TestGateway {
    pub registry: SharedRegistry,
    pub events: SharedEventBus,
    pub commands: CommandService,
    pub manager: Arc<CloudConnectionManager>,
    pub addrs: ListenerAddrs,
    pub shutdown: CancellationToken,
}

impl TestGateway {
    /// Start a gateway with default local timing.
    pub async fn start(cloud: CloudSettings) -> Self {
        Self::start_with(local_settings(), cloud).await
    }

    /// Start a gateway with explicit settings.
    pub async fn start_with(local: LocalSettings, cloud: CloudSettings) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let registry = Arc::new(DeviceRegistry::new());
        let events = Arc::new(EventBus::with_defaults());
        let shutdown = CancellationToken::new();
        let relay = MessageRelay::new(Arc::clone(&registry), local.local_apikey.clone());

        let mut server = ServerSettings {
            server_ip: "127.0.0.1".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            legacy_port: 0,
            dispatch_port: 0,
            modern_ws_port: 0,
            health_port: 0,
        };
        let tls = ServerTls::generate_self_signed("127.0.0.1", &["127.0.0.1"]).unwrap();
        let listeners = LocalListeners::bind(&server, &tls).await.unwrap();
        let addrs = listeners.local_addrs().unwrap();
        server.legacy_port = addrs.legacy.port();
        server.dispatch_port = addrs.dispatch.port();
        server.modern_ws_port = addrs.modern.port();

        let state = Arc::new(LocalServerState {
            registry: Arc::clone(&registry),
            events: Arc::clone(&events),
            relay: relay.clone(),
            dispatch: DispatchService::new(Arc::clone(&registry), &server),
            settings: local,
            shutdown: shutdown.clone(),
        });
        tokio::spawn(listeners.serve(state));

        let services = CloudServices {
            registry: Arc::clone(&registry),
            events: Arc::clone(&events),
            relay: relay.clone(),
            discovery: Arc::new(HttpCloudDiscovery::from_settings(&cloud).unwrap()),
            settings: cloud,
            tls: insecure_client_config().unwrap(),
        };
        let manager = Arc::new(CloudConnectionManager::new(services, shutdown.clone()));
        manager.spawn();

        let commands = CommandService::new(
            Arc::clone(&registry),
            Arc::new(relay),
            Arc::clone(&events),
        )
        .with_cloud_sessions(manager.clone());

        Self {
            registry,
            events,
            commands,
            manager,
            addrs,
            shutdown,
        }
    }

    /// POST a dispatch body to the plain listener.
    pub async fn dispatch(&self, body: &Value) -> (u16, Value) {
        let response = reqwest::Client::new()
            .post(format!("http://{}/dispatch/device", self.addrs.legacy))
            .json(body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// POST a dispatch body to the TLS dispatch listener.
    pub async fn dispatch_secure(&self, body: &Value) -> (u16, Value) {
        let response = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap()
            .post(format!("https://{}/dispatch/device", self.addrs.dispatch))
            .json(body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// Open a device socket on the plain listener.
    pub async fn connect_device(&self) -> DeviceClient {
        DeviceClient::connect(self.addrs.legacy).await
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Local settings with the test key.
pub fn local_settings() -> LocalSettings {
    LocalSettings {
        local_apikey: ewelink_gateway::ApiKey::new(LOCAL_KEY),
        ..LocalSettings::default()
    }
}

/// Cloud relaying switched off.
pub fn cloud_disabled() -> CloudSettings {
    CloudSettings {
        enabled: false,
        ..CloudSettings::default()
    }
}

/// Cloud settings pointed at a mocked dispatch, with fast retries.
pub fn cloud_settings(dispatch: &MockServer, max_attempts: u32) -> CloudSettings {
    CloudSettings {
        enabled: true,
        dispatch_url: format!("{}/dispatch/device", dispatch.uri()),
        ws_scheme: "ws".to_string(),
        http_timeout: Duration::from_secs(2),
        registration_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(3600),
        reconnect: ReconnectSettings {
            delay_initial: Duration::from_millis(50),
            delay_max: Duration::from_millis(200),
            delay_multiplier: 2.0,
            max_attempts,
        },
        ..CloudSettings::default()
    }
}

/// Vendor dispatch that always points at `cloud_port`.
pub async fn mock_dispatch(cloud_port: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/dispatch/device"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": 0,
            "reason": "ok",
            "IP": "127.0.0.1",
            "port": cloud_port,
        })))
        .mount(&server)
        .await;
    server
}

// =============================================================================
// Frames
// =============================================================================

/// A device `register` frame.
pub fn register_frame(device_id: &str, apikey: &str) -> Value {
    json!({
        "action": "register",
        "deviceid": device_id,
        "apikey": apikey,
        "userAgent": "device",
        "sequence": "1700000000001",
        "ts": 0,
        "version": 8,
        "romVersion": "3.5.0",
        "model": "PSF-B01-GL",
    })
}

/// A device `update` frame.
pub fn update_frame(device_id: &str, switch: &str) -> Value {
    json!({
        "action": "update",
        "deviceid": device_id,
        "apikey": LOCAL_KEY,
        "userAgent": "device",
        "sequence": "1700000000002",
        "params": { "switch": switch },
    })
}

/// A dispatch request body.
pub fn dispatch_body(device_id: &str, apikey: &str) -> Value {
    json!({
        "accept": "ws",
        "version": 8,
        "ts": 0,
        "deviceid": device_id,
        "apikey": apikey,
        "model": "PSF-B01-GL",
        "romVersion": "3.5.0",
    })
}

// =============================================================================
// Device Client
// =============================================================================

/// A device's side of a gateway socket.
pub struct DeviceClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl DeviceClient {
    /// Connect to `/api/ws` on `addr`.
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = timeout(
            STEP_TIMEOUT,
            tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws")),
        )
        .await
        .unwrap()
        .unwrap();
        Self { ws }
    }

    pub async fn send_json(&mut self, frame: &Value) {
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    pub async fn ping(&mut self) {
        self.ws
            .send(Message::Ping(Vec::<u8>::new().into()))
            .await
            .unwrap();
    }

    /// Next JSON frame from the gateway.
    pub async fn recv_json(&mut self) -> Value {
        timeout(STEP_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str::<Value>(text.as_str()).unwrap();
                    }
                    Some(Ok(Message::Close(frame))) => panic!("socket closed: {frame:?}"),
                    Some(Ok(_)) => {}
                    other => panic!("socket ended: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    /// Wait for the gateway to close the socket, skipping other frames.
    pub async fn recv_close(&mut self) -> Option<CloseFrame> {
        timeout(STEP_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => {}
                    _ => return None,
                }
            }
        })
        .await
        .expect("timed out waiting for close")
    }

    /// Send `register` and return the reply.
    pub async fn register(&mut self, device_id: &str, apikey: &str) -> Value {
        self.send_json(&register_frame(device_id, apikey)).await;
        self.recv_json().await
    }
}

// =============================================================================
// Fake Cloud
// =============================================================================

/// Stand-in for the vendor cloud WebSocket server.
pub struct FakeCloud {
    listener: TcpListener,
}

impl FakeCloud {
    pub async fn start() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Accept the next gateway session.
    pub async fn accept(&self) -> CloudPeer {
        let (stream, _) = timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("gateway never connected to the cloud")
            .unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        CloudPeer { ws }
    }
}

/// The cloud's side of one gateway session.
pub struct CloudPeer {
    ws: WebSocketStream<TcpStream>,
}

impl CloudPeer {
    pub async fn send_json(&mut self, frame: &Value) {
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn recv_json(&mut self) -> Value {
        timeout(STEP_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str::<Value>(text.as_str()).unwrap();
                    }
                    Some(Ok(Message::Close(frame))) => panic!("cloud session closed: {frame:?}"),
                    Some(Ok(_)) => {}
                    other => panic!("cloud session ended: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for a cloud frame")
    }

    /// Wait for the gateway to close the session.
    pub async fn recv_close(&mut self) -> Option<CloseFrame> {
        timeout(STEP_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => {}
                    _ => return None,
                }
            }
        })
        .await
        .expect("timed out waiting for cloud close")
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    /// Accept the registration the gateway sends first.
    pub async fn accept_registration(&mut self, cloud_key: &str) -> Value {
        let register = self.recv_json().await;
        self.send_json(&json!({
            "error": 0,
            "deviceid": register["deviceid"],
            "apikey": cloud_key,
            "config": { "hb": 1, "hbInterval": 145 },
        }))
        .await;
        register
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// =============================================================================
// Waiting
// =============================================================================

/// Next event matching `predicate`.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<GatewayEvent>,
    predicate: impl Fn(&GatewayEvent) -> bool,
) -> GatewayEvent {
    timeout(STEP_TIMEOUT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(STEP_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Fail if `future` finishes within `window`.
pub async fn assert_pending<F: Future>(future: F, window: Duration) {
    assert!(timeout(window, future).await.is_err());
}

//! Local Session Integration Tests
//!
//! Device sockets against a gateway with cloud relaying switched off:
//! replies, duplicate connections, commands to devices that are not fully
//! online, and dispatch over real HTTP.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use serde_json::json;

use tokio::net::TcpStream;

use common::{
    LOCAL_KEY, TestGateway, assert_pending, cloud_disabled, dispatch_body, local_settings,
    wait_for_event, wait_until,
};
use ewelink_gateway::{
    CommandError, ConnectionState, DeviceFilter, DeviceId, GatewayEvent, LocalSettings,
    SwitchState,
};

const DEVICE: &str = "1000f0e1d2";
const DEVICE_KEY: &str = "device-real-key-1234";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replies_follow_request_order() {
    let gateway = TestGateway::start(cloud_disabled()).await;
    let mut device = gateway.connect_device().await;

    // Register and query back to back: replies come back in the same order.
    device
        .send_json(&common::register_frame(DEVICE, DEVICE_KEY))
        .await;
    device
        .send_json(&json!({
            "action": "query",
            "deviceid": DEVICE,
            "apikey": LOCAL_KEY,
            "userAgent": "device",
            "sequence": "1700000000003",
            "params": ["switch"],
        }))
        .await;

    let register = device.recv_json().await;
    assert_eq!(register["config"]["hbInterval"], 145);
    let query = device.recv_json().await;
    assert_eq!(query["error"], 0);
    assert_eq!(query["deviceid"], DEVICE);
    assert!(query.get("config").is_none());

    device
        .send_json(&json!({
            "action": "date",
            "deviceid": DEVICE,
            "apikey": LOCAL_KEY,
            "userAgent": "device",
        }))
        .await;
    let date = device.recv_json().await;
    assert_eq!(date["error"], 0);
    assert!(date["date"].as_str().unwrap().ends_with('Z'));

    let snapshot = gateway.registry.snapshot(&DeviceId::from(DEVICE)).unwrap();
    assert_eq!(snapshot.local_state, ConnectionState::Online);
    assert_eq!(snapshot.stats.query_requests, 1);
    assert_eq!(snapshot.stats.date_requests, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_socket_replaces_the_first() {
    let gateway = TestGateway::start(cloud_disabled()).await;
    let mut events = gateway.events.subscribe();
    let id = DeviceId::from(DEVICE);

    let mut first = gateway.connect_device().await;
    first.register(DEVICE, DEVICE_KEY).await;
    let mut second = gateway.connect_device().await;
    let reply = second.register(DEVICE, DEVICE_KEY).await;
    assert_eq!(reply["error"], 0);

    let close = first.recv_close().await.unwrap();
    assert_eq!(u16::from(close.code), 1001);
    assert_eq!(close.reason.as_str(), "replaced");

    // The evicted socket closing is not a device disconnect.
    assert_pending(
        wait_for_event(&mut events, |event| {
            matches!(event, GatewayEvent::DeviceDisconnected { .. })
        }),
        Duration::from_millis(300),
    )
    .await;

    // The surviving socket still carries commands.
    second.ping().await;
    wait_until(|| {
        gateway.registry.snapshot(&id).unwrap().local_state == ConnectionState::Online
    })
    .await;
    gateway.commands.switch_device(&id, SwitchState::Off).unwrap();
    let command = second.recv_json().await;
    assert_eq!(command["params"]["switch"], "off");
    assert_eq!(gateway.registry.counts().local_links, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_need_a_live_device() {
    let gateway = TestGateway::start(cloud_disabled()).await;
    let id = DeviceId::from(DEVICE);

    // Dispatch alone makes the device known but not reachable.
    let (status, _) = gateway.dispatch(&dispatch_body(DEVICE, DEVICE_KEY)).await;
    assert_eq!(status, 200);
    assert_eq!(
        gateway.commands.switch_device(&id, SwitchState::On),
        Err(CommandError::DeviceNotOnline(id.clone()))
    );

    let unknown = DeviceId::from("1000ffffff");
    assert_eq!(
        gateway.commands.switch_device(&unknown, SwitchState::On),
        Err(CommandError::UnknownDevice(unknown.clone()))
    );
    assert_eq!(
        gateway.commands.kick_device(&unknown),
        Err(CommandError::UnknownDevice(unknown))
    );

    let listed = gateway.commands.list_devices(DeviceFilter::All);
    assert_eq!(listed.len(), 1);
    assert!(gateway.commands.list_devices(DeviceFilter::Online).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_leaving_is_reported_once() {
    let gateway = TestGateway::start(cloud_disabled()).await;
    let mut events = gateway.events.subscribe();
    let id = DeviceId::from(DEVICE);

    let mut device = gateway.connect_device().await;
    device.register(DEVICE, DEVICE_KEY).await;
    wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::DeviceRegistered { .. })
    })
    .await;

    drop(device);
    let event = wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::DeviceDisconnected { .. })
    })
    .await;
    assert_eq!(event.device_id(), &id);
    assert_eq!(
        gateway.registry.snapshot(&id).unwrap().local_state,
        ConnectionState::Offline
    );
    assert_eq!(gateway.registry.counts().local_links, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatch_over_http() {
    let gateway = TestGateway::start(cloud_disabled()).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/dispatch/device", gateway.addrs.legacy);

    let response = client
        .post(&url)
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(response.headers()["server"], "openresty");
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], 400);

    let (status, body) = gateway.dispatch(&json!({ "apikey": DEVICE_KEY })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], 400);
    assert_eq!(gateway.registry.counts().total, 0);

    let response = client
        .get(format!("http://{}/api/user/device", gateway.addrs.legacy))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frame_is_ignored() {
    let gateway = TestGateway::start(cloud_disabled()).await;
    let mut device = gateway.connect_device().await;

    device.send_text("{\"action\": \"register\", ").await;
    device.send_text("not json at all").await;

    let reply = device.register(DEVICE, DEVICE_KEY).await;
    assert_eq!(reply["error"], 0);
    assert_eq!(reply["deviceid"], DEVICE);
    assert_eq!(gateway.registry.counts().local_links, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unidentified_socket_is_closed() {
    let local = LocalSettings {
        identification_timeout: Duration::from_millis(200),
        ..local_settings()
    };
    let gateway = TestGateway::start_with(local, cloud_disabled()).await;
    let mut device = gateway.connect_device().await;

    let close = device.recv_close().await.unwrap();
    assert_eq!(u16::from(close.code), 1008);
    assert_eq!(close.reason.as_str(), "identification timeout");
    assert_eq!(gateway.registry.counts().total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_that_stops_pinging_is_closed() {
    let local = LocalSettings {
        ping_timeout: Duration::from_millis(200),
        ping_check_interval: Duration::from_millis(50),
        ..local_settings()
    };
    let gateway = TestGateway::start_with(local, cloud_disabled()).await;
    let mut events = gateway.events.subscribe();
    let id = DeviceId::from(DEVICE);

    let mut device = gateway.connect_device().await;
    device.register(DEVICE, DEVICE_KEY).await;

    let close = device.recv_close().await.unwrap();
    assert_eq!(u16::from(close.code), 1001);
    assert_eq!(close.reason.as_str(), "ping timeout");

    let event = wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::DeviceDisconnected { .. })
    })
    .await;
    let GatewayEvent::DeviceDisconnected { reason, .. } = event else {
        unreachable!();
    };
    assert_eq!(reason, "ping timeout");
    assert_eq!(
        gateway.registry.snapshot(&id).unwrap().local_state,
        ConnectionState::Offline
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_message_stall_keeps_socket_open() {
    let local = LocalSettings {
        first_message_timeout: Duration::from_millis(100),
        ..local_settings()
    };
    let gateway = TestGateway::start_with(local, cloud_disabled()).await;
    let id = DeviceId::from(DEVICE);

    // Dispatch from the same address lets the socket be matched to the device.
    gateway.dispatch(&dispatch_body(DEVICE, DEVICE_KEY)).await;
    let mut device = gateway.connect_device().await;
    wait_until(|| gateway.registry.snapshot(&id).unwrap().stats.first_message_stalls == 1).await;

    let reply = device.register(DEVICE, DEVICE_KEY).await;
    assert_eq!(reply["error"], 0);
    assert_eq!(
        gateway.registry.snapshot(&id).unwrap().local_state,
        ConnectionState::Registered
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_tls_peer_does_not_block_secure_dispatch() {
    let gateway = TestGateway::start(cloud_disabled()).await;
    let _silent = TcpStream::connect(gateway.addrs.dispatch).await.unwrap();

    let (status, reply) = tokio::time::timeout(
        Duration::from_secs(2),
        gateway.dispatch_secure(&dispatch_body(DEVICE, DEVICE_KEY)),
    )
    .await
    .expect("secure dispatch stalled behind a silent peer");
    assert_eq!(status, 200);
    assert_eq!(reply["port"], gateway.addrs.modern.port());
}

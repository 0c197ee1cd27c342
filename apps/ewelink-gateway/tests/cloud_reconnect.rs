//! Cloud Reconnection Integration Tests
//!
//! A cloud session that drops after a successful registration is retried
//! with backoff while the device stays online locally, and given up once the
//! retry budget is spent.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use common::{
    FakeCloud, TestGateway, assert_pending, cloud_settings, mock_dispatch, wait_for_event,
    wait_until,
};
use ewelink_gateway::{ConnectionState, DeviceId, GatewayEvent};

const DEVICE: &str = "1000d4e5f6";
const DEVICE_KEY: &str = "device-real-key-1234";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_session_is_retried_then_abandoned() {
    let cloud = FakeCloud::start().await;
    let dispatch = mock_dispatch(cloud.port()).await;
    let gateway = TestGateway::start(cloud_settings(&dispatch, 2)).await;
    let mut events = gateway.events.subscribe();
    let id = DeviceId::from(DEVICE);

    let mut device = gateway.connect_device().await;
    device.register(DEVICE, DEVICE_KEY).await;
    device.ping().await;

    let mut peer = cloud.accept().await;
    peer.accept_registration("cloud-key-1").await;
    wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::CloudConnectionEstablished { .. })
    })
    .await;
    wait_until(|| gateway.registry.snapshot(&id).unwrap().is_online).await;

    // Cloud drops the session: the gateway comes back and registers again.
    peer.close().await;
    wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::CloudConnectionClosed { .. })
    })
    .await;

    let mut peer = cloud.accept().await;
    let register = peer.recv_json().await;
    assert_eq!(register["action"], "register");
    assert_eq!(register["apikey"], DEVICE_KEY);

    // Stop listening, then drop the unregistered session: every further
    // attempt fails until the budget is spent.
    drop(cloud);
    peer.close().await;

    let event = wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::CloudConnectionFailed { .. })
    })
    .await;
    let GatewayEvent::CloudConnectionFailed { reason, .. } = event else {
        unreachable!();
    };
    assert_eq!(reason, "max reconnect attempts");

    wait_until(|| gateway.manager.active_cycles() == 0).await;
    let snapshot = gateway.registry.snapshot(&id).unwrap();
    assert_eq!(snapshot.cloud_state, ConnectionState::Offline);
    assert_eq!(snapshot.local_state, ConnectionState::Online);
    assert!(!snapshot.is_online);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_retry_once_device_is_gone() {
    let cloud = FakeCloud::start().await;
    let dispatch = mock_dispatch(cloud.port()).await;
    let gateway = TestGateway::start(cloud_settings(&dispatch, 5)).await;
    let mut events = gateway.events.subscribe();

    let mut device = gateway.connect_device().await;
    device.register(DEVICE, DEVICE_KEY).await;
    device.ping().await;

    let mut peer = cloud.accept().await;
    peer.accept_registration("cloud-key-1").await;
    wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::CloudConnectionEstablished { .. })
    })
    .await;

    // The device leaving tears down the cloud session for good.
    drop(device);
    wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::DeviceDisconnected { .. })
    })
    .await;
    assert!(peer.recv_close().await.is_some());

    wait_until(|| gateway.manager.active_cycles() == 0).await;
    assert_pending(cloud.accept(), Duration::from_millis(500)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registration_timeout_fails_without_retry() {
    let cloud = FakeCloud::start().await;
    let dispatch = mock_dispatch(cloud.port()).await;
    let mut settings = cloud_settings(&dispatch, 5);
    settings.registration_timeout = Duration::from_millis(200);
    let gateway = TestGateway::start(settings).await;
    let mut events = gateway.events.subscribe();

    let mut device = gateway.connect_device().await;
    device.register(DEVICE, DEVICE_KEY).await;

    let mut peer = cloud.accept().await;
    peer.recv_json().await;

    let close = peer.recv_close().await.unwrap();
    assert_eq!(u16::from(close.code), 1008);
    let event = wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::CloudConnectionFailed { .. })
    })
    .await;
    let GatewayEvent::CloudConnectionFailed { reason, .. } = event else {
        unreachable!();
    };
    assert_eq!(reason, "registration timeout");
    wait_until(|| gateway.manager.active_cycles() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_stop_at_max_attempts() {
    let cloud = FakeCloud::start().await;
    let dispatch = mock_dispatch(cloud.port()).await;
    let gateway = TestGateway::start(cloud_settings(&dispatch, 2)).await;
    let mut events = gateway.events.subscribe();

    let mut device = gateway.connect_device().await;
    device.register(DEVICE, DEVICE_KEY).await;
    device.ping().await;

    let mut peer = cloud.accept().await;
    peer.accept_registration("cloud-key-1").await;
    wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::CloudConnectionEstablished { .. })
    })
    .await;
    peer.close().await;

    // Each retry is answered and then dropped before registration.
    for _ in 0..2 {
        let mut peer = cloud.accept().await;
        assert_eq!(peer.recv_json().await["action"], "register");
        peer.close().await;
    }

    let event = wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::CloudConnectionFailed { .. })
    })
    .await;
    let GatewayEvent::CloudConnectionFailed { reason, .. } = event else {
        unreachable!();
    };
    assert_eq!(reason, "max reconnect attempts");
    wait_until(|| gateway.manager.active_cycles() == 0).await;
    assert_pending(cloud.accept(), Duration::from_millis(500)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_session_dropped_before_registration_is_reported() {
    let cloud = FakeCloud::start().await;
    let dispatch = mock_dispatch(cloud.port()).await;
    let gateway = TestGateway::start(cloud_settings(&dispatch, 5)).await;
    let mut events = gateway.events.subscribe();
    let id = DeviceId::from(DEVICE);

    let mut device = gateway.connect_device().await;
    device.register(DEVICE, DEVICE_KEY).await;
    device.ping().await;

    let mut peer = cloud.accept().await;
    peer.recv_json().await;
    peer.close().await;

    let event = wait_for_event(&mut events, |event| {
        matches!(event, GatewayEvent::CloudConnectionFailed { .. })
    })
    .await;
    let GatewayEvent::CloudConnectionFailed { reason, .. } = event else {
        unreachable!();
    };
    assert_eq!(reason, "closed before registration");

    wait_until(|| gateway.manager.active_cycles() == 0).await;
    assert_eq!(
        gateway.registry.snapshot(&id).unwrap().cloud_state,
        ConnectionState::Offline
    );
    assert_pending(cloud.accept(), Duration::from_millis(300)).await;
}

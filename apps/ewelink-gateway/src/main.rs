//! eWeLink Gateway Binary
//!
//! Starts the device-facing listeners, the cloud connection manager and the
//! health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ewelink-gateway
//! ```
//!
//! # Environment Variables
//!
//! - `GATEWAY_SERVER_IP`: Address handed to devices in dispatch replies
//! - `GATEWAY_BIND_ADDR`: Listener bind address (default: 0.0.0.0)
//! - `GATEWAY_LEGACY_PORT` / `GATEWAY_DISPATCH_PORT` / `GATEWAY_MODERN_WS_PORT`:
//!   Device listener ports (default: 8081 / 443 / 8082)
//! - `GATEWAY_HEALTH_PORT`: Health check HTTP port (default: 9100)
//! - `GATEWAY_TLS_CERT_PATH` / `GATEWAY_TLS_KEY_PATH`: PEM files (default:
//!   self-signed)
//! - `GATEWAY_LOCAL_APIKEY`: Key handed to devices
//! - `GATEWAY_CLOUD_ENABLED`: Mirror devices to the vendor cloud (default: true)
//! - `GATEWAY_CLOUD_DISPATCH_URL`: Vendor dispatch endpoint
//! - `OTEL_ENABLED`: Export traces over OTLP (default: false)
//! - `RUST_LOG`: Log filter (default: `ewelink_gateway=info`)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ewelink_gateway::infrastructure::telemetry;
use ewelink_gateway::{
    CloudConnectionManager, CloudServices, CommandService, DeviceFilter, DeviceRegistry,
    DispatchService, EventBus, GatewayConfig, GatewayEvent, HealthServer, HealthServerState,
    HttpCloudDiscovery, LocalListeners, LocalServerState, MessageRelay, ServerTls, SharedEventBus,
    init_metrics, insecure_client_config,
};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Period of the device status summary log.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting eWeLink gateway");

    let _metrics_handle = init_metrics();

    let config = GatewayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let events = Arc::new(EventBus::new(config.event_capacity));
    let registry = Arc::new(DeviceRegistry::new());
    let relay = MessageRelay::new(Arc::clone(&registry), config.local.local_apikey.clone());

    // Device-facing listeners
    let tls = ServerTls::from_settings(&config.tls, &config.server.server_ip)
        .context("failed to load TLS material")?;
    let listeners = LocalListeners::bind(&config.server, &tls)
        .await
        .context("failed to bind device listeners")?;
    let local_state = Arc::new(LocalServerState {
        registry: Arc::clone(&registry),
        events: Arc::clone(&events),
        relay: relay.clone(),
        dispatch: DispatchService::new(Arc::clone(&registry), &config.server),
        settings: config.local.clone(),
        shutdown: shutdown_token.clone(),
    });

    // Cloud manager
    let cloud_services = CloudServices {
        registry: Arc::clone(&registry),
        events: Arc::clone(&events),
        relay: relay.clone(),
        discovery: Arc::new(
            HttpCloudDiscovery::from_settings(&config.cloud)
                .context("failed to build dispatch client")?,
        ),
        settings: config.cloud.clone(),
        tls: insecure_client_config().context("failed to build cloud TLS client")?,
    };
    let cloud_manager = Arc::new(CloudConnectionManager::new(
        cloud_services,
        shutdown_token.clone(),
    ));
    cloud_manager.spawn();

    let commands = CommandService::new(
        Arc::clone(&registry),
        Arc::new(relay),
        Arc::clone(&events),
    )
    .with_cloud_sessions(cloud_manager);

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&registry),
        Arc::clone(&events),
        config.cloud.enabled,
    ));
    let health_server = HealthServer::new(
        SocketAddr::new(config.server.bind_addr, config.server.health_port),
        Arc::clone(&health_state),
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tokio::spawn(log_events(Arc::clone(&events), shutdown_token.clone()));
    tokio::spawn(log_status(commands, shutdown_token.clone()));

    let local_task = tokio::spawn(async move {
        if let Err(e) = listeners.serve(local_state).await {
            tracing::error!(error = %e, "Device listeners failed");
        }
    });

    health_state.set_ready(true);
    tracing::info!("Gateway ready");

    await_shutdown(shutdown_token).await;
    health_state.set_ready(false);

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, local_task).await.is_err() {
        tracing::warn!("Device listeners did not stop in time");
    }

    tracing::info!("Gateway stopped");
    Ok(())
}

/// Log every lifecycle event.
async fn log_events(events: SharedEventBus, cancel: CancellationToken) {
    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn log_event(event: &GatewayEvent) {
    match event {
        GatewayEvent::DeviceUpdated { params, origin, .. } => tracing::info!(
            event = event.name(),
            device_id = %event.device_id(),
            params = %params,
            origin = ?origin,
            "Device event"
        ),
        GatewayEvent::DeviceDisconnected { reason, .. }
        | GatewayEvent::CloudConnectionFailed { reason, .. } => tracing::info!(
            event = event.name(),
            device_id = %event.device_id(),
            reason = %reason,
            "Device event"
        ),
        _ => tracing::info!(
            event = event.name(),
            device_id = %event.device_id(),
            "Device event"
        ),
    }
}

/// Periodically log which devices are online.
async fn log_status(commands: CommandService, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let known = commands.list_devices(DeviceFilter::All).len();
                let online: Vec<String> = commands
                    .list_devices(DeviceFilter::Online)
                    .into_iter()
                    .map(|device| device.alias)
                    .collect();
                tracing::info!(known, online = ?online, "Device status");
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        server_ip = %config.server.server_ip,
        legacy_port = config.server.legacy_port,
        dispatch_port = config.server.dispatch_port,
        modern_ws_port = config.server.modern_ws_port,
        health_port = config.server.health_port,
        cloud_enabled = config.cloud.enabled,
        "Configuration loaded"
    );
    tracing::debug!(
        dispatch_url = %config.cloud.dispatch_url,
        local_apikey = %config.local.local_apikey.preview(),
        "Cloud endpoints"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}

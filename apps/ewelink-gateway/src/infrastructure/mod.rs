//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the device registry, the device-facing listeners,
//! the vendor cloud adapters, and the ambient runtime pieces.

/// Configuration loaded from the environment.
pub mod config;

/// Lifecycle event bus.
pub mod events;

/// In-memory device registry and live link handles.
pub mod registry;

/// Device-facing dispatch and WebSocket listeners.
pub mod local;

/// Vendor cloud sessions.
pub mod cloud;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing setup.
pub mod telemetry;

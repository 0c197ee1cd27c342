//! Application Layer - Use cases and port definitions.
//!
//! The message relay and the operator command interface, plus the port
//! interfaces the cloud adapters implement.

/// Port interfaces for the vendor cloud.
pub mod ports;

/// Message relay and command services.
pub mod services;

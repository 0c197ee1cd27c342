//! Domain Layer - Device model and protocol frames.
//!
//! Pure types with no I/O. Everything here is plain data plus
//! serialization support.

/// Per-device state, credentials and list filters.
pub mod device;

/// eWeLink JSON frame builders and classifiers.
pub mod protocol;

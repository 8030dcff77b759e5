//! RustCadence - BLE Crank Cadence Monitor
//!
//! Connects to a Bluetooth cycling speed/cadence sensor, keeps the link up
//! across transient failures with bounded exponential backoff, and turns
//! CSC Measurement notifications into a cadence in revolutions per minute.

pub mod metrics;
pub mod sensors;
pub mod storage;

// Re-export commonly used types
pub use metrics::cadence::{CadenceCalculator, CadenceEstimate};
pub use sensors::manager::ConnectionManager;
pub use sensors::types::{ConnectionState, SessionUpdate};
pub use storage::config::AppConfig;

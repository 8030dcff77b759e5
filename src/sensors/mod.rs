//! Sensor module for BLE cadence sensor communication.

pub mod ble;
pub mod csc;
pub mod manager;
pub mod retry;
pub mod simulated;
pub mod transport;
pub mod types;

pub use ble::BleTransport;
pub use csc::{
    parse_csc_measurement, CrankSample, CscMeasurement, DecodeError, PayloadLayout, SampleFlags,
    CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID,
};
pub use manager::{ConnectionManager, Session, SessionConfig};
pub use retry::{BackoffRetrier, CancelToken, PendingRetry, RetryError, RetryPolicy};
pub use simulated::SimulatedTransport;
pub use transport::{DeviceFilter, DeviceInfo, NotificationStream, SensorTransport, TransportEvent};
pub use types::{ConnectionState, SensorError, SessionInput, SessionUpdate};

//! Boundary between the session logic and the wireless stack.
//!
//! A transport locates a device, brings up the link, enables notifications
//! on one characteristic and reports when the link drops. [`BleTransport`]
//! talks to real hardware; [`SimulatedTransport`] generates data locally.
//!
//! [`BleTransport`]: crate::sensors::ble::BleTransport
//! [`SimulatedTransport`]: crate::sensors::simulated::SimulatedTransport

use crate::sensors::types::SensorError;
use futures::stream::Stream;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Criteria for picking a device during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Service the device must advertise
    pub service: Uuid,
    /// Required prefix of the advertised name (if any)
    pub name_prefix: Option<String>,
}

impl DeviceFilter {
    /// Filter on a service only.
    pub fn for_service(service: Uuid) -> Self {
        Self {
            service,
            name_prefix: None,
        }
    }

    /// Whether an advertised name passes the prefix check.
    pub fn matches_name(&self, name: &str) -> bool {
        self.name_prefix
            .as_deref()
            .map_or(true, |prefix| name.starts_with(prefix))
    }
}

/// A device returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Transport-specific device identifier
    pub device_id: String,
    /// User-friendly name (from advertisement)
    pub name: String,
}

/// Events delivered on an active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw characteristic value
    Notification(Vec<u8>),
    /// The link to the device dropped
    Disconnected,
}

/// Ordered stream of events for one subscription. The stream ending is
/// equivalent to [`TransportEvent::Disconnected`].
pub type NotificationStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Capabilities the session needs from the wireless stack.
pub trait SensorTransport: Send + Sync + 'static {
    /// Find a device matching the filter
    fn request_device(
        &self,
        filter: &DeviceFilter,
    ) -> impl Future<Output = Result<DeviceInfo, SensorError>> + Send;

    /// Bring up the link and discover services
    fn connect(
        &self,
        device: &DeviceInfo,
    ) -> impl Future<Output = Result<(), SensorError>> + Send;

    /// Enable notifications on `characteristic` of `service`
    fn start_notifications(
        &self,
        device: &DeviceInfo,
        service: Uuid,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<NotificationStream, SensorError>> + Send;

    /// Disable notifications on `characteristic`
    fn stop_notifications(
        &self,
        device: &DeviceInfo,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<(), SensorError>> + Send;

    /// Drop the link
    fn disconnect(
        &self,
        device: &DeviceInfo,
    ) -> impl Future<Output = Result<(), SensorError>> + Send;

    /// Forget a device returned by discovery. It must be discovered again
    /// before the next connect.
    fn release_device(&self, device: &DeviceInfo) -> impl Future<Output = ()> + Send;
}

//! BLE transport built on btleplug.
//!
//! Scans for a peripheral advertising the requested service, connects,
//! subscribes to one characteristic and merges the peripheral's
//! notification stream with the adapter's disconnect events.

use crate::sensors::transport::{
    DeviceFilter, DeviceInfo, NotificationStream, SensorTransport, TransportEvent,
};
use crate::sensors::types::SensorError;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// btleplug-backed [`SensorTransport`].
pub struct BleTransport {
    /// BLE adapter
    adapter: Adapter,
    /// How long discovery may scan
    scan_timeout: Duration,
    /// Peripherals found by discovery (device_id -> Peripheral)
    peripherals: Mutex<HashMap<String, Peripheral>>,
}

impl BleTransport {
    /// Open the first BLE adapter on the system.
    pub async fn new(scan_timeout: Duration) -> Result<Self, SensorError> {
        tracing::info!("Initializing BLE transport");

        let manager = Manager::new()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(SensorError::AdapterNotFound)?;

        tracing::info!("BLE adapter initialized");

        Ok(Self {
            adapter,
            scan_timeout,
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    /// Describe a peripheral if it matches the filter.
    async fn classify_peripheral(
        peripheral: &Peripheral,
        filter: &DeviceFilter,
    ) -> Option<DeviceInfo> {
        let properties = peripheral.properties().await.ok()??;

        // Some platforms omit service UUIDs from scan results even when the
        // scan itself was filtered by service
        if !properties.services.is_empty() && !properties.services.contains(&filter.service) {
            return None;
        }

        let name = properties
            .local_name
            .unwrap_or_else(|| "Unknown Sensor".to_string());

        if !filter.matches_name(&name) {
            return None;
        }

        Some(DeviceInfo {
            device_id: peripheral.id().to_string(),
            name,
        })
    }

    /// Scan until a matching peripheral shows up.
    async fn scan_for(&self, filter: &DeviceFilter) -> Result<(Peripheral, DeviceInfo), SensorError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        // Already-known peripherals never produce a DeviceDiscovered event
        let known = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;
        for peripheral in known {
            if let Some(info) = Self::classify_peripheral(&peripheral, filter).await {
                return Ok((peripheral, info));
            }
        }

        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };

            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                continue;
            };

            if let Some(info) = Self::classify_peripheral(&peripheral, filter).await {
                return Ok((peripheral, info));
            }
        }

        Err(SensorError::BleError("Adapter event stream ended".to_string()))
    }

    /// Look up a peripheral returned by discovery.
    async fn peripheral(&self, device: &DeviceInfo) -> Result<Peripheral, SensorError> {
        self.peripherals
            .lock()
            .await
            .get(&device.device_id)
            .cloned()
            .ok_or_else(|| SensorError::DeviceNotFound(device.device_id.clone()))
    }
}

impl SensorTransport for BleTransport {
    async fn request_device(&self, filter: &DeviceFilter) -> Result<DeviceInfo, SensorError> {
        tracing::info!("Scanning for devices advertising {}", filter.service);

        self.adapter
            .start_scan(ScanFilter {
                services: vec![filter.service],
            })
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let found = tokio::time::timeout(self.scan_timeout, self.scan_for(filter)).await;

        if let Err(e) = self.adapter.stop_scan().await {
            tracing::warn!("Failed to stop scanning: {}", e);
        }

        let (peripheral, info) = match found {
            Ok(result) => result?,
            Err(_) => {
                return Err(SensorError::DeviceNotFound(format!(
                    "nothing found within {}s",
                    self.scan_timeout.as_secs()
                )))
            }
        };

        tracing::info!("Discovered {} ({})", info.name, info.device_id);
        self.peripherals
            .lock()
            .await
            .insert(info.device_id.clone(), peripheral);

        Ok(info)
    }

    async fn connect(&self, device: &DeviceInfo) -> Result<(), SensorError> {
        let peripheral = self.peripheral(device).await?;

        let connected = peripheral.is_connected().await.unwrap_or(false);
        if !connected {
            peripheral
                .connect()
                .await
                .map_err(|e| SensorError::ConnectionFailed(e.to_string()))?;
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| SensorError::ConnectionFailed(e.to_string()))?;

        Ok(())
    }

    async fn start_notifications(
        &self,
        device: &DeviceInfo,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, SensorError> {
        let peripheral = self.peripheral(device).await?;

        let csc_service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| SensorError::ServiceNotFound(service.to_string()))?;

        let target = csc_service
            .characteristics
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| SensorError::CharacteristicNotFound(characteristic.to_string()))?;

        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| SensorError::SubscriptionFailed(e.to_string()))?;

        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| SensorError::SubscriptionFailed(e.to_string()))?;

        tracing::debug!("Subscribed to characteristic: {}", characteristic);

        let central_events = self
            .adapter
            .events()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let values = notifications
            .filter(move |n| future::ready(n.uuid == characteristic))
            .map(|n| TransportEvent::Notification(n.value));

        let peripheral_id = peripheral.id();
        let lost = central_events.filter_map(move |event| {
            future::ready(match event {
                CentralEvent::DeviceDisconnected(id) if id == peripheral_id => {
                    Some(TransportEvent::Disconnected)
                }
                _ => None,
            })
        });

        Ok(Box::pin(stream::select(values, lost)))
    }

    async fn stop_notifications(
        &self,
        device: &DeviceInfo,
        characteristic: Uuid,
    ) -> Result<(), SensorError> {
        let peripheral = self.peripheral(device).await?;

        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| SensorError::CharacteristicNotFound(characteristic.to_string()))?;

        peripheral
            .unsubscribe(&target)
            .await
            .map_err(|e| SensorError::UnsubscribeFailed(e.to_string()))
    }

    async fn disconnect(&self, device: &DeviceInfo) -> Result<(), SensorError> {
        let peripheral = self.peripheral(device).await?;

        peripheral
            .disconnect()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))
    }

    async fn release_device(&self, device: &DeviceInfo) {
        if self
            .peripherals
            .lock()
            .await
            .remove(&device.device_id)
            .is_some()
        {
            tracing::debug!("Released {} ({})", device.name, device.device_id);
        }
    }
}

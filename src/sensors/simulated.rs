//! Simulated cadence sensor.
//!
//! Emits crank-only CSC Measurement payloads for a steady cadence. Between
//! crank events the payload repeats, as real sensors do, and the link can
//! be made to drop once after a fixed number of notifications.

use crate::sensors::csc::{build_crank_measurement, CrankSample};
use crate::sensors::transport::{
    DeviceFilter, DeviceInfo, NotificationStream, SensorTransport, TransportEvent,
};
use crate::sensors::types::SensorError;
use futures::stream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Crank event time ticks per second.
const TICKS_PER_SEC: f64 = 1024.0;

/// Name reported by discovery.
pub const SIMULATED_DEVICE_NAME: &str = "Simulated Cadence";

/// Generates the cumulative crank counters of a steady pedaling rider.
#[derive(Debug, Clone)]
pub struct CrankSimulator {
    /// Revolutions per second
    revs_per_sec: f64,
    /// Elapsed time in 1/1024 s
    elapsed_ticks: f64,
    /// Fractional cumulative revolutions
    revolutions: f64,
    /// Time of the last whole revolution
    last_event_ticks: f64,
}

impl CrankSimulator {
    /// Create a simulator for a cadence in RPM.
    pub fn new(rpm: f64) -> Self {
        Self {
            revs_per_sec: rpm.max(0.0) / 60.0,
            elapsed_ticks: 0.0,
            revolutions: 0.0,
            last_event_ticks: 0.0,
        }
    }

    /// Advance by `dt` and return the sample a sensor would report.
    pub fn advance(&mut self, dt: Duration) -> CrankSample {
        let secs = dt.as_secs_f64();
        let before = self.revolutions.floor();

        self.elapsed_ticks += secs * TICKS_PER_SEC;
        self.revolutions += self.revs_per_sec * secs;

        if self.revolutions.floor() > before {
            let since_event = self.revolutions.fract() / self.revs_per_sec;
            self.last_event_ticks = self.elapsed_ticks - since_event * TICKS_PER_SEC;
        }

        self.sample()
    }

    /// Current counters, wrapped to 16 bits.
    pub fn sample(&self) -> CrankSample {
        CrankSample {
            crank_revolutions: (self.revolutions.floor() as u64 % 65536) as u16,
            crank_event_time: (self.last_event_ticks.round() as u64 % 65536) as u16,
        }
    }
}

/// [`SensorTransport`] that needs no hardware.
#[derive(Debug)]
pub struct SimulatedTransport {
    /// Simulated cadence
    rpm: f64,
    /// Notification period
    interval: Duration,
    /// Drop the link once after this many notifications
    drop_after: Option<u32>,
    /// Whether the one-shot link drop already happened
    dropped: Arc<AtomicBool>,
}

impl SimulatedTransport {
    /// Create a simulated sensor.
    pub fn new(rpm: f64, interval: Duration, drop_after: Option<u32>) -> Self {
        Self {
            rpm,
            interval,
            drop_after,
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Per-subscription generator state.
struct StreamState {
    simulator: CrankSimulator,
    interval: Duration,
    sent: u32,
    drop_after: Option<u32>,
    dropped: Arc<AtomicBool>,
    done: bool,
}

impl SensorTransport for SimulatedTransport {
    async fn request_device(&self, filter: &DeviceFilter) -> Result<DeviceInfo, SensorError> {
        if !filter.matches_name(SIMULATED_DEVICE_NAME) {
            return Err(SensorError::DeviceNotFound(format!(
                "{} does not match the name filter",
                SIMULATED_DEVICE_NAME
            )));
        }

        Ok(DeviceInfo {
            device_id: "simulated-0".to_string(),
            name: SIMULATED_DEVICE_NAME.to_string(),
        })
    }

    async fn connect(&self, _device: &DeviceInfo) -> Result<(), SensorError> {
        Ok(())
    }

    async fn start_notifications(
        &self,
        _device: &DeviceInfo,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<NotificationStream, SensorError> {
        tracing::info!("Simulating {:.1} rpm every {:?}", self.rpm, self.interval);

        let state = StreamState {
            simulator: CrankSimulator::new(self.rpm),
            interval: self.interval,
            sent: 0,
            drop_after: self.drop_after,
            dropped: self.dropped.clone(),
            done: false,
        };

        let events = stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }

            tokio::time::sleep(state.interval).await;

            let drop_now = state.drop_after.is_some_and(|limit| state.sent >= limit)
                && !state.dropped.swap(true, Ordering::SeqCst);
            if drop_now {
                tracing::info!("Simulating link loss");
                state.done = true;
                return Some((TransportEvent::Disconnected, state));
            }

            let sample = state.simulator.advance(state.interval);
            state.sent += 1;
            Some((
                TransportEvent::Notification(build_crank_measurement(sample)),
                state,
            ))
        });

        Ok(Box::pin(events))
    }

    async fn stop_notifications(
        &self,
        _device: &DeviceInfo,
        _characteristic: Uuid,
    ) -> Result<(), SensorError> {
        Ok(())
    }

    async fn disconnect(&self, _device: &DeviceInfo) -> Result<(), SensorError> {
        Ok(())
    }

    async fn release_device(&self, _device: &DeviceInfo) {}
}

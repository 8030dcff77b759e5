//! Crank cadence derived from consecutive CSC crank samples.
//!
//! Cadence is computed from the revolution and event-time deltas between
//! the two most recent samples. Duplicate notifications (no new crank
//! event) keep the last valid reading instead of dropping to zero.

use crate::metrics::counter::{wrapping_diff, UINT16_MODULUS};
use crate::sensors::csc::{CrankSample, CscMeasurement};

/// Crank event time resolution (ticks per second).
pub const CRANK_TIME_TICKS_PER_SEC: f64 = 1024.0;

/// Latest cadence reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CadenceEstimate {
    /// Cadence in revolutions per minute
    pub rpm: f64,
    /// Whether a valid cadence has been computed yet
    pub present: bool,
}

impl CadenceEstimate {
    /// An estimate with no cadence yet.
    pub fn absent() -> Self {
        Self::default()
    }

    /// A valid estimate.
    pub fn from_rpm(rpm: f64) -> Self {
        Self { rpm, present: true }
    }

    /// The rpm value when present.
    pub fn value(&self) -> Option<f64> {
        self.present.then_some(self.rpm)
    }
}

impl std::fmt::Display for CadenceEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1} rpm", self.rpm)
    }
}

/// Turns consecutive crank samples into a cadence estimate.
#[derive(Debug, Default)]
pub struct CadenceCalculator {
    /// Sample the next delta is computed against
    previous: Option<CrankSample>,
    /// Last valid cadence in RPM
    last_cadence: Option<f64>,
}

impl CadenceCalculator {
    /// Create a new cadence calculator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a decoded measurement and return the current estimate.
    ///
    /// Measurements without crank data leave all state untouched.
    pub fn update(&mut self, measurement: &CscMeasurement) -> CadenceEstimate {
        match measurement.crank {
            Some(sample) => self.update_sample(sample),
            None => self.estimate(),
        }
    }

    /// Process one crank sample and return the current estimate.
    pub fn update_sample(&mut self, sample: CrankSample) -> CadenceEstimate {
        if let Some(previous) = self.previous {
            let time_diff = wrapping_diff(
                sample.crank_event_time as u32,
                previous.crank_event_time as u32,
                UINT16_MODULUS,
            );
            let rev_diff = wrapping_diff(
                sample.crank_revolutions as u32,
                previous.crank_revolutions as u32,
                UINT16_MODULUS,
            );

            if let (Some(ticks), Some(revs)) = (time_diff.delta(), rev_diff.delta()) {
                let rpm = (revs as f64 * CRANK_TIME_TICKS_PER_SEC / ticks as f64) * 60.0;
                self.last_cadence = Some(rpm);
            } else {
                tracing::trace!("No new crank event, holding last cadence");
            }
        }

        self.previous = Some(sample);
        self.estimate()
    }

    /// Current estimate without processing anything.
    pub fn estimate(&self) -> CadenceEstimate {
        self.last_cadence
            .map(CadenceEstimate::from_rpm)
            .unwrap_or_default()
    }

    /// Forget the previous sample and the last cadence.
    pub fn reset(&mut self) {
        self.previous = None;
        self.last_cadence = None;
    }
}

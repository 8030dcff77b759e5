//! Metrics module for cadence calculation.

pub mod cadence;
pub mod counter;

pub use cadence::{CadenceCalculator, CadenceEstimate};
pub use counter::{wrapping_diff, CounterDiff, UINT16_MODULUS};

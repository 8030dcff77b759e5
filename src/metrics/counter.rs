//! Differencing for cumulative counters that wrap at a fixed modulus.
//!
//! CSC sensors report crank revolutions and crank event time as 16-bit
//! cumulative values. Consecutive readings are compared modulo 2^16, and
//! a single wrap between two readings is assumed.

/// Modulus of the 16-bit CSC crank counters.
pub const UINT16_MODULUS: u64 = 1 << 16;

/// Result of comparing two readings of a wrapping counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDiff {
    /// The counter moved forward by this many units
    Advanced(u64),
    /// Both readings are identical
    Unchanged,
}

impl CounterDiff {
    /// Forward delta, or `None` when the counter did not move.
    pub fn delta(self) -> Option<u64> {
        match self {
            CounterDiff::Advanced(delta) => Some(delta),
            CounterDiff::Unchanged => None,
        }
    }
}

/// Difference `current - previous` of a counter that wraps at `modulus`.
///
/// A reading lower than its predecessor is taken as exactly one wrap.
/// Multiple wraps between readings cannot be detected.
pub fn wrapping_diff(current: u32, previous: u32, modulus: u64) -> CounterDiff {
    debug_assert!((current as u64) < modulus && (previous as u64) < modulus);

    let current = current as u64;
    let previous = previous as u64;

    if current > previous {
        CounterDiff::Advanced(current - previous)
    } else if current == previous {
        CounterDiff::Unchanged
    } else {
        CounterDiff::Advanced((current + modulus) - previous)
    }
}

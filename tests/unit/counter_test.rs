//! Unit tests for 16-bit counter differencing.

use rustcadence::metrics::counter::{wrapping_diff, CounterDiff, UINT16_MODULUS};

#[test]
fn test_forward_difference() {
    assert_eq!(wrapping_diff(1024, 0, UINT16_MODULUS), CounterDiff::Advanced(1024));
}

#[test]
fn test_wrapped_difference() {
    // 65530 -> 65535 -> 0 -> 5
    assert_eq!(wrapping_diff(5, 65530, UINT16_MODULUS), CounterDiff::Advanced(11));
}

#[test]
fn test_equal_values_are_unchanged() {
    let diff = wrapping_diff(100, 100, UINT16_MODULUS);
    assert_eq!(diff, CounterDiff::Unchanged);
    assert_eq!(diff.delta(), None);
}

#[test]
fn test_difference_is_never_zero_or_negative() {
    for previous in (0..65536u32).step_by(4099) {
        for current in (0..65536u32).step_by(3001) {
            match wrapping_diff(current, previous, UINT16_MODULUS) {
                CounterDiff::Advanced(delta) => {
                    assert!(delta > 0 && delta < UINT16_MODULUS);
                    assert_eq!((previous as u64 + delta) % UINT16_MODULUS, current as u64);
                }
                CounterDiff::Unchanged => assert_eq!(current, previous),
            }
        }
    }
}

//! Unit tests for CSC Measurement decoding.

use rustcadence::sensors::csc::{
    build_crank_measurement, parse_csc_measurement, CrankSample, DecodeError, PayloadLayout,
};

#[test]
fn test_parse_crank_only() {
    // Flags: 0x02 (crank present)
    // Crank revolutions: 0x0102 = 258
    // Last crank event time: 0x0800 = 2048 (2 s)
    let data = [0x02, 0x02, 0x01, 0x00, 0x08];
    let m = parse_csc_measurement(&data, PayloadLayout::Standard).unwrap();

    assert!(m.flags.crank_present);
    assert!(!m.flags.wheel_present);
    assert_eq!(m.crank, Some(CrankSample::new(258, 2048)));
}

#[test]
fn test_parse_wheel_and_crank_standard_offset() {
    // Flags: 0x03 (wheel + crank)
    // Wheel revolutions (u32) + wheel event time (u16), then crank
    let data = [
        0x03, 0x10, 0x00, 0x00, 0x00, 0x00, 0x04, 0x0A, 0x00, 0x00, 0x04,
    ];
    let m = parse_csc_measurement(&data, PayloadLayout::Standard).unwrap();

    assert!(m.flags.wheel_present);
    assert_eq!(m.crank, Some(CrankSample::new(10, 1024)));
}

#[test]
fn test_parse_wheel_and_crank_fixed_offset() {
    // Same flags, crank read straight after the flags byte
    let data = [0x03, 0x0A, 0x00, 0x00, 0x04];
    let m = parse_csc_measurement(&data, PayloadLayout::CrankAtFixedOffset).unwrap();

    assert_eq!(m.crank, Some(CrankSample::new(10, 1024)));
}

#[test]
fn test_standard_layout_rejects_short_combined_payload() {
    let data = [0x03, 0x0A, 0x00, 0x00, 0x04];
    assert_eq!(
        parse_csc_measurement(&data, PayloadLayout::Standard),
        Err(DecodeError::Truncated {
            needed: 11,
            actual: 5
        })
    );
}

#[test]
fn test_wheel_only_has_no_crank() {
    let data = [0x01, 0x10, 0x00, 0x00, 0x00, 0x00, 0x04];
    let m = parse_csc_measurement(&data, PayloadLayout::Standard).unwrap();
    assert!(!m.has_crank());
}

#[test]
fn test_truncated_crank_payload() {
    let data = [0x02, 0x01, 0x00];
    assert_eq!(
        parse_csc_measurement(&data, PayloadLayout::Standard),
        Err(DecodeError::Truncated {
            needed: 5,
            actual: 3
        })
    );
}

#[test]
fn test_empty_payload() {
    assert_eq!(
        parse_csc_measurement(&[], PayloadLayout::Standard),
        Err(DecodeError::Empty)
    );
}

#[test]
fn test_build_crank_measurement_layout() {
    let data = build_crank_measurement(CrankSample::new(0x1234, 0xABCD));
    assert_eq!(data, vec![0x02, 0x34, 0x12, 0xCD, 0xAB]);
}

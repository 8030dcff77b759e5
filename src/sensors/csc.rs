//! Cycling Speed and Cadence (CSC) protocol implementation.
//!
//! Service and characteristic UUID constants plus parsing of the
//! CSC Measurement (0x2A5B) notification. Only crank data is surfaced;
//! wheel fields are validated for length and skipped.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Cycling Speed and Cadence Service UUID (0x1816)
pub const CSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);

/// CSC Measurement Characteristic UUID (0x2A5B)
pub const CSC_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x0000_2a5b_0000_1000_8000_0080_5f9b_34fb);

/// Size of the wheel revolution block (u32 revolutions + u16 event time).
const WHEEL_DATA_LEN: usize = 6;

/// Size of the crank revolution block (u16 revolutions + u16 event time).
const CRANK_DATA_LEN: usize = 4;

/// Where crank fields are located inside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadLayout {
    /// Crank data follows the wheel block when the wheel flag is set
    #[default]
    Standard,
    /// Crank data always read at bytes 1-4 (crank-only sensors)
    CrankAtFixedOffset,
}

impl std::fmt::Display for PayloadLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadLayout::Standard => write!(f, "Standard"),
            PayloadLayout::CrankAtFixedOffset => write!(f, "Crank at fixed offset"),
        }
    }
}

/// CSC Measurement flags (byte 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFlags {
    /// Wheel revolution data present (bit 0)
    pub wheel_present: bool,
    /// Crank revolution data present (bit 1)
    pub crank_present: bool,
}

impl SampleFlags {
    /// Decode the flags byte. Reserved bits are ignored.
    pub fn from_byte(flags: u8) -> Self {
        Self {
            wheel_present: (flags & 0x01) != 0,
            crank_present: (flags & 0x02) != 0,
        }
    }

    /// Encode back into a flags byte.
    pub fn to_byte(self) -> u8 {
        (self.wheel_present as u8) | ((self.crank_present as u8) << 1)
    }
}

/// One crank reading, both fields cumulative and wrapping at 2^16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CrankSample {
    /// Cumulative crank revolutions
    pub crank_revolutions: u16,
    /// Time of the last crank event in 1/1024 s
    pub crank_event_time: u16,
}

impl CrankSample {
    /// Create a new crank sample.
    pub fn new(crank_revolutions: u16, crank_event_time: u16) -> Self {
        Self {
            crank_revolutions,
            crank_event_time,
        }
    }
}

/// Parsed CSC Measurement notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CscMeasurement {
    /// Flags from byte 0
    pub flags: SampleFlags,
    /// Crank data (if present)
    pub crank: Option<CrankSample>,
}

impl CscMeasurement {
    /// Whether the notification carried crank data.
    pub fn has_crank(&self) -> bool {
        self.crank.is_some()
    }
}

/// Errors from decoding a CSC Measurement payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Payload had no flags byte
    #[error("Empty CSC measurement payload")]
    Empty,

    /// Payload shorter than its flags require
    #[error("CSC measurement truncated: flags require {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
}

/// Parse a CSC Measurement notification.
///
/// The data format is:
/// - Byte 0: Flags
/// - Bytes 1-6: Wheel revolutions (u32) + last wheel event time (u16), if bit 0 set
/// - Next 4 bytes: Crank revolutions (u16) + last crank event time (u16), if bit 1 set
///
/// With [`PayloadLayout::CrankAtFixedOffset`] the crank block is read at
/// byte 1 whatever the wheel flag says.
pub fn parse_csc_measurement(
    data: &[u8],
    layout: PayloadLayout,
) -> Result<CscMeasurement, DecodeError> {
    let flags = SampleFlags::from_byte(*data.first().ok_or(DecodeError::Empty)?);

    let crank_offset = match layout {
        PayloadLayout::Standard if flags.wheel_present => 1 + WHEEL_DATA_LEN,
        _ => 1,
    };

    let needed = if flags.crank_present {
        crank_offset + CRANK_DATA_LEN
    } else {
        crank_offset
    };

    if data.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            actual: data.len(),
        });
    }

    let crank = flags.crank_present.then(|| {
        let o = crank_offset;
        CrankSample {
            crank_revolutions: u16::from_le_bytes([data[o], data[o + 1]]),
            crank_event_time: u16::from_le_bytes([data[o + 2], data[o + 3]]),
        }
    });

    Ok(CscMeasurement { flags, crank })
}

/// Build a crank-only CSC Measurement payload.
pub fn build_crank_measurement(sample: CrankSample) -> Vec<u8> {
    let flags = SampleFlags {
        wheel_present: false,
        crank_present: true,
    };
    let mut data = vec![flags.to_byte()];
    data.extend_from_slice(&sample.crank_revolutions.to_le_bytes());
    data.extend_from_slice(&sample.crank_event_time.to_le_bytes());
    data
}

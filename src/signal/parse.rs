use chrono::Utc;

use crate::error::ParseError;
use crate::models::RawMeasurement;

const FLAG_HR_16BIT: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_PRESENT: u8 = 0x10;

/// Decode a Heart Rate Measurement frame.
///
/// Layout: a flags byte, an 8 or 16-bit heart rate, an optional 2-byte
/// energy expended field, then zero or more little-endian RR intervals.
/// Arbitrary input yields an error value, never a panic.
pub fn parse(bytes: &[u8]) -> Result<RawMeasurement, ParseError> {
    let (&flags, rest) = bytes.split_first().ok_or(ParseError::Empty)?;

    let (bpm, rest) = if flags & FLAG_HR_16BIT != 0 {
        let (hr, rest) = take(rest, 2, "heart rate")?;
        (u16::from_le_bytes([hr[0], hr[1]]), rest)
    } else {
        let (hr, rest) = take(rest, 1, "heart rate")?;
        (hr[0] as u16, rest)
    };

    // Sensors without contact detection are assumed to be worn
    let contact_detected = if flags & FLAG_CONTACT_SUPPORTED != 0 {
        flags & FLAG_CONTACT_DETECTED != 0
    } else {
        true
    };

    let rest = if flags & FLAG_ENERGY_EXPENDED != 0 {
        take(rest, 2, "energy expended")?.1
    } else {
        rest
    };

    let rr_intervals = if flags & FLAG_RR_PRESENT != 0 {
        if rest.len() % 2 != 0 {
            return Err(ParseError::Truncated {
                field: "rr interval",
                needed: rest.len() + 1,
                available: rest.len(),
            });
        }
        rest.chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    } else {
        Vec::new()
    };

    Ok(RawMeasurement {
        bpm,
        contact_detected,
        rr_intervals,
        timestamp: Utc::now(),
    })
}

/// Convert an RR interval from 1/1024 s units to milliseconds
pub fn rr_to_ms(rr: u16) -> f64 {
    rr as f64 * 1000.0 / 1024.0
}

fn take<'a>(
    bytes: &'a [u8],
    n: usize,
    field: &'static str,
) -> Result<(&'a [u8], &'a [u8]), ParseError> {
    if bytes.len() < n {
        return Err(ParseError::Truncated {
            field,
            needed: n,
            available: bytes.len(),
        });
    }
    Ok(bytes.split_at(n))
}

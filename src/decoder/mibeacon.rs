//! Xiaomi MiBeacon service data (UUID 0xFE95), temperature/humidity frame.

use super::ad::{SERVICE_DATA_16, ad_structures};
use crate::error::DecodeError;
use crate::reading::{FrameFormat, Measurement};

pub const SERVICE_UUID16: u16 = 0xFE95;

/// Low byte of the frame control field.
pub const FRAME_CONTROL: u8 = 0x70;

/// Sub-frame carrying temperature and humidity.
pub const SELECTOR: u8 = 0x20;

/// Smallest length byte a matching structure can have.
pub const MIN_DECLARED_LEN: usize = 13;

/// Length byte plus the smallest matching structure.
pub const MIN_FRAME_LEN: usize = MIN_DECLARED_LEN + 1;

pub fn decode(raw: &[u8]) -> Result<Measurement, DecodeError> {
    if raw.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort {
            len: raw.len(),
            min: MIN_FRAME_LEN,
        });
    }
    for structure in ad_structures(raw) {
        let structure = structure?;
        if structure.ad_type != SERVICE_DATA_16 || structure.declared_len() < MIN_DECLARED_LEN {
            continue;
        }
        if let Some(measurement) = match_service_data(structure.data) {
            return Ok(measurement);
        }
    }
    Err(DecodeError::NoMatch)
}

/// `data` is the service data after the AD type byte:
/// `uuid(2) control selector temperature(2) humidity ...`.
fn match_service_data(data: &[u8]) -> Option<Measurement> {
    let &[uuid_lo, uuid_hi, control, selector, t_lo, t_hi, humidity, ..] = data else {
        return None;
    };
    if u16::from_le_bytes([uuid_lo, uuid_hi]) != SERVICE_UUID16
        || control != FRAME_CONTROL
        || selector != SELECTOR
    {
        return None;
    }
    Some(Measurement {
        temperature: f32::from(i16::from_le_bytes([t_lo, t_hi])) / 10.0,
        humidity: f32::from(humidity),
        ..Measurement::empty(FrameFormat::MiBeacon)
    })
}

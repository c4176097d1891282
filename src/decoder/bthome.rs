//! BTHome v2 service data (UUID 0xFCD2), unencrypted.
//!
//! Objects are `[id, value...]` with a width fixed by the id, so a parser
//! that meets an id it has no width for cannot find the next object.

use crate::error::DecodeError;
use crate::reading::{FrameFormat, Measurement};
use tracing::trace;

/// AD type 0x16, UUID 0xFCD2 little-endian, device info byte 0x40
/// (BTHome v2, unencrypted, regular advertising).
pub const MARKER: [u8; 4] = [0x16, 0xD2, 0xFC, 0x40];

/// The marker plus at least one object id and one value byte.
pub const MIN_FRAME_LEN: usize = MARKER.len() + 2;

/// How to treat an object id missing from [`OBJECTS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagMode {
    /// Abort the frame.
    #[default]
    Strict,
    /// Assume a one byte value and carry on. Older firmware parsers did this;
    /// any wider object shifts everything after it.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Battery,
    Temperature,
    Humidity,
    Voltage,
    /// Known width, value not used.
    Skip,
}

#[derive(Debug, Clone, Copy)]
struct ObjectSpec {
    id: u8,
    width: usize,
    field: Field,
}

const fn object(id: u8, width: usize, field: Field) -> ObjectSpec {
    ObjectSpec { id, width, field }
}

const OBJECTS: &[ObjectSpec] = &[
    object(0x00, 1, Field::Skip), // packet id
    object(0x01, 1, Field::Battery),
    object(0x02, 2, Field::Temperature),
    object(0x03, 2, Field::Humidity),
    object(0x04, 3, Field::Skip), // pressure
    object(0x05, 3, Field::Skip), // illuminance
    object(0x06, 2, Field::Skip), // mass (kg)
    object(0x07, 2, Field::Skip), // mass (lb)
    object(0x08, 2, Field::Skip), // dew point
    object(0x09, 1, Field::Skip), // count
    object(0x0A, 3, Field::Skip), // energy
    object(0x0B, 3, Field::Skip), // power
    object(0x0C, 2, Field::Voltage),
    object(0x0D, 2, Field::Skip), // pm2.5
    object(0x0E, 2, Field::Skip), // pm10
    object(0x0F, 1, Field::Skip), // generic boolean
    object(0x10, 1, Field::Skip), // power on/off
    object(0x11, 1, Field::Skip), // opening
    object(0x12, 2, Field::Skip), // co2
    object(0x13, 2, Field::Skip), // tvoc
    object(0x14, 2, Field::Skip), // moisture
    object(0x2E, 1, Field::Skip), // humidity, 1 byte
    object(0x2F, 1, Field::Skip), // moisture, 1 byte
    object(0x3A, 1, Field::Skip), // button
    object(0x45, 2, Field::Skip), // temperature, 0.1 resolution
];

fn lookup(id: u8) -> Option<&'static ObjectSpec> {
    OBJECTS.iter().find(|spec| spec.id == id)
}

/// Position of the marker, only considering positions that leave room for a
/// complete frame.
pub fn find_marker(raw: &[u8]) -> Result<usize, DecodeError> {
    if raw.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort {
            len: raw.len(),
            min: MIN_FRAME_LEN,
        });
    }
    (0..=raw.len() - MIN_FRAME_LEN)
        .find(|&i| raw[i..].starts_with(&MARKER))
        .ok_or(DecodeError::MarkerNotFound)
}

pub fn decode(raw: &[u8], mode: TagMode) -> Result<Measurement, DecodeError> {
    let mut pos = find_marker(raw)? + MARKER.len();
    let mut measurement = Measurement::empty(FrameFormat::BtHome);

    while let Some(&id) = raw.get(pos) {
        let value_at = pos + 1;
        let available = raw.len() - value_at;
        let Some(spec) = lookup(id) else {
            match mode {
                TagMode::Strict => {
                    return Err(DecodeError::UnknownTag {
                        tag: id,
                        offset: pos,
                    });
                }
                TagMode::Legacy => {
                    trace!(id, offset = pos, "skipping unknown object as one byte");
                    pos = value_at + 1;
                    continue;
                }
            }
        };
        let Some(value) = raw.get(value_at..value_at + spec.width) else {
            return Err(DecodeError::Truncated {
                offset: value_at,
                needed: spec.width,
                available,
            });
        };
        apply(&mut measurement, spec.field, value);
        pos = value_at + spec.width;
    }

    Ok(measurement)
}

fn apply(measurement: &mut Measurement, field: Field, value: &[u8]) {
    match (field, value) {
        (Field::Battery, &[percent]) => measurement.battery = percent,
        (Field::Temperature, &[lo, hi]) => {
            measurement.temperature = f32::from(i16::from_le_bytes([lo, hi])) / 100.0
        }
        (Field::Humidity, &[lo, hi]) => {
            measurement.humidity = f32::from(u16::from_le_bytes([lo, hi])) / 100.0
        }
        (Field::Voltage, &[lo, hi]) => {
            measurement.voltage = f32::from(u16::from_le_bytes([lo, hi])) / 1000.0
        }
        _ => {}
    }
}

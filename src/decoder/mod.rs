//! Raw advertisement bytes to [`Measurement`].
//!
//! Formats are tried in a fixed order (BTHome, then MiBeacon). The first
//! format that recognises its framing owns the buffer: if it then fails, the
//! buffer is dropped rather than offered to the next format. Adding a format
//! means adding a module and a line to [`Decoder::try_decode`].

pub mod ad;
pub mod bthome;
pub mod mibeacon;

pub use bthome::TagMode;

use crate::error::DecodeError;
use crate::reading::Measurement;
use tracing::debug;

/// Stateless frame decoder. Decoding the same bytes twice gives the same
/// measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decoder {
    tag_mode: TagMode,
}

impl Decoder {
    pub const fn new(tag_mode: TagMode) -> Self {
        Self { tag_mode }
    }

    pub const fn tag_mode(&self) -> TagMode {
        self.tag_mode
    }

    pub fn try_decode(&self, raw: &[u8]) -> Result<Measurement, DecodeError> {
        match bthome::decode(raw, self.tag_mode) {
            Err(e) if e.is_mismatch() => {}
            owned => return owned,
        }
        mibeacon::decode(raw)
    }

    /// Like [`try_decode`](Self::try_decode), logging the reason a frame was
    /// dropped instead of returning it.
    pub fn decode(&self, raw: &[u8]) -> Option<Measurement> {
        match self.try_decode(raw) {
            Ok(measurement) => Some(measurement),
            Err(e) if e.is_mismatch() => {
                debug!(len = raw.len(), reason = %e, "no known format in frame");
                None
            }
            Err(e) => {
                debug!(frame = %hex::encode(raw), error = %e, "dropping malformed frame");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::FrameFormat;

    const BTHOME: [u8; 12] = [
        0x16, 0xD2, 0xFC, 0x40, 0x01, 0x5A, 0x02, 0x34, 0x12, 0x03, 0x78, 0x56,
    ];

    fn mibeacon() -> Vec<u8> {
        let mut raw = vec![0x0F, 0x16, 0x95, 0xFE, 0x70, 0x20, 0x0A, 0x01, 0x38];
        raw.resize(16, 0x00);
        raw
    }

    #[test]
    fn picks_format_by_framing() {
        let decoder = Decoder::default();
        assert_eq!(decoder.decode(&BTHOME).unwrap().format, FrameFormat::BtHome);
        assert_eq!(decoder.decode(&mibeacon()).unwrap().format, FrameFormat::MiBeacon);
    }

    #[test]
    fn decoding_is_repeatable() {
        let decoder = Decoder::default();
        let first = decoder.decode(&BTHOME).unwrap();
        let second = decoder.decode(&BTHOME).unwrap();
        assert_eq!(first.temperature.to_bits(), second.temperature.to_bits());
        assert_eq!(first.humidity.to_bits(), second.humidity.to_bits());
        assert_eq!(first.voltage.to_bits(), second.voltage.to_bits());
        assert_eq!(first, second);
    }

    #[test]
    fn broken_bthome_frame_is_not_retried_as_mibeacon() {
        // valid MiBeacon structure followed by a BTHome marker with a
        // truncated temperature
        let mut raw = mibeacon();
        raw.extend_from_slice(&[0x05, 0x16, 0xD2, 0xFC, 0x40, 0x02, 0x34]);
        assert!(matches!(
            Decoder::default().try_decode(&raw),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(Decoder::default().decode(&raw), None);
    }

    #[test]
    fn nothing_recognisable() {
        let decoder = Decoder::default();
        assert_eq!(decoder.decode(&[]), None);
        assert_eq!(decoder.decode(&[0x02, 0x01, 0x06]), None);
        assert_eq!(decoder.try_decode(&[0u8; 32]), Err(DecodeError::NoMatch));
    }

    #[test]
    fn every_prefix_of_valid_frames_is_handled() {
        let decoder = Decoder::new(TagMode::Legacy);
        for frame in [BTHOME.to_vec(), mibeacon()] {
            for len in 0..=frame.len() {
                let _ = decoder.decode(&frame[..len]);
            }
        }
    }

    #[test]
    fn tag_mode_reaches_bthome() {
        let raw = [0x16, 0xD2, 0xFC, 0x40, 0x50, 0x01, 0x01, 0x5A];
        assert!(Decoder::new(TagMode::Strict).decode(&raw).is_none());
        assert_eq!(Decoder::new(TagMode::Legacy).decode(&raw).unwrap().battery, 90);
    }
}

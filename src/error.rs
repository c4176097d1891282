use thiserror::Error;

/// Why a buffer produced no reading.
///
/// None of these are fatal: the caller logs and drops the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame of {len} bytes is shorter than the {min}-byte minimum")]
    TooShort { len: usize, min: usize },

    #[error("BTHome service data marker not found")]
    MarkerNotFound,

    #[error("field at offset {offset} needs {needed} bytes, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown BTHome object id {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("no MiBeacon temperature/humidity structure")]
    NoMatch,
}

impl DecodeError {
    /// True when the buffer simply isn't in the format being tried, as
    /// opposed to being in it and broken.
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self,
            DecodeError::TooShort { .. } | DecodeError::MarkerNotFound | DecodeError::NoMatch
        )
    }
}

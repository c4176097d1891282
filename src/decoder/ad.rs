//! Length-prefixed AD structures inside an advertisement payload.

use crate::error::DecodeError;

/// AD type for "Service Data - 16-bit UUID".
pub const SERVICE_DATA_16: u8 = 0x16;

/// One `[len, type, data...]` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    /// Offset of the length byte within the buffer.
    pub offset: usize,
    pub ad_type: u8,
    /// Everything after the type byte.
    pub data: &'a [u8],
}

impl AdStructure<'_> {
    /// The length byte as it appeared on the wire (type byte included).
    pub fn declared_len(&self) -> usize {
        self.data.len() + 1
    }
}

/// Iterator over the AD structures of a buffer.
///
/// Stops at a zero length byte or the end of the buffer. A structure whose
/// declared length runs past the end yields one `Truncated` error and ends
/// the iteration.
#[derive(Debug, Clone)]
pub struct AdStructures<'a> {
    raw: &'a [u8],
    pos: usize,
    done: bool,
}

pub fn ad_structures(raw: &[u8]) -> AdStructures<'_> {
    AdStructures {
        raw,
        pos: 0,
        done: false,
    }
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = Result<AdStructure<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let offset = self.pos;
        let len = match self.raw.get(offset) {
            Some(&0) | None => {
                self.done = true;
                return None;
            }
            Some(&len) => len as usize,
        };
        let available = self.raw.len() - offset - 1;
        if len > available {
            self.done = true;
            return Some(Err(DecodeError::Truncated {
                offset,
                needed: len,
                available,
            }));
        }
        let end = offset + 1 + len;
        self.pos = end;
        Some(Ok(AdStructure {
            offset,
            ad_type: self.raw[offset + 1],
            data: &self.raw[offset + 2..end],
        }))
    }
}

/// Frames a 16-bit service data entry as it appears on air:
/// `[len, 0x16, uuid_lo, uuid_hi, data...]`.
///
/// Returns `None` when the entry would not fit in a single AD structure.
pub fn service_data_structure(uuid16: u16, data: &[u8]) -> Option<Vec<u8>> {
    let len = u8::try_from(data.len() + 3).ok()?;
    let mut out = Vec::with_capacity(len as usize + 1);
    out.push(len);
    out.push(SERVICE_DATA_16);
    out.extend_from_slice(&uuid16.to_le_bytes());
    out.extend_from_slice(data);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_consecutive_structures() {
        // flags, then a 16-bit service data entry
        let raw = [0x02, 0x01, 0x06, 0x04, 0x16, 0x95, 0xFE, 0xAA];
        let structures: Vec<_> = ad_structures(&raw).collect::<Result<_, _>>().unwrap();
        assert_eq!(structures.len(), 2);
        assert_eq!(structures[0].ad_type, 0x01);
        assert_eq!(structures[0].data, &[0x06]);
        assert_eq!(structures[1].offset, 3);
        assert_eq!(structures[1].ad_type, SERVICE_DATA_16);
        assert_eq!(structures[1].data, &[0x95, 0xFE, 0xAA]);
        assert_eq!(structures[1].declared_len(), 4);
    }

    #[test]
    fn zero_length_terminates() {
        let raw = [0x02, 0x01, 0x06, 0x00, 0x05, 0x16];
        assert_eq!(ad_structures(&raw).count(), 1);
    }

    #[test]
    fn overlong_length_is_reported_once() {
        let raw = [0x02, 0x01, 0x06, 0x09, 0x16, 0x95];
        let mut it = ad_structures(&raw);
        assert!(it.next().unwrap().is_ok());
        assert_eq!(
            it.next(),
            Some(Err(DecodeError::Truncated {
                offset: 3,
                needed: 9,
                available: 2,
            }))
        );
        assert_eq!(it.next(), None);
    }

    #[test]
    fn length_byte_at_end_of_buffer() {
        let raw = [0x02, 0x01, 0x06, 0x01];
        let results: Vec<_> = ad_structures(&raw).collect();
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }

    #[test]
    fn service_data_framing() {
        assert_eq!(
            service_data_structure(0xFCD2, &[0x40, 0x01, 0x5A]),
            Some(vec![0x06, 0x16, 0xD2, 0xFC, 0x40, 0x01, 0x5A])
        );
        assert_eq!(service_data_structure(0xFCD2, &[0u8; 253]), None);
    }
}

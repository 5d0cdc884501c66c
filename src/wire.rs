//! Wire-level helpers for index table segments
//!
//! An IndexTableSegment travels as a KLV triplet:
//! - Key: the 16-byte SMPTE Universal Label below
//! - Length: BER encoded
//! - Value: a local set of tagged items (2-byte tag, 2-byte length by
//!   default; non-standard streams use other length widths)

use crate::error::{IndexError, Result};
use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

/// Universal Label that keys an IndexTableSegment KLV
pub const INDEX_TABLE_SEGMENT_KEY: [u8; 16] = [
    0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x10, 0x01, 0x00,
];

/// Check a 16-byte key against the IndexTableSegment UL, ignoring the
/// version byte (byte 7).
pub fn is_index_table_segment(key: &[u8]) -> bool {
    key.len() == 16
        && key[0..7] == INDEX_TABLE_SEGMENT_KEY[0..7]
        && key[8..16] == INDEX_TABLE_SEGMENT_KEY[8..16]
}

/// Static local tags for IndexTableSegment items (SMPTE-377M)
pub mod tags {
    pub const INSTANCE_UID: u16 = 0x3C0A;
    pub const EDIT_UNIT_BYTE_COUNT: u16 = 0x3F05;
    pub const INDEX_SID: u16 = 0x3F06;
    pub const BODY_SID: u16 = 0x3F07;
    pub const SLICE_COUNT: u16 = 0x3F08;
    pub const DELTA_ENTRY_ARRAY: u16 = 0x3F09;
    pub const INDEX_ENTRY_ARRAY: u16 = 0x3F0A;
    pub const INDEX_EDIT_RATE: u16 = 0x3F0B;
    pub const INDEX_START_POSITION: u16 = 0x3F0C;
    pub const INDEX_DURATION: u16 = 0x3F0D;
    pub const POS_TABLE_COUNT: u16 = 0x3F0E;
}

/// Calculate BER length encoding size
pub fn ber_length_size(length: usize) -> usize {
    if length < 0x80 {
        1
    } else if length <= 0xFF {
        2
    } else if length <= 0xFFFF {
        3
    } else if length <= 0xFFFFFF {
        4
    } else {
        5
    }
}

/// Encode length as BER
pub fn encode_ber_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        vec![length as u8]
    } else if length <= 0xFF {
        vec![0x81, length as u8]
    } else if length <= 0xFFFF {
        vec![0x82, (length >> 8) as u8, length as u8]
    } else if length <= 0xFFFFFF {
        vec![
            0x83,
            (length >> 16) as u8,
            (length >> 8) as u8,
            length as u8,
        ]
    } else {
        vec![
            0x84,
            (length >> 24) as u8,
            (length >> 16) as u8,
            (length >> 8) as u8,
            length as u8,
        ]
    }
}

/// Decode BER length from bytes, returning (length, bytes consumed)
pub fn decode_ber_length(data: &[u8]) -> Result<(usize, usize)> {
    if data.is_empty() {
        return Err(IndexError::InsufficientData {
            needed: 1,
            available: 0,
        });
    }

    let first_byte = data[0];

    if first_byte < 0x80 {
        Ok((first_byte as usize, 1))
    } else if first_byte == 0x80 {
        Err(IndexError::malformed("indefinite BER length"))
    } else {
        let num_bytes = (first_byte & 0x7F) as usize;

        if data.len() < 1 + num_bytes {
            return Err(IndexError::InsufficientData {
                needed: 1 + num_bytes,
                available: data.len(),
            });
        }

        let mut length: usize = 0;
        for byte in data.iter().skip(1).take(num_bytes) {
            length = (length << 8) | (*byte as usize);
        }

        Ok((length, 1 + num_bytes))
    }
}

/// Read one local item at `offset`, returning (tag, value, bytes consumed).
///
/// `len_size` is the width of the length field: 1, 2 (standard) or 4
/// bytes, or 0 for BER.
pub fn read_local_item(data: &[u8], offset: usize, len_size: usize) -> Result<(u16, &[u8], usize)> {
    let remaining = data.len().saturating_sub(offset);
    if remaining < 2 {
        return Err(IndexError::InsufficientData {
            needed: 2,
            available: remaining,
        });
    }

    let tag = u16::from_be_bytes([data[offset], data[offset + 1]]);
    let body = &data[offset + 2..];

    let (length, len_bytes) = match len_size {
        0 => decode_ber_length(body)?,
        1 => {
            if body.is_empty() {
                return Err(IndexError::InsufficientData {
                    needed: 1,
                    available: 0,
                });
            }
            (body[0] as usize, 1)
        }
        2 => {
            if body.len() < 2 {
                return Err(IndexError::InsufficientData {
                    needed: 2,
                    available: body.len(),
                });
            }
            (u16::from_be_bytes([body[0], body[1]]) as usize, 2)
        }
        4 => {
            if body.len() < 4 {
                return Err(IndexError::InsufficientData {
                    needed: 4,
                    available: body.len(),
                });
            }
            (
                u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize,
                4,
            )
        }
        other => {
            return Err(IndexError::malformed(format!(
                "unsupported local length size {}",
                other
            )))
        }
    };

    if body.len() < len_bytes + length {
        return Err(IndexError::InsufficientData {
            needed: len_bytes + length,
            available: body.len(),
        });
    }

    let value = &body[len_bytes..len_bytes + length];
    Ok((tag, value, 2 + len_bytes + length))
}

/// Write one local item with the standard 2-byte length field
pub fn write_local_item<W: Write>(writer: &mut W, tag: u16, value: &[u8]) -> Result<usize> {
    if value.len() > u16::MAX as usize {
        return Err(IndexError::malformed(format!(
            "local item 0x{:04x} too large: {} bytes",
            tag,
            value.len()
        )));
    }

    writer
        .write_u16::<BigEndian>(tag)
        .map_err(|e| IndexError::malformed(e.to_string()))?;
    writer
        .write_u16::<BigEndian>(value.len() as u16)
        .map_err(|e| IndexError::malformed(e.to_string()))?;
    writer
        .write_all(value)
        .map_err(|e| IndexError::malformed(e.to_string()))?;
    Ok(4 + value.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ber_length_short() {
        let encoded = encode_ber_length(100);
        assert_eq!(encoded, vec![100]);

        let (decoded, size) = decode_ber_length(&encoded).unwrap();
        assert_eq!(decoded, 100);
        assert_eq!(size, 1);
    }

    #[test]
    fn test_ber_length_long() {
        let encoded = encode_ber_length(1000);
        assert_eq!(encoded, vec![0x82, 0x03, 0xE8]);

        let (decoded, size) = decode_ber_length(&encoded).unwrap();
        assert_eq!(decoded, 1000);
        assert_eq!(size, 3);
    }

    #[test]
    fn test_ber_indefinite_rejected() {
        assert!(decode_ber_length(&[0x80]).is_err());
    }

    #[test]
    fn test_local_item_roundtrip() {
        let mut buffer = Vec::new();
        write_local_item(&mut buffer, 0x3F06, &[0, 0, 0, 129]).unwrap();

        let (tag, value, consumed) = read_local_item(&buffer, 0, 2).unwrap();
        assert_eq!(tag, 0x3F06);
        assert_eq!(value, &[0, 0, 0, 129]);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_local_item_ber_length() {
        // 2-byte tag followed by a BER short-form length
        let data = [0x3F, 0x05, 0x02, 0xAA, 0xBB];
        let (tag, value, consumed) = read_local_item(&data, 0, 0).unwrap();
        assert_eq!(tag, 0x3F05);
        assert_eq!(value, &[0xAA, 0xBB]);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_local_item_truncated() {
        let data = [0x3F, 0x05, 0x00, 0x10, 0xAA];
        assert!(read_local_item(&data, 0, 2).is_err());
    }

    #[test]
    fn test_segment_key_match() {
        assert!(is_index_table_segment(&INDEX_TABLE_SEGMENT_KEY));

        let mut versioned = INDEX_TABLE_SEGMENT_KEY;
        versioned[7] = 0x02;
        assert!(is_index_table_segment(&versioned));

        let mut other = INDEX_TABLE_SEGMENT_KEY;
        other[13] = 0x11;
        assert!(!is_index_table_segment(&other));
    }
}

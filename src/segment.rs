//! Index table segments
//!
//! A segment is a contiguous run of index entries starting at a given
//! edit unit. Entries are variable length but fixed per table, so they
//! are stored packed in a single byte buffer and read through
//! [`EntryView`] rather than materialized structs.

use crate::delta::{DeltaArray, DeltaEntry, BASE_ENTRY_SIZE, DELTA_ENTRY_SIZE};
use crate::error::{IndexError, Result};
use crate::types::Rational;
use crate::wire::{self, tags};
use byteorder::{BigEndian, WriteBytesExt};

/// Table-level fields carried by every encoded segment
///
/// Produced when decoding (so the owning table can adopt them) and
/// supplied when encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentInfo {
    pub edit_rate: Rational,
    pub index_sid: u32,
    pub body_sid: u32,
    /// Nonzero for CBR segments, which carry no entry array
    pub edit_unit_byte_count: u32,
    pub index_duration: i64,
}

/// Read-only view of one packed index entry
#[derive(Debug, Clone, Copy)]
pub struct EntryView<'a> {
    data: &'a [u8],
    nsl: u8,
    npe: u8,
}

impl<'a> EntryView<'a> {
    /// Offset in edit units from stored order to the entry holding this
    /// edit unit's stream offsets
    pub fn temporal_offset(&self) -> i8 {
        self.data[0] as i8
    }

    /// Offset in edit units back to the previous key frame
    pub fn key_frame_offset(&self) -> i8 {
        self.data[1] as i8
    }

    /// Edit unit flags
    pub fn flags(&self) -> u8 {
        self.data[2]
    }

    /// Byte offset of this edit unit in the essence container
    pub fn stream_offset(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[3..11]);
        u64::from_be_bytes(bytes)
    }

    /// Distance from the stream offset to the start of slice `index + 1`
    pub fn slice_offset(&self, index: usize) -> Option<u32> {
        if index >= self.nsl as usize {
            return None;
        }
        let base = BASE_ENTRY_SIZE + 4 * index;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[base..base + 4]);
        Some(u32::from_be_bytes(bytes))
    }

    /// Fractional position offset from pos-table slot `index + 1`
    pub fn pos_entry(&self, index: usize) -> Option<Rational> {
        if index >= self.npe as usize {
            return None;
        }
        let base = BASE_ENTRY_SIZE + 4 * self.nsl as usize + 8 * index;
        Rational::from_bytes(&self.data[base..base + 8])
    }
}

/// A contiguous run of index entries
///
/// Entries are stored in essence (stream) order starting at
/// `start_position`. The segment keeps its own snapshot of the owning
/// table's delta array; the two must agree on NSL, NPE and entry size,
/// which the table guarantees by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSegment {
    start_position: i64,
    delta: DeltaArray,
    entry_count: u32,
    entries: Vec<u8>,
}

impl IndexSegment {
    /// Create an empty segment with a delta array snapshot
    pub fn new(start_position: i64, delta: DeltaArray) -> Self {
        IndexSegment {
            start_position,
            delta,
            entry_count: 0,
            entries: Vec::new(),
        }
    }

    /// Edit unit of the first entry
    pub fn start_position(&self) -> i64 {
        self.start_position
    }

    /// Number of entries
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// One past the last indexed edit unit
    pub fn end_position(&self) -> i64 {
        self.start_position + self.entry_count as i64
    }

    /// True if `edit_unit` falls inside this segment
    pub fn contains(&self, edit_unit: i64) -> bool {
        edit_unit >= self.start_position && edit_unit < self.end_position()
    }

    /// This segment's delta array snapshot
    pub fn delta(&self) -> &DeltaArray {
        &self.delta
    }

    /// Wire size of one entry
    pub fn entry_size(&self) -> usize {
        self.delta.entry_size()
    }

    /// The packed entry bytes
    pub fn raw_entries(&self) -> &[u8] {
        &self.entries
    }

    /// View of entry `index`
    pub fn entry(&self, index: u32) -> Option<EntryView<'_>> {
        if index >= self.entry_count {
            return None;
        }
        let size = self.entry_size();
        let base = index as usize * size;
        Some(EntryView {
            data: &self.entries[base..base + size],
            nsl: self.delta.nsl(),
            npe: self.delta.npe(),
        })
    }

    /// Append one entry at the end of the segment
    pub fn append_entry(
        &mut self,
        temporal_offset: i8,
        key_frame_offset: i8,
        flags: u8,
        stream_offset: u64,
        slice_offsets: &[u32],
        pos_table: &[Rational],
    ) -> Result<()> {
        if slice_offsets.len() != self.delta.nsl() as usize {
            return Err(IndexError::ArityMismatch {
                field: "slice offsets",
                expected: self.delta.nsl() as usize,
                actual: slice_offsets.len(),
            });
        }
        if pos_table.len() != self.delta.npe() as usize {
            return Err(IndexError::ArityMismatch {
                field: "pos table",
                expected: self.delta.npe() as usize,
                actual: pos_table.len(),
            });
        }

        self.entries.push(temporal_offset as u8);
        self.entries.push(key_frame_offset as u8);
        self.entries.push(flags);
        self.entries.extend_from_slice(&stream_offset.to_be_bytes());
        for offset in slice_offsets {
            self.entries.extend_from_slice(&offset.to_be_bytes());
        }
        for pos in pos_table {
            self.entries.extend_from_slice(&pos.to_bytes());
        }
        self.entry_count += 1;
        Ok(())
    }

    /// Append pre-packed entries, the bulk path used when decoding
    pub fn append_raw_entries(&mut self, count: u32, size: usize, bytes: &[u8]) -> Result<()> {
        if size != self.entry_size() {
            return Err(IndexError::malformed(format!(
                "entry size {} does not match segment entry size {}",
                size,
                self.entry_size()
            )));
        }
        if bytes.len() != count as usize * size {
            return Err(IndexError::malformed(format!(
                "{} bytes do not hold {} entries of {} bytes",
                bytes.len(),
                count,
                size
            )));
        }

        self.entries.extend_from_slice(bytes);
        self.entry_count += count;
        Ok(())
    }

    /// Rewrite the stream offset of the entry for `edit_unit` in place
    pub fn update_stream_offset(&mut self, edit_unit: i64, stream_offset: u64) -> Result<()> {
        let base = self.entry_base(edit_unit)?;
        self.entries[base + 3..base + 11].copy_from_slice(&stream_offset.to_be_bytes());
        Ok(())
    }

    /// Rewrite the non-offset fields of the entry for `edit_unit`
    pub fn correct_entry(
        &mut self,
        edit_unit: i64,
        temporal_offset: i8,
        key_frame_offset: i8,
        flags: u8,
    ) -> Result<()> {
        let base = self.entry_base(edit_unit)?;
        self.entries[base] = temporal_offset as u8;
        self.entries[base + 1] = key_frame_offset as u8;
        self.entries[base + 2] = flags;
        Ok(())
    }

    fn entry_base(&self, edit_unit: i64) -> Result<usize> {
        if !self.contains(edit_unit) {
            return Err(IndexError::OutOfRange { edit_unit });
        }
        Ok((edit_unit - self.start_position) as usize * self.entry_size())
    }

    /// Parse one IndexTableSegment local-set payload
    ///
    /// `len_size` is the width of each item's length field (2 is the
    /// standard local-set coding; 0 selects BER). Unknown tags are
    /// skipped. On error nothing is produced, so a failed decode leaves
    /// the caller's table untouched.
    pub fn decode_from(payload: &[u8], len_size: usize) -> Result<(IndexSegment, SegmentInfo)> {
        let mut info = SegmentInfo::default();
        let mut start_position = 0i64;
        let mut slice_count = 0u8;
        let mut pos_table_count = 0u8;
        let mut delta = DeltaArray::new();
        let mut entry_array: Option<(u32, usize, &[u8])> = None;

        let mut offset = 0;
        while offset < payload.len() {
            let (tag, value, consumed) = wire::read_local_item(payload, offset, len_size)?;
            offset += consumed;

            match tag {
                tags::INDEX_EDIT_RATE => {
                    info.edit_rate = Rational::from_bytes(value)
                        .ok_or_else(|| IndexError::malformed("short IndexEditRate"))?;
                }
                tags::INDEX_START_POSITION => start_position = read_i64(value)?,
                tags::INDEX_DURATION => info.index_duration = read_i64(value)?,
                tags::EDIT_UNIT_BYTE_COUNT => info.edit_unit_byte_count = read_u32(value)?,
                tags::INDEX_SID => info.index_sid = read_u32(value)?,
                tags::BODY_SID => info.body_sid = read_u32(value)?,
                tags::SLICE_COUNT => slice_count = read_u8(value)?,
                tags::POS_TABLE_COUNT => pos_table_count = read_u8(value)?,
                tags::DELTA_ENTRY_ARRAY => delta = decode_delta_array(value)?,
                tags::INDEX_ENTRY_ARRAY => entry_array = Some(decode_array_header(value)?),
                _ => {} // InstanceUID and vendor extensions
            }
        }

        if !delta.is_empty() {
            if slice_count != delta.nsl() || pos_table_count != delta.npe() {
                return Err(IndexError::malformed(format!(
                    "declared slice/pos counts {}/{} disagree with delta array {}/{}",
                    slice_count,
                    pos_table_count,
                    delta.nsl(),
                    delta.npe()
                )));
            }
        } else if slice_count != 0 || pos_table_count != 0 {
            return Err(IndexError::malformed(
                "slice or pos-table count without a delta entry array",
            ));
        }

        let mut segment = IndexSegment::new(start_position, delta);

        if let Some((count, item_size, bytes)) = entry_array {
            // append_raw_entries re-checks item_size against the
            // delta-derived entry size
            segment.append_raw_entries(count, item_size, bytes)?;
        }

        Ok((segment, info))
    }

    /// Serialize as a full IndexTableSegment KLV
    ///
    /// Returns the number of bytes appended to `buffer`. CBR segments
    /// (`info.edit_unit_byte_count > 0`) omit the index entry array.
    pub fn encode_to(&self, buffer: &mut Vec<u8>, info: &SegmentInfo) -> Result<usize> {
        let mut payload = Vec::with_capacity(128 + self.entries.len());

        wire::write_local_item(
            &mut payload,
            tags::INSTANCE_UID,
            uuid::Uuid::new_v4().as_bytes(),
        )?;
        wire::write_local_item(
            &mut payload,
            tags::INDEX_EDIT_RATE,
            &info.edit_rate.to_bytes(),
        )?;
        wire::write_local_item(
            &mut payload,
            tags::INDEX_START_POSITION,
            &self.start_position.to_be_bytes(),
        )?;
        wire::write_local_item(
            &mut payload,
            tags::INDEX_DURATION,
            &info.index_duration.to_be_bytes(),
        )?;
        wire::write_local_item(
            &mut payload,
            tags::EDIT_UNIT_BYTE_COUNT,
            &info.edit_unit_byte_count.to_be_bytes(),
        )?;
        wire::write_local_item(&mut payload, tags::INDEX_SID, &info.index_sid.to_be_bytes())?;
        wire::write_local_item(&mut payload, tags::BODY_SID, &info.body_sid.to_be_bytes())?;
        wire::write_local_item(&mut payload, tags::SLICE_COUNT, &[self.delta.nsl()])?;
        wire::write_local_item(&mut payload, tags::POS_TABLE_COUNT, &[self.delta.npe()])?;

        let mut delta_bytes = Vec::with_capacity(8 + self.delta.len() * DELTA_ENTRY_SIZE);
        delta_bytes
            .write_u32::<BigEndian>(self.delta.len() as u32)
            .map_err(|e| IndexError::malformed(e.to_string()))?;
        delta_bytes
            .write_u32::<BigEndian>(DELTA_ENTRY_SIZE as u32)
            .map_err(|e| IndexError::malformed(e.to_string()))?;
        for entry in self.delta.entries() {
            delta_bytes.extend_from_slice(&entry.to_bytes());
        }
        wire::write_local_item(&mut payload, tags::DELTA_ENTRY_ARRAY, &delta_bytes)?;

        if info.edit_unit_byte_count == 0 {
            let mut entry_bytes = Vec::with_capacity(8 + self.entries.len());
            entry_bytes
                .write_u32::<BigEndian>(self.entry_count)
                .map_err(|e| IndexError::malformed(e.to_string()))?;
            entry_bytes
                .write_u32::<BigEndian>(self.entry_size() as u32)
                .map_err(|e| IndexError::malformed(e.to_string()))?;
            entry_bytes.extend_from_slice(&self.entries);
            wire::write_local_item(&mut payload, tags::INDEX_ENTRY_ARRAY, &entry_bytes)?;
        }

        buffer.extend_from_slice(&wire::INDEX_TABLE_SEGMENT_KEY);
        let length = wire::encode_ber_length(payload.len());
        buffer.extend_from_slice(&length);
        buffer.extend_from_slice(&payload);

        Ok(16 + length.len() + payload.len())
    }
}

fn read_u8(value: &[u8]) -> Result<u8> {
    value.first().copied().ok_or(IndexError::InsufficientData {
        needed: 1,
        available: 0,
    })
}

fn read_u32(value: &[u8]) -> Result<u32> {
    if value.len() < 4 {
        return Err(IndexError::InsufficientData {
            needed: 4,
            available: value.len(),
        });
    }
    Ok(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
}

fn read_i64(value: &[u8]) -> Result<i64> {
    if value.len() < 8 {
        return Err(IndexError::InsufficientData {
            needed: 8,
            available: value.len(),
        });
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&value[..8]);
    Ok(i64::from_be_bytes(bytes))
}

/// Parse a DeltaEntryArray value: u32 count, u32 item size, then entries
fn decode_delta_array(value: &[u8]) -> Result<DeltaArray> {
    let (count, item_size, bytes) = decode_array_header(value)?;
    if item_size != DELTA_ENTRY_SIZE {
        return Err(IndexError::malformed(format!(
            "delta entry size {} is not {}",
            item_size, DELTA_ENTRY_SIZE
        )));
    }

    let mut entries = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let base = i * DELTA_ENTRY_SIZE;
        match DeltaEntry::from_bytes(&bytes[base..base + DELTA_ENTRY_SIZE]) {
            Some(entry) => entries.push(entry),
            None => return Err(IndexError::malformed("short delta entry")),
        }
    }

    Ok(DeltaArray::from_entries(&entries))
}

/// Parse an array header: u32 count, u32 item size, then `count * item
/// size` bytes which must all be present
fn decode_array_header(value: &[u8]) -> Result<(u32, usize, &[u8])> {
    if value.len() < 8 {
        return Err(IndexError::InsufficientData {
            needed: 8,
            available: value.len(),
        });
    }

    let count = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
    let item_size = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) as usize;

    let total = (count as usize)
        .checked_mul(item_size)
        .ok_or_else(|| IndexError::malformed("array size overflow"))?;
    let body = &value[8..];
    if body.len() < total {
        return Err(IndexError::malformed(format!(
            "array of {} x {} bytes exceeds the {} bytes present",
            count,
            item_size,
            body.len()
        )));
    }

    Ok((count, item_size, &body[..total]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_segment() -> IndexSegment {
        let mut segment = IndexSegment::new(0, DeltaArray::new());
        segment.append_entry(0, 0, 0x40, 0, &[], &[]).unwrap();
        segment.append_entry(0, -1, 0x00, 1000, &[], &[]).unwrap();
        segment.append_entry(0, -2, 0x80, 2100, &[], &[]).unwrap();
        segment
    }

    #[test]
    fn test_append_and_read_entries() {
        let segment = flat_segment();
        assert_eq!(segment.entry_count(), 3);
        assert_eq!(segment.raw_entries().len(), 3 * 11);

        let entry = segment.entry(1).unwrap();
        assert_eq!(entry.stream_offset(), 1000);
        assert_eq!(entry.key_frame_offset(), -1);
        assert_eq!(entry.flags(), 0x00);
        assert!(entry.slice_offset(0).is_none());
        assert!(entry.pos_entry(0).is_none());

        assert!(segment.entry(3).is_none());
    }

    #[test]
    fn test_append_entry_arity_checked() {
        let delta = DeltaArray::from_element_sizes(&[100, 0, 50]);
        let mut segment = IndexSegment::new(0, delta);

        // One slice, so exactly one slice offset is required
        let err = segment.append_entry(0, 0, 0, 0, &[], &[]).unwrap_err();
        assert!(matches!(err, IndexError::ArityMismatch { .. }));

        segment.append_entry(0, 0, 0, 0, &[150], &[]).unwrap();
        assert_eq!(segment.entry(0).unwrap().slice_offset(0), Some(150));
    }

    #[test]
    fn test_update_stream_offset() {
        let mut segment = flat_segment();
        segment.update_stream_offset(2, 2222).unwrap();
        assert_eq!(segment.entry(2).unwrap().stream_offset(), 2222);

        let err = segment.update_stream_offset(3, 0).unwrap_err();
        assert!(matches!(err, IndexError::OutOfRange { edit_unit: 3 }));
    }

    #[test]
    fn test_correct_entry() {
        let mut segment = flat_segment();
        segment.correct_entry(0, 2, -5, 0x33).unwrap();

        let entry = segment.entry(0).unwrap();
        assert_eq!(entry.temporal_offset(), 2);
        assert_eq!(entry.key_frame_offset(), -5);
        assert_eq!(entry.flags(), 0x33);
        // Stream offset untouched
        assert_eq!(entry.stream_offset(), 0);
    }

    #[test]
    fn test_append_raw_entries_size_checked() {
        let mut segment = IndexSegment::new(0, DeltaArray::new());

        let err = segment.append_raw_entries(1, 15, &[0; 15]).unwrap_err();
        assert!(matches!(err, IndexError::Malformed { .. }));

        let err = segment.append_raw_entries(2, 11, &[0; 11]).unwrap_err();
        assert!(matches!(err, IndexError::Malformed { .. }));

        segment.append_raw_entries(2, 11, &[0; 22]).unwrap();
        assert_eq!(segment.entry_count(), 2);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let delta = DeltaArray::from_element_sizes(&[100, 0, 50]);
        let mut segment = IndexSegment::new(7, delta);
        segment.append_entry(1, -1, 0x80, 4096, &[160], &[]).unwrap();
        segment.append_entry(-1, 0, 0x00, 8192, &[170], &[]).unwrap();

        let info = SegmentInfo {
            edit_rate: Rational::new(25, 1),
            index_sid: 129,
            body_sid: 1,
            edit_unit_byte_count: 0,
            index_duration: 2,
        };

        let mut buffer = Vec::new();
        let written = segment.encode_to(&mut buffer, &info).unwrap();
        assert_eq!(written, buffer.len());
        assert!(wire::is_index_table_segment(&buffer[..16]));

        let (length, len_bytes) = wire::decode_ber_length(&buffer[16..]).unwrap();
        let payload = &buffer[16 + len_bytes..];
        assert_eq!(payload.len(), length);

        let (decoded, decoded_info) = IndexSegment::decode_from(payload, 2).unwrap();
        assert_eq!(decoded, segment);
        assert_eq!(decoded_info.edit_rate, info.edit_rate);
        assert_eq!(decoded_info.index_sid, 129);
        assert_eq!(decoded_info.body_sid, 1);
        assert_eq!(decoded_info.edit_unit_byte_count, 0);
        assert_eq!(decoded_info.index_duration, 2);
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut segment = IndexSegment::new(0, DeltaArray::new());
        segment.append_entry(0, 0, 0, 500, &[], &[]).unwrap();

        let mut buffer = Vec::new();
        segment
            .encode_to(&mut buffer, &SegmentInfo::default())
            .unwrap();

        let (_, len_bytes) = wire::decode_ber_length(&buffer[16..]).unwrap();
        let payload = &buffer[16 + len_bytes..];

        // The payload ends with the 23-byte IndexEntryArray item (4-byte
        // tag and length, 8-byte array header, one 11-byte entry). Any
        // cut inside it must fail cleanly.
        for cut in 1..23 {
            assert!(
                IndexSegment::decode_from(&payload[..payload.len() - cut], 2).is_err(),
                "cut of {} bytes decoded anyway",
                cut
            );
        }
    }

    #[test]
    fn test_decode_rejects_inconsistent_entry_size() {
        let mut payload = Vec::new();
        // Delta array with no slices, so entries must be 11 bytes
        let mut delta_bytes = Vec::new();
        delta_bytes.extend_from_slice(&1u32.to_be_bytes());
        delta_bytes.extend_from_slice(&6u32.to_be_bytes());
        delta_bytes.extend_from_slice(&DeltaEntry::new(0, 0, 0).to_bytes());
        wire::write_local_item(&mut payload, tags::DELTA_ENTRY_ARRAY, &delta_bytes).unwrap();

        let mut entry_bytes = Vec::new();
        entry_bytes.extend_from_slice(&1u32.to_be_bytes());
        entry_bytes.extend_from_slice(&15u32.to_be_bytes());
        entry_bytes.extend_from_slice(&[0u8; 15]);
        wire::write_local_item(&mut payload, tags::INDEX_ENTRY_ARRAY, &entry_bytes).unwrap();

        let err = IndexSegment::decode_from(&payload, 2).unwrap_err();
        assert!(matches!(err, IndexError::Malformed { .. }));
    }

    #[test]
    fn test_decode_rejects_mismatched_slice_count() {
        let mut payload = Vec::new();
        let mut delta_bytes = Vec::new();
        delta_bytes.extend_from_slice(&1u32.to_be_bytes());
        delta_bytes.extend_from_slice(&6u32.to_be_bytes());
        delta_bytes.extend_from_slice(&DeltaEntry::new(0, 0, 0).to_bytes());
        wire::write_local_item(&mut payload, tags::DELTA_ENTRY_ARRAY, &delta_bytes).unwrap();
        wire::write_local_item(&mut payload, tags::SLICE_COUNT, &[3]).unwrap();

        let err = IndexSegment::decode_from(&payload, 2).unwrap_err();
        assert!(matches!(err, IndexError::Malformed { .. }));
    }
}

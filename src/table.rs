//! Index tables
//!
//! An index table maps edit unit numbers to byte offsets in an essence
//! container. CBR streams need no per-entry records (the table is a
//! single multiplication); VBR streams store one entry per edit unit
//! across one or more segments.

use crate::delta::{DeltaArray, DeltaEntry};
use crate::error::{IndexError, Result};
use crate::reorder::ReorderIndex;
use crate::segment::{IndexSegment, SegmentInfo};
use crate::types::{EditRate, Rational};
use crate::wire;
use std::collections::BTreeMap;

/// Result of an index table look-up
///
/// `exact` is true when `this_pos` is the requested edit unit and
/// `location` addresses the requested sub-item. When the exact location
/// is not indexed (sparse or incomplete tables), `other_pos` marks that
/// `this_pos`/`location` describe a preceding edit unit instead, as a
/// hint of where to start scanning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexPos {
    /// Edit unit whose data `location` indexes
    pub this_pos: i64,
    /// Byte offset in the essence container
    pub location: u64,
    /// Fractional position offset, when the sub-item has a pos-table slot
    pub pos_offset: Option<Rational>,
    /// True if this is the requested edit unit and sub-item
    pub exact: bool,
    /// True if `this_pos` is a preceding edit unit used as a hint
    pub other_pos: bool,
    /// Offset in edit units back to the previous key frame
    pub key_frame_offset: i8,
    /// Offset in edit units from stored order to display order
    pub temporal_offset: i8,
    /// Location of the key frame edit unit, when addressable
    pub key_location: Option<u64>,
    /// Flags for this edit unit (zero unless exact)
    pub flags: u8,
}

impl IndexPos {
    fn unindexed(edit_unit: i64) -> Self {
        IndexPos {
            this_pos: edit_unit,
            location: 0,
            pos_offset: None,
            exact: false,
            other_pos: false,
            key_frame_offset: 0,
            temporal_offset: 0,
            key_location: None,
            flags: 0,
        }
    }
}

/// An index table for one essence container
///
/// VBR tables own their segments exclusively, keyed by start position.
/// CBR tables have no segments at all; `edit_unit_byte_count` is nonzero
/// instead and lookups take the arithmetic fast path.
#[derive(Debug, Default)]
pub struct IndexTable {
    /// Identifier of this index table
    pub index_sid: u32,
    /// Identifier of the essence container being indexed
    pub body_sid: u32,
    /// Edit rate of the indexed essence
    pub edit_rate: EditRate,
    /// Byte count of every edit unit, nonzero iff CBR
    pub edit_unit_byte_count: u32,
    /// Indexed duration; caller-set for CBR, cached by `duration` for VBR
    pub index_duration: i64,
    base_delta: DeltaArray,
    segment_map: BTreeMap<i64, IndexSegment>,
    reorder: Option<ReorderIndex>,
}

impl IndexTable {
    /// Create an empty table
    pub fn new() -> Self {
        IndexTable::default()
    }

    /// The base delta array shared by all segments
    pub fn base_delta(&self) -> &DeltaArray {
        &self.base_delta
    }

    /// Wire size of one index entry under the current delta array
    pub fn entry_size(&self) -> usize {
        self.base_delta.entry_size()
    }

    /// Number of segments
    pub fn segment_count(&self) -> usize {
        self.segment_map.len()
    }

    /// Iterate segments in start-position order
    pub fn segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segment_map.values()
    }

    /// Define the base delta array from delta entries
    pub fn define_delta_array(&mut self, entries: &[DeltaEntry]) -> Result<()> {
        self.set_base_delta(DeltaArray::from_entries(entries))
    }

    /// Define the base delta array from per-element byte sizes
    pub fn define_delta_array_from_sizes(&mut self, sizes: &[u32]) -> Result<()> {
        self.set_base_delta(DeltaArray::from_element_sizes(sizes))
    }

    /// Install a prepared delta array
    pub fn set_base_delta(&mut self, delta: DeltaArray) -> Result<()> {
        if self.segment_map.values().any(|s| s.entry_count() > 0) {
            return Err(IndexError::InvalidState(
                "delta array cannot change after entries are written".into(),
            ));
        }
        self.base_delta = delta;
        // Empty segments re-snapshot the new layout
        for segment in self.segment_map.values_mut() {
            *segment = IndexSegment::new(segment.start_position(), self.base_delta.clone());
        }
        Ok(())
    }

    /// Create an empty segment at `start_position`, or return the
    /// existing one
    pub fn add_segment(&mut self, start_position: i64) -> &mut IndexSegment {
        let delta = self.base_delta.clone();
        self.segment_map.entry(start_position).or_insert_with(|| {
            log::debug!("new index segment at edit unit {}", start_position);
            IndexSegment::new(start_position, delta)
        })
    }

    /// Decode one IndexTableSegment payload and insert it
    ///
    /// Table-level fields (edit rate, SIDs, CBR byte count, base delta
    /// array) are adopted from the segment when not already set. Returns
    /// the segment's start position.
    pub fn add_segment_from_bytes(&mut self, payload: &[u8], len_size: usize) -> Result<i64> {
        let (segment, info) = IndexSegment::decode_from(payload, len_size)?;
        self.adopt(segment, info)
    }

    /// Iterate a blob of concatenated IndexTableSegment KLVs, inserting
    /// each. Returns the number of segments consumed.
    pub fn add_segments(&mut self, chunk: &[u8]) -> Result<u32> {
        let mut offset = 0;
        let mut added = 0;

        while offset < chunk.len() {
            let remaining = chunk.len() - offset;
            if remaining < 16 {
                return Err(IndexError::InsufficientData {
                    needed: 16,
                    available: remaining,
                });
            }
            if !wire::is_index_table_segment(&chunk[offset..offset + 16]) {
                return Err(IndexError::malformed("key is not an IndexTableSegment"));
            }

            let (length, len_bytes) = wire::decode_ber_length(&chunk[offset + 16..])?;
            let start = offset + 16 + len_bytes;
            if chunk.len() < start + length {
                return Err(IndexError::InsufficientData {
                    needed: length,
                    available: chunk.len() - start,
                });
            }

            self.add_segment_from_bytes(&chunk[start..start + length], 2)?;
            added += 1;
            offset = start + length;
        }

        Ok(added)
    }

    fn adopt(&mut self, segment: IndexSegment, info: SegmentInfo) -> Result<i64> {
        if self.edit_rate.is_unset() {
            self.edit_rate = info.edit_rate;
        }
        if self.index_sid == 0 {
            self.index_sid = info.index_sid;
        }
        if self.body_sid == 0 {
            self.body_sid = info.body_sid;
        }

        let start = segment.start_position();

        if info.edit_unit_byte_count > 0 {
            // CBR: keep zero segments, just adopt the layout
            self.edit_unit_byte_count = info.edit_unit_byte_count;
            if self.base_delta.is_empty() {
                self.base_delta = segment.delta().clone();
            }
            self.index_duration = self.index_duration.max(info.index_duration);
            return Ok(start);
        }

        if self.base_delta.is_empty() && !segment.delta().is_empty() {
            self.base_delta = segment.delta().clone();
        }
        if segment.delta().nsl() != self.base_delta.nsl()
            || segment.delta().npe() != self.base_delta.npe()
        {
            return Err(IndexError::malformed(format!(
                "segment at {} disagrees with the table's delta layout",
                start
            )));
        }

        if self.segment_map.contains_key(&start) {
            return Err(IndexError::AlreadyExists { position: start });
        }
        if let Some((_, prev)) = self.segment_map.range(..start).next_back() {
            if prev.end_position() > start {
                return Err(IndexError::malformed(format!(
                    "segment at {} overlaps the one at {}",
                    start,
                    prev.start_position()
                )));
            }
        }
        if let Some((&next_start, _)) = self.segment_map.range(start..).next() {
            if segment.end_position() > next_start {
                return Err(IndexError::malformed(format!(
                    "segment at {} overlaps the one at {}",
                    start, next_start
                )));
            }
        }

        log::debug!(
            "adding index segment at edit unit {} with {} entries",
            start,
            segment.entry_count()
        );
        self.segment_map.insert(start, segment);
        Ok(start)
    }

    /// Get the segment whose range contains `edit_unit`
    pub fn get_segment(&self, edit_unit: i64) -> Option<&IndexSegment> {
        self.segment_map
            .range(..=edit_unit)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.contains(edit_unit))
    }

    /// Add a single index entry, creating segments as required
    ///
    /// The entry must land on the next free slot of an existing segment
    /// or in a gap (which starts a new segment). Edit units that are
    /// already indexed are rejected.
    #[allow(clippy::too_many_arguments)]
    pub fn add_index_entry(
        &mut self,
        edit_unit: i64,
        temporal_offset: i8,
        key_frame_offset: i8,
        flags: u8,
        stream_offset: u64,
        slice_offsets: &[u32],
        pos_table: &[Rational],
    ) -> Result<()> {
        let target = self.append_target(edit_unit)?;
        self.add_segment(target).append_entry(
            temporal_offset,
            key_frame_offset,
            flags,
            stream_offset,
            slice_offsets,
            pos_table,
        )
    }

    /// Append pre-packed entries starting at `first_edit_unit`
    pub fn add_raw_entries(
        &mut self,
        first_edit_unit: i64,
        count: u32,
        entry_size: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let target = self.append_target(first_edit_unit)?;
        self.add_segment(target)
            .append_raw_entries(count, entry_size, bytes)
    }

    fn append_target(&mut self, edit_unit: i64) -> Result<i64> {
        if self.edit_unit_byte_count > 0 {
            return Err(IndexError::InvalidState(
                "CBR tables carry no index entries".into(),
            ));
        }

        match self.segment_map.range(..=edit_unit).next_back() {
            Some((_, seg)) if edit_unit < seg.end_position() => Err(IndexError::AlreadyExists {
                position: edit_unit,
            }),
            Some((&start, seg)) if edit_unit == seg.end_position() => Ok(start),
            _ => Ok(edit_unit),
        }
    }

    /// Rewrite the stream offset of an already-written entry
    pub fn update(&mut self, edit_unit: i64, stream_offset: u64) -> Result<()> {
        self.segment_mut(edit_unit)?
            .update_stream_offset(edit_unit, stream_offset)
    }

    /// Rewrite the temporal offset, key-frame offset and flags of an
    /// already-written entry without touching its offsets
    pub fn correct(
        &mut self,
        edit_unit: i64,
        temporal_offset: i8,
        key_frame_offset: i8,
        flags: u8,
    ) -> Result<()> {
        self.segment_mut(edit_unit)?
            .correct_entry(edit_unit, temporal_offset, key_frame_offset, flags)
    }

    fn segment_mut(&mut self, edit_unit: i64) -> Result<&mut IndexSegment> {
        self.segment_map
            .range_mut(..=edit_unit)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.contains(edit_unit))
            .ok_or(IndexError::OutOfRange { edit_unit })
    }

    /// Free memory by deleting segments lying entirely within
    /// `[first, last]`. Segments are not split.
    pub fn purge(&mut self, first: i64, last: i64) {
        let before = self.segment_map.len();
        self.segment_map
            .retain(|_, seg| seg.start_position() < first || seg.end_position() - 1 > last);
        let removed = before - self.segment_map.len();
        if removed > 0 {
            log::debug!("purged {} segments in [{}, {}]", removed, first, last);
        }
    }

    /// Duration of this table: one past the highest indexed edit unit
    ///
    /// VBR tables compute it from their segments and cache the result in
    /// `index_duration`; CBR tables report whatever duration was set.
    pub fn duration(&mut self) -> i64 {
        if self.edit_unit_byte_count > 0 {
            return self.index_duration;
        }
        let duration = self
            .segment_map
            .values()
            .map(|s| s.end_position())
            .max()
            .unwrap_or(0);
        self.index_duration = duration;
        duration
    }

    /// Serialize the whole table as IndexTableSegment KLVs
    ///
    /// A CBR table becomes a single segment with only an edit unit byte
    /// count; a VBR table emits each segment in start-position order.
    /// Returns the number of bytes appended to `buffer`.
    pub fn write_to(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut info = SegmentInfo {
            edit_rate: self.edit_rate,
            index_sid: self.index_sid,
            body_sid: self.body_sid,
            edit_unit_byte_count: self.edit_unit_byte_count,
            index_duration: self.index_duration,
        };

        if self.edit_unit_byte_count > 0 {
            let segment = IndexSegment::new(0, self.base_delta.clone());
            return segment.encode_to(buffer, &info);
        }

        let mut written = 0;
        for segment in self.segment_map.values() {
            info.index_duration = segment.entry_count() as i64;
            written += segment.encode_to(buffer, &info)?;
        }
        Ok(written)
    }

    /// Enable reordered building and get the reorder buffer
    pub fn enable_reorder(&mut self) -> &mut ReorderIndex {
        let entry_size = self.base_delta.entry_size();
        self.reorder
            .get_or_insert_with(|| ReorderIndex::new(entry_size))
    }

    /// The reorder buffer, if one has been enabled
    pub fn reorder(&self) -> Option<&ReorderIndex> {
        self.reorder.as_ref()
    }

    /// Mutable access to the reorder buffer, if one has been enabled
    pub fn reorder_mut(&mut self) -> Option<&mut ReorderIndex> {
        self.reorder.as_mut()
    }

    /// Commit complete entries from the reorder buffer into the table
    ///
    /// `count` limits how many entries to commit; `None` commits all
    /// complete ones. Returns the number committed.
    pub fn commit_reordered(&mut self, count: Option<u32>) -> Result<u32> {
        let mut reorder = match self.reorder.take() {
            Some(r) => r,
            None => return Ok(0),
        };
        let result = reorder.commit_entries(self, count);
        self.reorder = Some(reorder);
        result
    }

    /// Perform an index table look-up
    ///
    /// Never fails: edit units that are not indexed come back with
    /// `exact = false`, carrying a preceding position as a hint when one
    /// exists (`other_pos = true`).
    ///
    /// With `reorder` set, entries whose temporal offset is nonzero are
    /// resolved to the entry holding the display-order data; stream-order
    /// callers pass `reorder = false`.
    pub fn lookup(&self, edit_unit: i64, sub_item: usize, reorder: bool) -> IndexPos {
        if self.edit_unit_byte_count > 0 {
            return self.lookup_cbr(edit_unit, sub_item);
        }

        let segment = match self.get_segment(edit_unit) {
            Some(s) => s,
            None => return self.lookup_preceding(edit_unit, sub_item),
        };

        let index = (edit_unit - segment.start_position()) as u32;
        let first = match segment.entry(index) {
            Some(e) => e,
            None => return IndexPos::unindexed(edit_unit),
        };

        // Reordered entries point at the edit unit holding their
        // display-order data; follow one hop when it stays in range.
        let requested_temporal = first.temporal_offset();
        let mut target = index;
        if reorder && requested_temporal != 0 {
            let display = edit_unit + requested_temporal as i64;
            if segment.contains(display) {
                target = (display - segment.start_position()) as u32;
            }
        }
        let entry = match segment.entry(target) {
            Some(e) => e,
            None => first,
        };

        let (slice, element_delta, pos_index) = match delta_parts(segment.delta(), sub_item) {
            Some(parts) => parts,
            None => return IndexPos::unindexed(edit_unit),
        };

        let mut location = entry.stream_offset();
        if slice > 0 {
            location += entry.slice_offset(slice as usize - 1).unwrap_or(0) as u64;
        }
        location += element_delta as u64;

        let pos_offset = if pos_index > 0 {
            entry.pos_entry(pos_index as usize - 1)
        } else {
            None
        };

        let key_frame_offset = entry.key_frame_offset();
        let key_location = self.raw_stream_offset(edit_unit + key_frame_offset as i64);

        IndexPos {
            this_pos: edit_unit,
            location,
            pos_offset,
            exact: true,
            other_pos: false,
            key_frame_offset,
            temporal_offset: requested_temporal,
            key_location,
            flags: entry.flags(),
        }
    }

    fn lookup_cbr(&self, edit_unit: i64, sub_item: usize) -> IndexPos {
        if edit_unit < 0 {
            return IndexPos::unindexed(edit_unit);
        }
        let (_, element_delta, _) = match delta_parts(&self.base_delta, sub_item) {
            Some(parts) => parts,
            None => return IndexPos::unindexed(edit_unit),
        };

        let location = edit_unit as u64 * self.edit_unit_byte_count as u64 + element_delta as u64;
        IndexPos {
            this_pos: edit_unit,
            location,
            pos_offset: None,
            exact: true,
            other_pos: false,
            key_frame_offset: 0,
            temporal_offset: 0,
            key_location: Some(location),
            flags: 0,
        }
    }

    /// Hint path: the edit unit is not indexed, so report the last entry
    /// of the nearest preceding segment instead
    fn lookup_preceding(&self, edit_unit: i64, sub_item: usize) -> IndexPos {
        let preceding = self
            .segment_map
            .range(..=edit_unit)
            .rev()
            .map(|(_, s)| s)
            .find(|s| s.entry_count() > 0);

        let segment = match preceding {
            Some(s) => s,
            None => return IndexPos::unindexed(edit_unit),
        };
        let entry = match segment.entry(segment.entry_count() - 1) {
            Some(e) => e,
            None => return IndexPos::unindexed(edit_unit),
        };
        let (slice, element_delta, _) = match delta_parts(segment.delta(), sub_item) {
            Some(parts) => parts,
            None => return IndexPos::unindexed(edit_unit),
        };

        let mut location = entry.stream_offset();
        if slice > 0 {
            location += entry.slice_offset(slice as usize - 1).unwrap_or(0) as u64;
        }
        location += element_delta as u64;

        IndexPos {
            this_pos: segment.end_position() - 1,
            location,
            pos_offset: None,
            exact: false,
            other_pos: true,
            key_frame_offset: 0,
            temporal_offset: 0,
            key_location: None,
            flags: 0,
        }
    }

    /// Raw stream offset of the entry indexed at `edit_unit`, searching
    /// across segments but never following temporal reordering
    fn raw_stream_offset(&self, edit_unit: i64) -> Option<u64> {
        let segment = self.get_segment(edit_unit)?;
        segment
            .entry((edit_unit - segment.start_position()) as u32)
            .map(|e| e.stream_offset())
    }
}

/// Resolve a sub-item against a delta array: (slice, element delta,
/// pos-table index). An empty array indexes sub-item 0 at delta 0; any
/// other unidentifiable sub-item yields `None`.
fn delta_parts(delta: &DeltaArray, sub_item: usize) -> Option<(u8, u32, i8)> {
    if delta.is_empty() {
        if sub_item == 0 {
            Some((0, 0, 0))
        } else {
            None
        }
    } else {
        delta
            .get(sub_item)
            .map(|d| (d.slice, d.element_delta, d.pos_table_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vbr_table(offsets: &[u64], flags: &[u8]) -> IndexTable {
        let mut table = IndexTable::new();
        for (i, (&offset, &flag)) in offsets.iter().zip(flags).enumerate() {
            table
                .add_index_entry(i as i64, 0, 0, flag, offset, &[], &[])
                .unwrap();
        }
        table
    }

    #[test]
    fn test_cbr_lookup() {
        let mut table = IndexTable::new();
        table.edit_unit_byte_count = 16384;
        table
            .define_delta_array(&[DeltaEntry::new(0, 0, 0)])
            .unwrap();

        let pos = table.lookup(42, 0, true);
        assert_eq!(pos.this_pos, 42);
        assert_eq!(pos.location, 688128);
        assert!(pos.exact);
        assert!(!pos.other_pos);
        assert_eq!(pos.flags, 0);
        assert_eq!(pos.key_location, Some(688128));

        assert!(!table.lookup(-1, 0, true).exact);
    }

    #[test]
    fn test_vbr_exact_lookup() {
        let table = vbr_table(&[0, 1000, 2100], &[0x40, 0x00, 0x80]);

        let pos = table.lookup(1, 0, true);
        assert_eq!(pos.this_pos, 1);
        assert_eq!(pos.location, 1000);
        assert!(pos.exact);
        assert_eq!(pos.flags, 0x00);
    }

    #[test]
    fn test_vbr_miss_returns_hint() {
        let table = vbr_table(&[0, 1000, 2100], &[0x40, 0x00, 0x80]);

        let pos = table.lookup(5, 0, true);
        assert_eq!(pos.this_pos, 2);
        assert_eq!(pos.location, 2100);
        assert!(!pos.exact);
        assert!(pos.other_pos);
        assert_eq!(pos.flags, 0);
    }

    #[test]
    fn test_lookup_empty_table() {
        let table = IndexTable::new();
        let pos = table.lookup(7, 0, true);
        assert!(!pos.exact);
        assert!(!pos.other_pos);
        assert_eq!(pos.location, 0);
    }

    #[test]
    fn test_temporal_reorder_lookup() {
        let mut table = IndexTable::new();
        let temporal = [2i8, -1, -1];
        let offsets = [0u64, 500, 1500];
        for i in 0..3 {
            table
                .add_index_entry(i as i64, temporal[i], 0, 0, offsets[i], &[], &[])
                .unwrap();
        }

        let pos = table.lookup(0, 0, true);
        assert_eq!(pos.location, 1500);
        assert_eq!(pos.temporal_offset, 2);
        assert!(pos.exact);

        let pos = table.lookup(0, 0, false);
        assert_eq!(pos.location, 0);
        assert_eq!(pos.temporal_offset, 2);
    }

    #[test]
    fn test_reorder_target_outside_segment_falls_through() {
        let mut table = IndexTable::new();
        // Temporal offset points past the end of the segment
        table.add_index_entry(0, 5, 0, 0, 111, &[], &[]).unwrap();
        table.add_index_entry(1, 0, 0, 0, 222, &[], &[]).unwrap();

        let pos = table.lookup(0, 0, true);
        assert_eq!(pos.location, 111);
        assert!(pos.exact);
    }

    #[test]
    fn test_key_frame_location_across_segments() {
        let mut table = IndexTable::new();
        table.add_index_entry(0, 0, 0, 0x40, 5000, &[], &[]).unwrap();
        // Gap: a new segment starts at 10
        table
            .add_index_entry(10, 0, -10, 0, 9000, &[], &[])
            .unwrap();

        let pos = table.lookup(10, 0, true);
        assert!(pos.exact);
        assert_eq!(pos.key_frame_offset, -10);
        assert_eq!(pos.key_location, Some(5000));

        // Unreachable key frame
        let mut table = IndexTable::new();
        table.add_index_entry(0, 0, -3, 0, 100, &[], &[]).unwrap();
        assert_eq!(table.lookup(0, 0, true).key_location, None);
    }

    #[test]
    fn test_unknown_sub_item_is_inexact() {
        let mut table = IndexTable::new();
        table
            .define_delta_array(&[DeltaEntry::new(0, 0, 0), DeltaEntry::new(0, 0, 100)])
            .unwrap();
        table.add_index_entry(0, 0, 0, 0, 1000, &[], &[]).unwrap();

        assert_eq!(table.lookup(0, 1, true).location, 1100);
        assert!(!table.lookup(0, 2, true).exact);
    }

    #[test]
    fn test_add_index_entry_rejects_rewrites() {
        let mut table = vbr_table(&[0, 10], &[0, 0]);
        let err = table.add_index_entry(1, 0, 0, 0, 99, &[], &[]).unwrap_err();
        assert!(matches!(err, IndexError::AlreadyExists { position: 1 }));
    }

    #[test]
    fn test_sparse_entries_break_segments() {
        let mut table = IndexTable::new();
        table.add_index_entry(0, 0, 0, 0, 0, &[], &[]).unwrap();
        table.add_index_entry(1, 0, 0, 0, 10, &[], &[]).unwrap();
        table.add_index_entry(5, 0, 0, 0, 50, &[], &[]).unwrap();

        assert_eq!(table.segment_count(), 2);
        assert!(table.get_segment(1).is_some());
        assert!(table.get_segment(3).is_none());
        assert!(table.get_segment(5).is_some());
    }

    #[test]
    fn test_update_and_correct() {
        let mut table = vbr_table(&[0, 1000], &[0, 0]);

        table.update(1, 1234).unwrap();
        assert_eq!(table.lookup(1, 0, true).location, 1234);

        table.correct(1, 0, -1, 0x80).unwrap();
        let pos = table.lookup(1, 0, true);
        assert_eq!(pos.flags, 0x80);
        assert_eq!(pos.key_frame_offset, -1);
        assert_eq!(pos.location, 1234);

        assert!(matches!(
            table.update(9, 0),
            Err(IndexError::OutOfRange { edit_unit: 9 })
        ));
    }

    #[test]
    fn test_duration_caches() {
        let mut table = IndexTable::new();
        assert_eq!(table.duration(), 0);

        table.add_index_entry(0, 0, 0, 0, 0, &[], &[]).unwrap();
        table.add_index_entry(10, 0, 0, 0, 0, &[], &[]).unwrap();
        table.add_index_entry(11, 0, 0, 0, 0, &[], &[]).unwrap();

        assert_eq!(table.duration(), 12);
        assert_eq!(table.index_duration, 12);
    }

    #[test]
    fn test_purge_whole_segments_only() {
        let mut table = IndexTable::new();
        table.add_index_entry(0, 0, 0, 0, 0, &[], &[]).unwrap();
        table.add_index_entry(1, 0, 0, 0, 0, &[], &[]).unwrap();
        table.add_index_entry(10, 0, 0, 0, 0, &[], &[]).unwrap();

        // Range covers only part of the first segment: nothing deleted
        table.purge(1, 1);
        assert_eq!(table.segment_count(), 2);

        table.purge(0, 1);
        assert_eq!(table.segment_count(), 1);
        assert!(table.get_segment(0).is_none());
        assert!(table.get_segment(10).is_some());
    }

    #[test]
    fn test_delta_array_locked_after_entries() {
        let mut table = IndexTable::new();
        table.add_index_entry(0, 0, 0, 0, 0, &[], &[]).unwrap();

        let err = table
            .define_delta_array(&[DeltaEntry::new(0, 0, 0)])
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidState(_)));
    }

    #[test]
    fn test_write_and_reload_vbr_table() {
        let mut table = IndexTable::new();
        table.index_sid = 129;
        table.body_sid = 1;
        table.edit_rate = Rational::new(25, 1);
        table.add_index_entry(0, 0, 0, 0x40, 0, &[], &[]).unwrap();
        table.add_index_entry(1, 0, 0, 0, 1000, &[], &[]).unwrap();
        table.add_index_entry(10, 0, 0, 0, 9000, &[], &[]).unwrap();

        let mut buffer = Vec::new();
        let written = table.write_to(&mut buffer).unwrap();
        assert_eq!(written, buffer.len());

        let mut reloaded = IndexTable::new();
        assert_eq!(reloaded.add_segments(&buffer).unwrap(), 2);
        assert_eq!(reloaded.index_sid, 129);
        assert_eq!(reloaded.edit_rate, Rational::new(25, 1));
        assert_eq!(reloaded.lookup(1, 0, true).location, 1000);
        assert_eq!(reloaded.lookup(10, 0, true).location, 9000);
        assert_eq!(reloaded.duration(), 11);
    }

    #[test]
    fn test_write_and_reload_cbr_table() {
        let mut table = IndexTable::new();
        table.index_sid = 2;
        table.body_sid = 1;
        table.edit_rate = Rational::new(30000, 1001);
        table.edit_unit_byte_count = 4096;
        table.index_duration = 250;
        table.define_delta_array_from_sizes(&[4096]).unwrap();

        let mut buffer = Vec::new();
        table.write_to(&mut buffer).unwrap();

        let mut reloaded = IndexTable::new();
        assert_eq!(reloaded.add_segments(&buffer).unwrap(), 1);
        assert_eq!(reloaded.edit_unit_byte_count, 4096);
        assert_eq!(reloaded.segment_count(), 0);
        assert_eq!(reloaded.duration(), 250);
        assert_eq!(reloaded.lookup(3, 0, true).location, 3 * 4096);
    }
}

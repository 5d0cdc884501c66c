//! Staged index building
//!
//! Writers learn the pieces of an index entry at different times: the
//! stream offset when the edit unit is written, flags and key-frame
//! offsets from the encoder, temporal offsets only once the reordering
//! window closes. The manager accepts each piece as it arrives, keeps
//! per-field known/unknown state, resolves cross-entry temporal
//! references, and emits a finished [`IndexTable`] on demand.

use crate::delta::DeltaArray;
use crate::error::{IndexError, Result};
use crate::table::IndexTable;
use crate::types::{EditRate, Rational};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

/// Stream offset recorded
const STATUS_STREAM_OFFSET: u8 = 0x01;
/// Temporal offset recorded
const STATUS_TEMPORAL_OFFSET: u8 = 0x02;
/// Temporal diff recorded
const STATUS_TEMPORAL_DIFF: u8 = 0x04;

/// Per-edit-unit staging record
#[derive(Debug, Clone)]
struct IndexData {
    status: u8,
    flags: u8,
    key_offset: i8,
    /// Offset from this edit unit to the entry holding its stream offsets
    temporal_offset: i8,
    /// Offset from this entry to the edit unit it is indexed under;
    /// the inverse of `temporal_offset`
    temporal_diff: i8,
    /// One offset per stream, main stream first
    stream_offset: Vec<u64>,
}

impl IndexData {
    fn new(stream_count: usize) -> Self {
        IndexData {
            status: 0,
            flags: 0,
            key_offset: 0,
            temporal_offset: 0,
            temporal_diff: 0,
            stream_offset: vec![0; stream_count],
        }
    }
}

/// Builds index tables from asynchronously arriving edit-unit details
///
/// One manager indexes one essence container: a main stream (ID 0) plus
/// any sub-streams. Offsets, flags, key-frame offsets and temporal
/// offsets may arrive in any order; entries only leave the manager via
/// [`IndexManager::add_entries_to_index`] once their mandatory fields
/// are known.
#[derive(Debug)]
pub struct IndexManager {
    uses_reordering: bool,
    /// Set once the first record exists; the stream list is frozen then
    format_fixed: bool,
    data_is_cbr: bool,
    /// PosTableIndex per stream
    pos_table: Vec<i8>,
    /// Element size per stream, zero for VBR elements
    element_sizes: Vec<u32>,
    /// The stream allowed to set flags and key offsets
    master_stream: usize,
    managed: BTreeMap<i64, IndexData>,
    /// Entry offered but not yet accepted into `managed`
    provisional: Option<(i64, IndexData)>,
    /// Temporal offsets for records that do not exist yet
    unsatisfied_temporal_offsets: BTreeMap<i64, i8>,
    /// Temporal diffs for records that do not exist yet
    unsatisfied_temporal_diffs: BTreeMap<i64, i8>,
    body_sid: u32,
    index_sid: u32,
    edit_rate: EditRate,
    entry_log: HashMap<i32, i64>,
    next_log_id: i32,
    log_wrapped: bool,
    /// Armed log slot for the next recorded edit unit
    log_next_entry: Option<i32>,
    /// One-shot latch making the next offer unconditionally accepted
    accept_next_entry: bool,
    last_new_edit_unit: Option<i64>,
    value_relative_indexing: bool,
    /// Edit units discarded at the start of the essence when sub-ranging
    sub_range_offset: i64,
    index_duration: i64,
}

impl IndexManager {
    /// Create a manager for a main stream with the given pos-table index
    /// and element size (zero for VBR essence)
    pub fn new(pos_table_index: i8, element_size: u32) -> Self {
        IndexManager {
            uses_reordering: false,
            format_fixed: false,
            data_is_cbr: true,
            pos_table: vec![pos_table_index],
            element_sizes: vec![element_size],
            master_stream: 0,
            managed: BTreeMap::new(),
            provisional: None,
            unsatisfied_temporal_offsets: BTreeMap::new(),
            unsatisfied_temporal_diffs: BTreeMap::new(),
            body_sid: 0,
            index_sid: 0,
            edit_rate: EditRate::default(),
            entry_log: HashMap::new(),
            next_log_id: 0,
            log_wrapped: false,
            log_next_entry: None,
            accept_next_entry: false,
            last_new_edit_unit: None,
            value_relative_indexing: false,
            sub_range_offset: 0,
            index_duration: 0,
        }
    }

    /// Add a sub-stream, returning its stream ID
    pub fn add_sub_stream(&mut self, pos_table_index: i8, element_size: u32) -> Result<usize> {
        if self.format_fixed {
            return Err(IndexError::InvalidState(
                "streams cannot change once entries are recorded".into(),
            ));
        }
        self.pos_table.push(pos_table_index);
        self.element_sizes.push(element_size);
        Ok(self.element_sizes.len() - 1)
    }

    /// Number of streams, including the main stream
    pub fn stream_count(&self) -> usize {
        self.element_sizes.len()
    }

    /// Update the pos-table index of a stream
    pub fn set_pos_table_index(&mut self, stream: usize, pos_table_index: i8) -> Result<()> {
        self.check_stream(stream)?;
        self.pos_table[stream] = pos_table_index;
        Ok(())
    }

    /// Designate the stream allowed to set flags and key offsets
    pub fn set_master_stream(&mut self, stream: usize) -> Result<()> {
        self.check_stream(stream)?;
        self.master_stream = stream;
        Ok(())
    }

    pub fn set_body_sid(&mut self, sid: u32) {
        self.body_sid = sid;
    }

    pub fn body_sid(&self) -> u32 {
        self.body_sid
    }

    pub fn set_index_sid(&mut self, sid: u32) {
        self.index_sid = sid;
    }

    pub fn index_sid(&self) -> u32 {
        self.index_sid
    }

    pub fn set_edit_rate(&mut self, edit_rate: EditRate) {
        self.edit_rate = edit_rate;
    }

    pub fn edit_rate(&self) -> EditRate {
        self.edit_rate
    }

    /// Record an edit unit of a stream without a known offset
    ///
    /// Flags and the key offset only take effect from the master stream;
    /// `None` flags leave any previous value untouched.
    pub fn add_edit_unit(
        &mut self,
        stream: usize,
        edit_unit: i64,
        key_offset: i8,
        flags: Option<u8>,
    ) -> Result<()> {
        self.check_stream(stream)?;
        let master = stream == self.master_stream;

        let data = self.record_mut(edit_unit);
        if master {
            data.key_offset = key_offset;
            if let Some(f) = flags {
                data.flags = f;
            }
        }

        self.last_new_edit_unit = Some(edit_unit);
        self.log(edit_unit);
        Ok(())
    }

    /// Record the offset of an edit unit of a stream
    pub fn set_offset(
        &mut self,
        stream: usize,
        edit_unit: i64,
        offset: u64,
        key_offset: i8,
        flags: Option<u8>,
    ) -> Result<()> {
        self.check_stream(stream)?;

        // A single offset off the regular grid makes the data VBR for good
        if self.data_is_cbr && edit_unit >= 0 {
            let expected =
                edit_unit as u64 * self.total_element_size() + self.stream_prefix(stream);
            if offset != expected {
                log::debug!(
                    "offset {} at edit unit {} breaks the CBR pattern (expected {})",
                    offset,
                    edit_unit,
                    expected
                );
                self.data_is_cbr = false;
            }
        }

        let master = stream == self.master_stream;
        let data = self.record_mut(edit_unit);
        data.stream_offset[stream] = offset;
        data.status |= STATUS_STREAM_OFFSET;
        if master {
            data.key_offset = key_offset;
            if let Some(f) = flags {
                data.flags = f;
            }
        }

        self.last_new_edit_unit = Some(edit_unit);
        self.log(edit_unit);
        Ok(())
    }

    /// Offer an edit unit without an offset; accepted if the one-shot
    /// latch is armed or the edit unit is already known. A declined
    /// offer is staged as the provisional entry.
    pub fn offer_edit_unit(
        &mut self,
        stream: usize,
        edit_unit: i64,
        key_offset: i8,
        flags: Option<u8>,
    ) -> Result<bool> {
        if self.accept_next_entry || self.managed.contains_key(&edit_unit) {
            self.accept_next_entry = false;
            self.add_edit_unit(stream, edit_unit, key_offset, flags)?;
            Ok(true)
        } else {
            self.stage_provisional(stream, edit_unit, None, key_offset, flags)?;
            Ok(false)
        }
    }

    /// Offer an edit unit's offset, with the same acceptance rules as
    /// [`IndexManager::offer_edit_unit`]
    pub fn offer_offset(
        &mut self,
        stream: usize,
        edit_unit: i64,
        offset: u64,
        key_offset: i8,
        flags: Option<u8>,
    ) -> Result<bool> {
        if self.accept_next_entry || self.managed.contains_key(&edit_unit) {
            self.accept_next_entry = false;
            self.set_offset(stream, edit_unit, offset, key_offset, flags)?;
            Ok(true)
        } else {
            self.stage_provisional(stream, edit_unit, Some(offset), key_offset, flags)?;
            Ok(false)
        }
    }

    /// Record the temporal offset of an edit unit and the matching
    /// temporal diff at its target
    ///
    /// Either side may refer to an edit unit with no record yet; the
    /// value is parked and drained into the record when it is created.
    pub fn set_temporal_offset(&mut self, edit_unit: i64, offset: i8) {
        self.uses_reordering = true;

        match self.managed.get_mut(&edit_unit) {
            Some(data) => {
                data.temporal_offset = offset;
                data.status |= STATUS_TEMPORAL_OFFSET;
            }
            None => {
                self.unsatisfied_temporal_offsets.insert(edit_unit, offset);
            }
        }

        let target = edit_unit + offset as i64;
        match self.managed.get_mut(&target) {
            Some(data) => {
                data.temporal_diff = -offset;
                data.status |= STATUS_TEMPORAL_DIFF;
            }
            None => {
                self.unsatisfied_temporal_diffs.insert(target, -offset);
            }
        }
    }

    /// Offer a temporal offset; accepted if the latch is armed or the
    /// edit unit is already known
    pub fn offer_temporal_offset(&mut self, edit_unit: i64, offset: i8) -> bool {
        if self.accept_next_entry || self.managed.contains_key(&edit_unit) {
            self.accept_next_entry = false;
            self.set_temporal_offset(edit_unit, offset);
            true
        } else {
            false
        }
    }

    /// Record the key-frame offset of an edit unit
    pub fn set_key_offset(&mut self, edit_unit: i64, offset: i8) {
        self.record_mut(edit_unit).key_offset = offset;
    }

    /// Offer a key-frame offset; accepted if the latch is armed or the
    /// edit unit is already known
    pub fn offer_key_offset(&mut self, edit_unit: i64, offset: i8) -> bool {
        if self.accept_next_entry || self.managed.contains_key(&edit_unit) {
            self.accept_next_entry = false;
            self.set_key_offset(edit_unit, offset);
            true
        } else {
            false
        }
    }

    /// Promote the staged provisional entry, returning its edit unit
    pub fn accept_provisional(&mut self) -> Option<i64> {
        let (edit_unit, mut data) = self.provisional.take()?;

        if let Entry::Vacant(slot) = self.managed.entry(edit_unit) {
            if let Some(offset) = self.unsatisfied_temporal_offsets.remove(&edit_unit) {
                data.temporal_offset = offset;
                data.status |= STATUS_TEMPORAL_OFFSET;
            }
            if let Some(diff) = self.unsatisfied_temporal_diffs.remove(&edit_unit) {
                data.temporal_diff = diff;
                data.status |= STATUS_TEMPORAL_DIFF;
            }
            slot.insert(data);
            self.format_fixed = true;
        }

        self.last_new_edit_unit = Some(edit_unit);
        Some(edit_unit)
    }

    /// Edit unit of the last entry recorded
    pub fn last_new_edit_unit(&self) -> Option<i64> {
        self.last_new_edit_unit
    }

    /// Accept the next offer unconditionally
    pub fn accept_next(&mut self) {
        self.accept_next_entry = true;
    }

    /// Arm a log slot for the next recorded edit unit
    ///
    /// Returns the slot ID for [`IndexManager::read_log`], or `None` if
    /// every slot is in use.
    pub fn log_next(&mut self) -> Option<i32> {
        if self.log_next_entry.is_some() {
            return self.log_next_entry;
        }

        let mut id = self.next_log_id;
        if self.log_wrapped {
            let start = id;
            while self.entry_log.contains_key(&id) {
                id = if id == i32::MAX { 0 } else { id + 1 };
                if id == start {
                    return None;
                }
            }
        }

        if id == i32::MAX {
            self.log_wrapped = true;
            self.next_log_id = 0;
        } else {
            self.next_log_id = id + 1;
        }

        self.log_next_entry = Some(id);
        Some(id)
    }

    /// Accept the next offer and log it
    pub fn accept_log_next(&mut self) -> Option<i32> {
        self.accept_next();
        self.log_next()
    }

    /// Read the edit unit recorded in a log slot
    pub fn read_log(&self, log_id: i32) -> Option<i64> {
        self.entry_log.get(&log_id).copied()
    }

    /// Free memory by deleting records in `[first, last]`
    ///
    /// Tables already generated from these records are unaffected.
    pub fn flush(&mut self, first_edit_unit: i64, last_edit_unit: i64) {
        self.managed
            .retain(|&eu, _| eu < first_edit_unit || eu > last_edit_unit);
    }

    /// Lowest edit unit whose mandatory fields are all known
    pub fn first_available(&self) -> Option<i64> {
        let required = self.required_status();
        self.managed
            .iter()
            .find(|(_, data)| data.status & required == required)
            .map(|(&eu, _)| eu)
    }

    /// Highest available edit unit
    ///
    /// When reordering is in use this is the end of the contiguous
    /// complete run starting at the first available entry, since later
    /// entries may still acquire earlier temporal references.
    pub fn last_available(&self) -> Option<i64> {
        let required = self.required_status();

        if !self.uses_reordering {
            return self
                .managed
                .iter()
                .rev()
                .find(|(_, data)| data.status & required == required)
                .map(|(&eu, _)| eu);
        }

        let first = self.first_available()?;
        let mut last = None;
        let mut expected = first;
        for (&eu, data) in self.managed.range(first..) {
            if eu != expected || data.status & required != required {
                break;
            }
            last = Some(eu);
            expected += 1;
        }
        last
    }

    /// True while every recorded offset fits the constant-rate pattern
    pub fn is_cbr(&self) -> bool {
        self.data_is_cbr
    }

    /// Treat the data as VBR even if every offset fits the CBR pattern,
    /// e.g. when unindexed KLVs sit between edit units
    pub fn force_vbr(&mut self) {
        self.data_is_cbr = false;
    }

    /// Value-relative tables count from the first byte of the KLV value
    /// rather than the key. The flag is stored for the caller; the
    /// manager itself never adjusts offsets, and such tables must not be
    /// written to a file.
    pub fn set_value_relative_indexing(&mut self, value_relative: bool) {
        self.value_relative_indexing = value_relative;
    }

    pub fn value_relative_indexing(&self) -> bool {
        self.value_relative_indexing
    }

    /// Number of edit units discarded at the start of the essence;
    /// subtracted from positions when emitting entries
    pub fn set_sub_range_offset(&mut self, offset: i64) {
        self.sub_range_offset = offset;
    }

    /// Force the duration written with CBR tables
    pub fn set_index_duration(&mut self, duration: i64) {
        self.index_duration = duration;
    }

    /// Generate a CBR table, or an empty VBR table ready for
    /// [`IndexManager::add_entries_to_index`]
    pub fn make_index(&self) -> Result<IndexTable> {
        let mut table = IndexTable::new();
        table.index_sid = self.index_sid;
        table.body_sid = self.body_sid;
        table.edit_rate = self.edit_rate;

        let mut delta = DeltaArray::from_element_sizes(&self.element_sizes);
        for (stream, &pos) in self.pos_table.iter().enumerate() {
            if pos != 0 {
                delta.set_pos_table_index(stream, pos)?;
            }
        }
        table.set_base_delta(delta)?;

        if self.data_is_cbr {
            table.edit_unit_byte_count = self.total_element_size() as u32;
            table.index_duration = self.index_duration;
            log::debug!(
                "made CBR index table, {} bytes per edit unit",
                table.edit_unit_byte_count
            );
        } else {
            log::debug!("made empty VBR index table for {} streams", self.stream_count());
        }

        Ok(table)
    }

    /// Add all complete entries in `[first_edit_unit, last_edit_unit]`
    /// to `table`, breaking segments at gaps. Returns the number added.
    ///
    /// With `undo_reorder` the entries are written in display order:
    /// each entry takes its stream offsets from the record its temporal
    /// offset points at, and the emitted temporal offset is zero.
    pub fn add_entries_to_index(
        &self,
        undo_reorder: bool,
        table: &mut IndexTable,
        first_edit_unit: Option<i64>,
        last_edit_unit: Option<i64>,
    ) -> Result<u32> {
        let required = self.required_status();
        let lo = first_edit_unit.unwrap_or(i64::MIN);
        let hi = last_edit_unit.unwrap_or(i64::MAX);

        let delta = table.base_delta().clone();
        let nsl = delta.nsl() as usize;
        let pos_table = vec![Rational::default(); delta.npe() as usize];

        let mut added = 0;
        for (&edit_unit, data) in self.managed.range(lo..=hi) {
            if data.status & required != required {
                continue;
            }

            let source = if undo_reorder {
                let target = edit_unit + data.temporal_offset as i64;
                match self.managed.get(&target) {
                    Some(d) if d.status & STATUS_STREAM_OFFSET != 0 => d,
                    _ => continue,
                }
            } else {
                data
            };

            // Slice offsets are the distances from the main stream to
            // each sub-stream that opens a new slice
            let mut slices = vec![0u32; nsl];
            for stream in 1..source.stream_offset.len().min(delta.len()) {
                let (slice, previous) = match (delta.get(stream), delta.get(stream - 1)) {
                    (Some(d), Some(p)) => (d.slice as usize, p.slice as usize),
                    _ => break,
                };
                if slice > previous && slice <= nsl {
                    slices[slice - 1] =
                        source.stream_offset[stream].saturating_sub(source.stream_offset[0]) as u32;
                }
            }

            let temporal_offset = if undo_reorder { 0 } else { data.temporal_offset };
            table.add_index_entry(
                edit_unit - self.sub_range_offset,
                temporal_offset,
                data.key_offset,
                data.flags,
                source.stream_offset[0],
                &slices,
                &pos_table,
            )?;
            added += 1;
        }

        log::debug!("committed {} entries to the index table", added);
        Ok(added)
    }

    fn required_status(&self) -> u8 {
        if self.uses_reordering {
            STATUS_STREAM_OFFSET | STATUS_TEMPORAL_DIFF
        } else {
            STATUS_STREAM_OFFSET
        }
    }

    fn check_stream(&self, stream: usize) -> Result<()> {
        if stream < self.element_sizes.len() {
            Ok(())
        } else {
            Err(IndexError::InvalidState(format!(
                "unknown stream {}",
                stream
            )))
        }
    }

    fn total_element_size(&self) -> u64 {
        self.element_sizes.iter().map(|&s| s as u64).sum()
    }

    fn stream_prefix(&self, stream: usize) -> u64 {
        self.element_sizes[..stream].iter().map(|&s| s as u64).sum()
    }

    /// Get the record for `edit_unit`, creating it (and draining any
    /// parked temporal values into it) on first reference
    fn record_mut(&mut self, edit_unit: i64) -> &mut IndexData {
        let stream_count = self.element_sizes.len();
        match self.managed.entry(edit_unit) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let mut data = IndexData::new(stream_count);
                if let Some(offset) = self.unsatisfied_temporal_offsets.remove(&edit_unit) {
                    data.temporal_offset = offset;
                    data.status |= STATUS_TEMPORAL_OFFSET;
                }
                if let Some(diff) = self.unsatisfied_temporal_diffs.remove(&edit_unit) {
                    data.temporal_diff = diff;
                    data.status |= STATUS_TEMPORAL_DIFF;
                }
                self.format_fixed = true;
                slot.insert(data)
            }
        }
    }

    fn stage_provisional(
        &mut self,
        stream: usize,
        edit_unit: i64,
        offset: Option<u64>,
        key_offset: i8,
        flags: Option<u8>,
    ) -> Result<()> {
        self.check_stream(stream)?;

        let mut data = IndexData::new(self.element_sizes.len());
        if stream == self.master_stream {
            data.key_offset = key_offset;
            if let Some(f) = flags {
                data.flags = f;
            }
        }
        if let Some(offset) = offset {
            data.stream_offset[stream] = offset;
            data.status |= STATUS_STREAM_OFFSET;
        }

        log::debug!("staged provisional entry for edit unit {}", edit_unit);
        self.provisional = Some((edit_unit, data));
        Ok(())
    }

    fn log(&mut self, edit_unit: i64) {
        if let Some(id) = self.log_next_entry.take() {
            self.entry_log.insert(id, edit_unit);
        }
    }
}

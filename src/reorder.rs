//! Staging buffer for temporally reordered index entries
//!
//! When essence is written with B-frame reordering, temporal offsets
//! for an entry become known before or after the entry itself is
//! complete. The reorder buffer accepts both in any order and commits
//! finished entries to the owning table in batches.

use crate::delta::BASE_ENTRY_SIZE;
use crate::error::{IndexError, Result};
use crate::table::IndexTable;

/// Holds packed index entries that may still be waiting for details
///
/// Two counters track progress: `complete_entry_count` covers entries
/// with full details, `entry_count` covers every touched entry. An
/// entry past the complete count may hold nothing but a temporal offset
/// awaiting completion, so `complete_entry_count <= entry_count` always.
#[derive(Debug, Clone)]
pub struct ReorderIndex {
    /// Packed entries, laid out exactly as in a segment
    entries: Vec<u8>,
    complete_entry_count: u32,
    entry_count: u32,
    /// Edit unit of entry 0, fixed by the first write
    first_position: Option<i64>,
    entry_size: usize,
}

impl ReorderIndex {
    /// Create an empty buffer for entries of `entry_size` bytes
    pub fn new(entry_size: usize) -> Self {
        debug_assert!(entry_size >= BASE_ENTRY_SIZE);
        ReorderIndex {
            entries: Vec::new(),
            complete_entry_count: 0,
            entry_count: 0,
            first_position: None,
            entry_size,
        }
    }

    /// Number of entries with full details
    pub fn complete_entry_count(&self) -> u32 {
        self.complete_entry_count
    }

    /// Index of the highest touched entry plus one
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Edit unit of the first buffered entry
    pub fn first_position(&self) -> Option<i64> {
        self.first_position
    }

    /// Write the flags and anchor (key-frame) offset of the entry for
    /// `position`, plus an optional pre-packed slice/pos-table tail
    ///
    /// The first write fixes the buffer's base position; earlier
    /// positions are rejected. Counts this entry as complete.
    pub fn set_entry(
        &mut self,
        position: i64,
        flags: u8,
        anchor_offset: i8,
        tables: Option<&[u8]>,
    ) -> Result<()> {
        let index = self.index_for(position)?;
        let base = index * self.entry_size;

        self.entries[base + 1] = anchor_offset as u8;
        self.entries[base + 2] = flags;

        if let Some(tail) = tables {
            let expected = self.entry_size - BASE_ENTRY_SIZE;
            if tail.len() != expected {
                return Err(IndexError::ArityMismatch {
                    field: "slice and pos tables",
                    expected,
                    actual: tail.len(),
                });
            }
            self.entries[base + BASE_ENTRY_SIZE..base + self.entry_size].copy_from_slice(tail);
        }

        let touched = index as u32 + 1;
        self.complete_entry_count = self.complete_entry_count.max(touched);
        self.entry_count = self.entry_count.max(touched);
        Ok(())
    }

    /// Write the stream offset of an already-set entry
    pub fn set_stream_offset(&mut self, position: i64, stream_offset: u64) -> Result<()> {
        let first = self
            .first_position
            .ok_or_else(|| IndexError::InvalidState("reorder buffer is empty".into()))?;
        if position < first {
            return Err(IndexError::OutOfRange {
                edit_unit: position,
            });
        }

        let index = (position - first) as usize;
        if index >= self.entry_count as usize {
            return Err(IndexError::InvalidState(format!(
                "entry for edit unit {} has not been set",
                position
            )));
        }

        let base = index * self.entry_size;
        self.entries[base + 3..base + 11].copy_from_slice(&stream_offset.to_be_bytes());
        Ok(())
    }

    /// Write the temporal offset of the entry for `position`
    ///
    /// The entry need not exist yet; it is counted as touched but not
    /// complete.
    pub fn set_temporal_offset(&mut self, position: i64, temporal_offset: i8) -> Result<()> {
        let index = self.index_for(position)?;
        self.entries[index * self.entry_size] = temporal_offset as u8;
        self.entry_count = self.entry_count.max(index as u32 + 1);
        Ok(())
    }

    /// Commit complete entries to `table` and drop them from the buffer
    ///
    /// `count` caps the number committed; `None` commits every complete
    /// entry. Entries still waiting for details shift down and the base
    /// position advances. Returns the number committed.
    pub fn commit_entries(&mut self, table: &mut IndexTable, count: Option<u32>) -> Result<u32> {
        let first = match self.first_position {
            Some(f) => f,
            None => return Ok(0),
        };

        let n = count
            .unwrap_or(self.complete_entry_count)
            .min(self.complete_entry_count);
        if n == 0 {
            return Ok(0);
        }

        let bytes = n as usize * self.entry_size;
        table.add_raw_entries(first, n, self.entry_size, &self.entries[..bytes])?;

        self.entries.copy_within(bytes.., 0);
        self.entries.truncate(self.entries.len() - bytes);
        self.entry_count -= n;
        self.complete_entry_count -= n;
        self.first_position = Some(first + n as i64);
        Ok(n)
    }

    /// Locate (growing as needed) the entry index for `position`
    fn index_for(&mut self, position: i64) -> Result<usize> {
        let first = *self.first_position.get_or_insert(position);
        if position < first {
            return Err(IndexError::OutOfRange {
                edit_unit: position,
            });
        }

        let index = (position - first) as usize;
        let needed = (index + 1) * self.entry_size;
        if self.entries.len() < needed {
            self.entries.resize(needed, 0);
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_touched_vs_complete() {
        let mut reorder = ReorderIndex::new(11);

        // Only entry 0 is complete, but entries 0 and 2 both carry a
        // temporal offset
        reorder.set_entry(100, 0x80, 0, None).unwrap();
        reorder.set_temporal_offset(100, 1).unwrap();
        reorder.set_temporal_offset(102, -1).unwrap();

        assert_eq!(reorder.complete_entry_count(), 1);
        assert_eq!(reorder.entry_count(), 3);
        assert_eq!(reorder.first_position(), Some(100));
    }

    #[test]
    fn test_positions_before_base_rejected() {
        let mut reorder = ReorderIndex::new(11);
        reorder.set_entry(10, 0, 0, None).unwrap();

        assert!(matches!(
            reorder.set_entry(9, 0, 0, None),
            Err(IndexError::OutOfRange { edit_unit: 9 })
        ));
        assert!(matches!(
            reorder.set_stream_offset(9, 0),
            Err(IndexError::OutOfRange { edit_unit: 9 })
        ));
    }

    #[test]
    fn test_stream_offset_requires_touched_entry() {
        let mut reorder = ReorderIndex::new(11);
        assert!(reorder.set_stream_offset(0, 1).is_err());

        reorder.set_entry(0, 0, 0, None).unwrap();
        reorder.set_stream_offset(0, 1).unwrap();
        assert!(reorder.set_stream_offset(1, 2).is_err());
    }

    #[test]
    fn test_tables_tail_arity_checked() {
        let mut reorder = ReorderIndex::new(15);
        let err = reorder.set_entry(0, 0, 0, Some(&[0; 3])).unwrap_err();
        assert!(matches!(err, IndexError::ArityMismatch { .. }));

        reorder.set_entry(0, 0, 0, Some(&[0, 0, 0, 99])).unwrap();
    }

    #[test]
    fn test_commit_entries_into_table() {
        let mut table = IndexTable::new();
        let mut reorder = ReorderIndex::new(11);

        for (i, offset) in [0u64, 500, 1500].iter().enumerate() {
            reorder.set_entry(i as i64, 0, 0, None).unwrap();
            reorder.set_stream_offset(i as i64, *offset).unwrap();
        }
        reorder.set_temporal_offset(0, 2).unwrap();
        // Entry 3 only has its temporal offset so far
        reorder.set_temporal_offset(3, -1).unwrap();

        let committed = reorder.commit_entries(&mut table, None).unwrap();
        assert_eq!(committed, 3);
        assert_eq!(reorder.entry_count(), 1);
        assert_eq!(reorder.complete_entry_count(), 0);
        assert_eq!(reorder.first_position(), Some(3));

        assert_eq!(table.lookup(1, 0, true).location, 500);
        let reordered = table.lookup(0, 0, true);
        assert_eq!(reordered.location, 1500);
        assert_eq!(reordered.temporal_offset, 2);

        // Completing the shifted entry lets a later commit pick it up
        reorder.set_entry(3, 0, 0, None).unwrap();
        reorder.set_stream_offset(3, 2500).unwrap();
        assert_eq!(reorder.commit_entries(&mut table, None).unwrap(), 1);
        assert_eq!(table.lookup(3, 0, false).location, 2500);
    }

    #[test]
    fn test_commit_count_cap() {
        let mut table = IndexTable::new();
        let mut reorder = ReorderIndex::new(11);
        for i in 0..4 {
            reorder.set_entry(i, 0, 0, None).unwrap();
            reorder.set_stream_offset(i, i as u64 * 100).unwrap();
        }

        assert_eq!(reorder.commit_entries(&mut table, Some(2)).unwrap(), 2);
        assert_eq!(reorder.complete_entry_count(), 2);
        assert_eq!(reorder.first_position(), Some(2));
        assert_eq!(table.lookup(1, 0, true).location, 100);
        assert!(!table.lookup(2, 0, true).exact);
    }
}

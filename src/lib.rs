//! MXF Index Tables
//!
//! This crate implements the SMPTE-377M index table subsystem used to
//! map edit unit numbers (logical sample positions) to byte offsets in
//! an MXF essence container.
//!
//! # Features
//!
//! - Constant and variable bit-rate index tables
//! - Multi-slice entries and sub-stream deltas
//! - B-frame temporal reordering and key-frame back-pointers
//! - Bit-exact IndexTableSegment encoding and decoding
//! - Staged index building for writers that learn entry details out of
//!   order ([`IndexManager`])
//!
//! # Example
//!
//! ```
//! use mxf_index::IndexTable;
//!
//! let mut table = IndexTable::new();
//! table.add_index_entry(0, 0, 0, 0x40, 0, &[], &[]).unwrap();
//! table.add_index_entry(1, 0, 0, 0x00, 1000, &[], &[]).unwrap();
//!
//! let pos = table.lookup(1, 0, true);
//! assert!(pos.exact);
//! assert_eq!(pos.location, 1000);
//! ```
//!
//! The KLV parser, metadata object model and file I/O live outside this
//! crate; decoding works on pre-sliced IndexTableSegment payloads and
//! encoding produces ready-to-write KLV bytes.

mod delta;
mod error;
mod manager;
mod reorder;
mod segment;
mod table;
mod types;
pub mod wire;

pub use delta::{DeltaArray, DeltaEntry, BASE_ENTRY_SIZE, DELTA_ENTRY_SIZE};
pub use error::{IndexError, Result};
pub use manager::IndexManager;
pub use reorder::ReorderIndex;
pub use segment::{EntryView, IndexSegment, SegmentInfo};
pub use table::{IndexPos, IndexTable};
pub use types::{EditRate, Rational};

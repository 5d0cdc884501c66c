#![no_main]

//! Fuzz target for index segment decoding.
//!
//! Feeds arbitrary bytes to the IndexTableSegment payload parser and to
//! the multi-segment blob path; both must reject garbage cleanly.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mxf_index::{IndexSegment, IndexTable};

#[derive(Arbitrary, Debug)]
struct SegmentInput {
    data: Vec<u8>,
    len_size: u8,
}

fuzz_target!(|input: SegmentInput| {
    // Limit input size
    if input.data.len() > 1024 * 1024 {
        return;
    }

    let len_size = match input.len_size % 4 {
        0 => 0,
        1 => 1,
        2 => 2,
        _ => 4,
    };

    if let Ok((segment, _)) = IndexSegment::decode_from(&input.data, len_size) {
        // Anything that decodes must uphold the packed-buffer invariant
        assert_eq!(
            segment.raw_entries().len(),
            segment.entry_count() as usize * segment.entry_size()
        );
    }

    let mut table = IndexTable::new();
    let _ = table.add_segments(&input.data);
});

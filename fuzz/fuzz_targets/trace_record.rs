#![no_main]

use libfuzzer_sys::fuzz_target;
use reasm_capture::SegmentRecord;
use reasm_stream::SourceId;

fuzz_target!(|data: &[u8]| {
    // Arbitrary trace lines must decode or fail cleanly, never panic.
    if let Ok(record) = serde_json::from_slice::<SegmentRecord>(data) {
        if let Ok(segment) = record.into_segment(SourceId(0)) {
            let _ = segment.validate();
        }
    }
});

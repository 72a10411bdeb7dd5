#![no_main]

//! Fuzz target for textual inputs: versions, build numbers and compact debug records
//!
//! Run with: cargo +nightly fuzz run fuzz_text

use libfuzzer_sys::fuzz_target;
use vouch_core::{BuildNumber, DebugRecord, SemVer};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(build) = text.parse::<BuildNumber>() {
        assert_eq!(build.to_string(), text);
    }
    let _ = text.parse::<SemVer>();
    let _ = DebugRecord::from_compact(text);
});

#![no_main]

//! Fuzz target for the Android KeyDescription parser
//!
//! Run with: cargo +nightly fuzz run fuzz_key_description

use libfuzzer_sys::fuzz_target;
use vouch_core::android::record::parse_key_description;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = parse_key_description(data) {
        let _ = record.application_id();
    }
});

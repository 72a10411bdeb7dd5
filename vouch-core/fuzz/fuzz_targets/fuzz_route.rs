#![no_main]

//! Fuzz target for proof routing
//!
//! The input is split into proof elements on 0xff bytes. For non-empty proofs,
//! routing and the no-op verifier must agree on the platform.
//!
//! Run with: cargo +nightly fuzz run fuzz_route

use libfuzzer_sys::fuzz_target;
use vouch_core::{route, AttestationService, NoopVerifier, ProofShape};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        assert_eq!(route(&[]), ProofShape::Empty);
        return;
    }
    let proof: Vec<Vec<u8>> = data.split(|b| *b == 0xff).map(<[u8]>::to_vec).collect();
    let result = NoopVerifier.verify_attestation(&proof, b"challenge", None);
    assert_eq!(Some(route(&proof).platform()), result.platform());
});

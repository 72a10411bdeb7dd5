#![no_main]

//! Fuzz target for StatementEnvelope::parse()
//!
//! Arbitrary bytes go through the CBOR envelope decoder and, when that succeeds,
//! through key id derivation, the authenticator data, receipt payload and OS version
//! extension parsers.
//!
//! Run with: cargo +nightly fuzz run fuzz_statement

use libfuzzer_sys::fuzz_target;
use vouch_core::ios::{parse_os_versions, AuthenticatorData, ReceiptPayload, StatementEnvelope};

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = StatementEnvelope::parse(data) {
        let _ = envelope.key_id();
        let _ = AuthenticatorData::parse(&envelope.authenticator_data);
        let _ = ReceiptPayload::parse(&envelope.receipt);
        if let Ok(certificate) = openssl::x509::X509::from_der(envelope.leaf()) {
            let _ = parse_os_versions(&certificate);
        }
    }
});

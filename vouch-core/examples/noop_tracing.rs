//! Example demonstrating verification tracing with the no-op verifier and the
//! iOS version policy.
//!
//! Run with: cargo run -p vouch-core --example noop_tracing

use std::cmp::Ordering;

use tracing_subscriber::{fmt, EnvFilter};
use vouch_core::{AttestationService, NoopVerifier, OsVersions, ParsedVersions};

fn main() {
    fmt()
        .with_env_filter(EnvFilter::new("vouch_core=debug,info"))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    println!("=== Routing ===\n");

    let proofs: [(&str, Vec<Vec<u8>>); 3] = [
        ("empty", Vec::new()),
        ("statement", vec![b"statement".to_vec()]),
        ("chain", vec![vec![1], vec![2], vec![3]]),
    ];
    for (name, proof) in &proofs {
        let result = NoopVerifier.verify_attestation(proof, b"challenge", None);
        println!("{name:>10}: {result}");
    }

    println!("\n=== iOS version policy ===\n");

    let minimum = match OsVersions::parse("17.0", "21A329") {
        Ok(minimum) => minimum,
        Err(e) => {
            eprintln!("Invalid minimum: {e}");
            return;
        }
    };
    for build in ["20H19", "21A329", "21C66"] {
        let attested = ParsedVersions {
            sem_ver: None,
            build_number: build.parse().ok(),
        };
        let verdict = match minimum.compare_to(&attested) {
            Ok(Ordering::Greater) => "rejected".to_string(),
            Ok(_) => "accepted".to_string(),
            Err(e) => format!("rejected ({e})"),
        };
        println!("{build:>10}: {verdict}");
    }
}

//! Vouch Core - mobile attestation verification
//!
//! This crate decides whether a mobile client is a genuine, unmodified app on a genuine
//! device, based on platform attestation proofs:
//!
//! - Android Key Attestation certificate chains, checked under up to three strategies
//!   (hardware, nougat-hybrid, software) with OR semantics
//! - Apple App Attest statements, optionally followed by an assertion over client data
//! - Key attestation: binding a verified proof to one specific public key
//! - A closed error taxonomy (content, certificate time, certificate trust, configuration)
//! - Debug records that replay a verification call against a frozen clock
//!
//! # Example
//!
//! ```
//! use vouch_core::{AttestationResult, AttestationService, NoopVerifier};
//!
//! // The no-op verifier accepts anything; production code uses `AttestationVerifier`.
//! let chain = vec![vec![0u8; 4], vec![1u8; 4], vec![2u8; 4]];
//! let result = NoopVerifier.verify_attestation(&chain, b"challenge", None);
//! assert!(matches!(result, AttestationResult::AndroidNoop { .. }));
//! ```

pub mod android;
pub mod clock;
pub mod dispatcher;
mod encoding;
pub mod error;
pub mod ios;
pub mod key;
pub mod observer;
pub mod replay;
pub mod result;
pub mod taxonomy;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types for convenience
pub use android::{AndroidAppData, AndroidAttestationConfiguration, AndroidStrategy, PatchLevel};
pub use clock::{Clock, FixedClock, OffsetClock, SystemClock};
pub use dispatcher::{
    route, AttestationService, AttestationVerifier, AttestationVerifierBuilder, NoopVerifier,
    ProofShape,
};
pub use error::{
    AndroidReason, AttestationError, Cause, ContentReason, ErrorKind, IosReason, Platform, Result,
};
pub use ios::{AppleValidatorFactory, IosAppData, IosAttestationConfiguration};
pub use key::{decode_public_key, KeyBindingResolver, KeyEncoding};
pub use observer::{TracingObserver, VerificationEvent, VerificationObserver};
pub use replay::{Collaborators, DebugRecord, ReplayMethod, ReplayOutcome};
pub use result::{AssertedClientData, AttestationResult, KeyAttestation};
pub use version::{BuildNumber, OsVersions, ParsedVersions, SemVer};

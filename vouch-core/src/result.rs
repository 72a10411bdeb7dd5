//! Verification outcomes.

use std::fmt;

use openssl::x509::{X509Ref, X509};

use crate::android::AttestationRecord;
use crate::error::{AttestationError, Platform};
use crate::ios::{Assertion, ValidatedAttestation};
use crate::version::ParsedVersions;

/// Client data together with the assertion that signed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertedClientData {
    pub client_data: Vec<u8>,
    pub assertion: Assertion,
}

/// Outcome of one verification call. Exactly one variant applies.
#[derive(Debug, Clone)]
pub enum AttestationResult {
    /// Android chain accepted by at least one strategy.
    AndroidVerified {
        /// The validated chain, leaf first.
        certificate_chain: Vec<X509>,
        record: AttestationRecord,
    },
    /// Android-shaped proof accepted without checks by a no-op verifier.
    AndroidNoop { certificate_chain: Vec<Vec<u8>> },
    /// Apple statement accepted.
    IosVerified {
        attestation: ValidatedAttestation,
        parsed_version: ParsedVersions,
        asserted_client_data: Option<AssertedClientData>,
    },
    /// Apple-shaped proof accepted without checks by a no-op verifier.
    IosNoop { client_data: Option<Vec<u8>> },
    Error {
        explanation: String,
        cause: Option<AttestationError>,
    },
}

impl AttestationResult {
    pub fn error(explanation: impl Into<String>, cause: Option<AttestationError>) -> Self {
        Self::Error {
            explanation: explanation.into(),
            cause,
        }
    }

    pub(crate) fn failed(cause: AttestationError) -> Self {
        Self::Error {
            explanation: cause.to_string(),
            cause: Some(cause),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Platform of a positive result; `None` for errors.
    pub fn platform(&self) -> Option<Platform> {
        match self {
            Self::AndroidVerified { .. } | Self::AndroidNoop { .. } => Some(Platform::Android),
            Self::IosVerified { .. } | Self::IosNoop { .. } => Some(Platform::Ios),
            Self::Error { .. } => None,
        }
    }

    pub fn error_cause(&self) -> Option<&AttestationError> {
        match self {
            Self::Error { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    /// The Android leaf certificate of a verified chain.
    pub fn android_leaf(&self) -> Option<&X509Ref> {
        match self {
            Self::AndroidVerified {
                certificate_chain, ..
            } => certificate_chain.first().map(|cert| &**cert),
            _ => None,
        }
    }
}

fn same_certificate(a: &X509Ref, b: &X509Ref) -> bool {
    matches!((a.to_der(), b.to_der()), (Ok(a), Ok(b)) if a == b)
}

impl PartialEq for AttestationResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::AndroidVerified {
                    certificate_chain: a,
                    record: ra,
                },
                Self::AndroidVerified {
                    certificate_chain: b,
                    record: rb,
                },
            ) => {
                ra == rb
                    && a.len() == b.len()
                    && a.iter().zip(b).all(|(a, b)| same_certificate(a, b))
            }
            (
                Self::AndroidNoop {
                    certificate_chain: a,
                },
                Self::AndroidNoop {
                    certificate_chain: b,
                },
            ) => a == b,
            (
                Self::IosVerified {
                    attestation: a,
                    parsed_version: va,
                    asserted_client_data: ca,
                },
                Self::IosVerified {
                    attestation: b,
                    parsed_version: vb,
                    asserted_client_data: cb,
                },
            ) => a == b && va == vb && ca == cb,
            (Self::IosNoop { client_data: a }, Self::IosNoop { client_data: b }) => a == b,
            (
                Self::Error {
                    explanation: ea,
                    cause: ca,
                },
                Self::Error {
                    explanation: eb,
                    cause: cb,
                },
            ) => ea == eb && ca == cb,
            _ => false,
        }
    }
}

impl fmt::Display for AttestationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AndroidVerified {
                certificate_chain,
                record,
            } => write!(
                f,
                "Android verified (chain of {}, keymaster {})",
                certificate_chain.len(),
                record.keymaster_security_level
            ),
            Self::AndroidNoop { certificate_chain } => {
                write!(f, "Android no-op (chain of {})", certificate_chain.len())
            }
            Self::IosVerified {
                attestation,
                asserted_client_data,
                ..
            } => write!(
                f,
                "iOS verified ({}{})",
                attestation.receipt.app_id,
                if asserted_client_data.is_some() {
                    ", with assertion"
                } else {
                    ""
                }
            ),
            Self::IosNoop { .. } => write!(f, "iOS no-op"),
            Self::Error { explanation, .. } => write!(f, "Error: {explanation}"),
        }
    }
}

/// Outcome of a key attestation: a public key is present exactly when verification succeeded.
#[derive(Debug, Clone)]
pub struct KeyAttestation<K> {
    attested_public_key: Option<K>,
    details: AttestationResult,
}

impl<K> KeyAttestation<K> {
    pub(crate) fn success(key: K, details: AttestationResult) -> Self {
        debug_assert!(!details.is_error());
        Self {
            attested_public_key: Some(key),
            details,
        }
    }

    pub(crate) fn failure(details: AttestationResult) -> Self {
        Self {
            attested_public_key: None,
            details,
        }
    }

    pub fn is_success(&self) -> bool {
        self.attested_public_key.is_some()
    }

    pub fn attested_public_key(&self) -> Option<&K> {
        self.attested_public_key.as_ref()
    }

    pub fn details(&self) -> &AttestationResult {
        &self.details
    }

    pub fn into_parts(self) -> (Option<K>, AttestationResult) {
        (self.attested_public_key, self.details)
    }

    /// Consume into one value, dispatching on success.
    pub fn fold<R>(
        self,
        on_error: impl FnOnce(AttestationResult) -> R,
        on_success: impl FnOnce(K, AttestationResult) -> R,
    ) -> R {
        match self.attested_public_key {
            Some(key) => on_success(key, self.details),
            None => on_error(self.details),
        }
    }
}

impl<K> fmt::Display for KeyAttestation<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            write!(f, "Key attested: {}", self.details)
        } else {
            write!(f, "Key not attested: {}", self.details)
        }
    }
}

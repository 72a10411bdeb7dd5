//! Seams to an App Attest validator.
//!
//! Statement and assertion validation (receipt signature checks, authenticator data parsing,
//! Apple root trust) is delegated to an [`AppAttestValidator`]. One validator is created per
//! configured app; the coordinator tries them all. [`AppleValidatorFactory`] is the built-in
//! implementation.
//!
//! [`AppleValidatorFactory`]: super::native::AppleValidatorFactory

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use openssl::error::ErrorStack;
use openssl::pkey::{PKeyRef, Public};
use openssl::x509::X509;
use thiserror::Error;

use super::IosAppData;
use crate::clock::Clock;
use crate::error::AttestationError;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Attestation receipt as decoded by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// `<team id>.<bundle id>` the receipt was issued for.
    pub app_id: String,
    pub creation_time: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub risk_metric: Option<u32>,
}

impl Receipt {
    /// The instant the statement counts as created: `not_before` when present.
    pub fn effective_creation_time(&self) -> DateTime<Utc> {
        self.not_before.unwrap_or(self.creation_time)
    }
}

/// A statement accepted by a validator.
#[derive(Debug, Clone)]
pub struct ValidatedAttestation {
    /// Leaf credential certificate holding the attested key.
    pub certificate: X509,
    pub receipt: Receipt,
    pub authenticator_data: Vec<u8>,
}

impl PartialEq for ValidatedAttestation {
    fn eq(&self, other: &Self) -> bool {
        self.receipt == other.receipt
            && self.authenticator_data == other.authenticator_data
            && matches!(
                (self.certificate.to_der(), other.certificate.to_der()),
                (Ok(a), Ok(b)) if a == b
            )
    }
}

/// An assertion accepted by a validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub sign_count: u32,
    pub authenticator_data: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertPathReason {
    NotYetValid,
    Expired,
    InvalidSignature,
    UntrustedRoot,
    Other,
}

/// PKIX path validation failure, found in the source chain of
/// [`AppAttestError::InvalidCertificateChain`].
#[derive(Debug, Error)]
#[error("certificate path validation failed ({reason:?}): {message}")]
pub struct CertPathError {
    pub reason: CertPathReason,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiptPayloadIssue {
    /// Receipt created after the latest acceptable instant.
    CreationTimeAfter,
    /// Receipt older than the maximum receipt age.
    TooOld,
    AppIdMismatch,
    Other,
}

/// Receipt failure, found in the source chain of [`AppAttestError::InvalidReceipt`].
#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("receipt payload invalid ({issue:?}): {message}")]
    InvalidPayload {
        issue: ReceiptPayloadIssue,
        message: String,
    },

    #[error("receipt signature invalid: {0}")]
    InvalidSignature(String),

    #[error("malformed receipt: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticatorDataIssue {
    /// RP id hash is not the hash of the configured app id.
    AppIdMismatch,
    /// AAGUID does not match the configured environment.
    AaguidMismatch,
    Other,
}

/// Errors reported by an [`AppAttestValidator`].
#[derive(Debug, Error)]
pub enum AppAttestError {
    #[error("invalid authenticator data ({issue:?}): {message}")]
    InvalidAuthenticatorData {
        issue: AuthenticatorDataIssue,
        message: String,
    },

    #[error("invalid certificate chain: {message}")]
    InvalidCertificateChain {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("invalid attestation format: {0}")]
    InvalidFormat(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("nonce mismatch: {0}")]
    InvalidNonce(String),

    #[error("invalid receipt: {message}")]
    InvalidReceipt {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("assertion rejected: {0}")]
    InvalidAssertion(String),

    #[error(transparent)]
    Other(BoxError),
}

impl AppAttestError {
    pub fn chain(message: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::InvalidCertificateChain {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn receipt(message: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::InvalidReceipt {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<ErrorStack> for AppAttestError {
    fn from(error: ErrorStack) -> Self {
        Self::Other(Box::new(error))
    }
}

/// Validates App Attest statements and assertions for one app.
pub trait AppAttestValidator: Send + Sync + fmt::Debug {
    fn app(&self) -> &IosAppData;

    /// Validate an attestation statement for the key identified by `key_id`.
    fn validate_attestation(
        &self,
        statement: &[u8],
        key_id: &str,
        challenge: &[u8],
    ) -> Result<ValidatedAttestation, AppAttestError>;

    /// Validate an assertion over `client_data` made with the attested key.
    fn validate_assertion(
        &self,
        assertion: &[u8],
        client_data: &[u8],
        attested_key: &PKeyRef<Public>,
        last_counter: u32,
        challenge: &[u8],
    ) -> Result<Assertion, AppAttestError>;
}

/// What a validator is created with.
#[derive(Debug, Clone)]
pub struct ValidatorContext {
    /// Clock already shifted by the verification offset.
    pub clock: Arc<dyn Clock>,
    /// Oldest acceptable receipt, widened to tolerate the configured offset.
    pub receipt_max_age: Duration,
}

pub trait AppAttestValidatorFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        app: &IosAppData,
        context: &ValidatorContext,
    ) -> Result<Box<dyn AppAttestValidator>, AttestationError>;
}

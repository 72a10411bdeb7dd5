//! Debug records: capture a verification call and replay it later, bit for bit.
//!
//! A [`DebugRecord`] holds both configurations, the call inputs and the instant the call ran
//! at. Replaying builds a verifier on a clock frozen at that instant. The App Attest validator
//! library and the Android checkers are not serialisable, so the caller hands them back in as
//! [`Collaborators`].

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use openssl::pkey::{PKey, Public};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::android::{AndroidAttestationConfiguration, AndroidCheckerFactory, StandardCheckerFactory};
use crate::clock::FixedClock;
use crate::dispatcher::{AttestationService, AttestationVerifier};
use crate::encoding::{base64url, base64url_list, base64url_option};
use crate::error::AttestationError;
use crate::ios::{AppAttestValidatorFactory, AppleValidatorFactory, IosAttestationConfiguration};
use crate::observer::{TracingObserver, VerificationObserver};
use crate::result::{AttestationResult, KeyAttestation};

/// Multibase prefix of unpadded base64url.
const COMPACT_PREFIX: char = 'u';

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("debug record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("compact debug record must start with `u`")]
    UnknownMultibase,

    #[error("compact debug record is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("key attestation record carries no key")]
    MissingKey,

    #[error("recorded configuration is unusable: {0}")]
    Configuration(#[from] AttestationError),
}

/// Which entry point was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayMethod {
    /// [`AttestationService::verify_attestation`].
    Generic,
    /// [`AttestationService::verify_key_attestation_encoded`]; the key travels as client data.
    KeyAttestation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugRecord {
    pub method: ReplayMethod,
    pub android_configuration: AndroidAttestationConfiguration,
    pub ios_configuration: IosAttestationConfiguration,
    #[serde(with = "base64url_list")]
    pub proof: Vec<Vec<u8>>,
    #[serde(with = "base64url")]
    pub challenge: Vec<u8>,
    #[serde(default, with = "base64url_option", skip_serializing_if = "Option::is_none")]
    pub client_data: Option<Vec<u8>>,
    /// Unshifted instant of the recorded call.
    pub verification_time: DateTime<Utc>,
    #[serde(default)]
    pub verification_offset_ms: i64,
}

/// Services a replayed verifier needs but a record cannot carry.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub android_checkers: Arc<dyn AndroidCheckerFactory>,
    pub app_attest_validators: Arc<dyn AppAttestValidatorFactory>,
    pub observer: Arc<dyn VerificationObserver>,
}

impl Collaborators {
    /// Standard Android checkers and tracing, with the given App Attest validators.
    pub fn new(app_attest_validators: Arc<dyn AppAttestValidatorFactory>) -> Self {
        Self {
            android_checkers: Arc::new(StandardCheckerFactory::default()),
            app_attest_validators,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Everything standard, App Attest statements checked against Apple's roots.
    pub fn standard() -> Result<Self, AttestationError> {
        Ok(Self::new(Arc::new(AppleValidatorFactory::new()?)))
    }

    pub fn with_android_checkers(mut self, factory: Arc<dyn AndroidCheckerFactory>) -> Self {
        self.android_checkers = factory;
        self
    }
}

/// What a replayed call returned.
#[derive(Debug, Clone)]
pub enum ReplayOutcome {
    Attestation(AttestationResult),
    KeyAttestation(KeyAttestation<PKey<Public>>),
}

impl ReplayOutcome {
    /// The detailed result, whichever entry point ran.
    pub fn result(&self) -> &AttestationResult {
        match self {
            Self::Attestation(result) => result,
            Self::KeyAttestation(attestation) => attestation.details(),
        }
    }
}

impl DebugRecord {
    pub fn verification_offset(&self) -> Duration {
        Duration::milliseconds(self.verification_offset_ms)
    }

    pub fn to_json(&self) -> Result<String, ReplayError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ReplayError> {
        Ok(serde_json::from_str(json)?)
    }

    /// JSON, base64url encoded and multibase prefixed, for pasting into logs and tickets.
    pub fn to_compact(&self) -> Result<String, ReplayError> {
        let json = self.to_json()?;
        Ok(format!("{COMPACT_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
    }

    pub fn from_compact(compact: &str) -> Result<Self, ReplayError> {
        let encoded = compact
            .strip_prefix(COMPACT_PREFIX)
            .ok_or(ReplayError::UnknownMultibase)?;
        let json = URL_SAFE_NO_PAD.decode(encoded)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// A verifier configured as the recorded one, frozen at the recorded instant.
    pub fn create_verifier(
        &self,
        collaborators: &Collaborators,
    ) -> Result<AttestationVerifier, ReplayError> {
        Ok(AttestationVerifier::builder(
            self.android_configuration.clone(),
            self.ios_configuration.clone(),
        )
        .with_clock(Arc::new(FixedClock::new(self.verification_time)))
        .with_verification_offset(self.verification_offset())
        .with_android_checkers(Arc::clone(&collaborators.android_checkers))
        .with_app_attest_validators(Arc::clone(&collaborators.app_attest_validators))
        .with_observer(Arc::clone(&collaborators.observer))
        .build()?)
    }

    /// Run the recorded call again.
    #[instrument(level = "debug", skip_all, fields(method = ?self.method, at = %self.verification_time))]
    pub fn replay(&self, collaborators: &Collaborators) -> Result<ReplayOutcome, ReplayError> {
        let verifier = self.create_verifier(collaborators)?;
        let outcome = match self.method {
            ReplayMethod::Generic => ReplayOutcome::Attestation(verifier.verify_attestation(
                &self.proof,
                &self.challenge,
                self.client_data.as_deref(),
            )),
            ReplayMethod::KeyAttestation => {
                let key = self.client_data.as_deref().ok_or(ReplayError::MissingKey)?;
                ReplayOutcome::KeyAttestation(verifier.verify_key_attestation_encoded(
                    &self.proof,
                    &self.challenge,
                    key,
                ))
            }
        };
        debug!(success = !outcome.result().is_error(), "Replayed recorded call");
        Ok(outcome)
    }
}

//! Entry point: routes a proof to the Android or Apple coordinator.
//!
//! Routing is purely by shape. More than two blobs is an Android certificate chain; one or two
//! blobs is an App Attest statement, optionally followed by an assertion.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use openssl::pkey::{PKey, PKeyRef, Public};
use openssl::x509::X509;
use tracing::{debug, instrument};

use crate::android::coordinator::AndroidCoordinator;
use crate::android::{
    AndroidAttestationConfiguration, AndroidCheckerFactory, StandardCheckerFactory,
};
use crate::clock::{Clock, OffsetClock, SystemClock};
use crate::error::{AndroidReason, AttestationError, Cause, IosReason, Platform, Result};
use crate::ios::coordinator::{AppleCoordinator, AssertionRequest};
use crate::ios::{AppAttestValidatorFactory, AppleValidatorFactory, IosAttestationConfiguration};
use crate::key::{decode_public_key, KeyBindingResolver};
use crate::observer::{TracingObserver, VerificationEvent, VerificationObserver};
use crate::replay::{DebugRecord, ReplayMethod};
use crate::result::{AttestationResult, KeyAttestation};

/// What a proof looks like, which decides the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProofShape {
    Empty,
    /// One statement, optionally followed by an assertion.
    AppleStatement,
    /// Three or more certificates, leaf first.
    AndroidChain,
}

impl ProofShape {
    pub fn platform(&self) -> Platform {
        match self {
            Self::Empty => Platform::Unknown,
            Self::AppleStatement => Platform::Ios,
            Self::AndroidChain => Platform::Android,
        }
    }
}

/// Classify a proof by the number of blobs it holds.
pub fn route(proof: &[Vec<u8>]) -> ProofShape {
    match proof.len() {
        0 => ProofShape::Empty,
        1 | 2 => ProofShape::AppleStatement,
        _ => ProofShape::AndroidChain,
    }
}

/// Verifies attestation proofs. Implementations never panic on malformed input and report
/// every failure as [`AttestationResult::Error`].
pub trait AttestationService: Send + Sync + fmt::Debug {
    /// Verify `proof` against `challenge`.
    ///
    /// On iOS, `client_data` is the data the assertion in `proof[1]` signs. On Android it is
    /// the DER SubjectPublicKeyInfo the leaf certificate must carry.
    fn verify_attestation(
        &self,
        proof: &[Vec<u8>],
        challenge: &[u8],
        client_data: Option<&[u8]>,
    ) -> AttestationResult;

    /// Verify that `proof` attests exactly `key`.
    fn verify_key_attestation(
        &self,
        proof: &[Vec<u8>],
        challenge: &[u8],
        key: &PKeyRef<Public>,
    ) -> KeyAttestation<PKey<Public>> {
        KeyBindingResolver::new(self).resolve(proof, challenge, key)
    }

    /// Like [`verify_key_attestation`](Self::verify_key_attestation) for a key given as DER or
    /// as an X9.63 point.
    fn verify_key_attestation_encoded(
        &self,
        proof: &[Vec<u8>],
        challenge: &[u8],
        encoded_key: &[u8],
    ) -> KeyAttestation<PKey<Public>> {
        match decode_public_key(encoded_key) {
            Ok(key) => self.verify_key_attestation(proof, challenge, &key),
            Err(e) => KeyAttestation::failure(AttestationResult::failed(
                AttestationError::unknown_content(
                    "key to be attested could not be decoded",
                    Some(Cause::new(e)),
                ),
            )),
        }
    }
}

/// Builder for [`AttestationVerifier`].
#[derive(Debug, Clone)]
pub struct AttestationVerifierBuilder {
    android: AndroidAttestationConfiguration,
    ios: IosAttestationConfiguration,
    clock: Arc<dyn Clock>,
    verification_offset: Duration,
    android_checkers: Arc<dyn AndroidCheckerFactory>,
    app_attest_validators: Option<Arc<dyn AppAttestValidatorFactory>>,
    observer: Arc<dyn VerificationObserver>,
}

impl AttestationVerifierBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shift every time check by `offset` to tolerate client clock drift. Debug records keep
    /// the offset in whole milliseconds, so a finer offset is rejected by [`build`](Self::build).
    pub fn with_verification_offset(mut self, offset: Duration) -> Self {
        self.verification_offset = offset;
        self
    }

    pub fn with_android_checkers(mut self, factory: Arc<dyn AndroidCheckerFactory>) -> Self {
        self.android_checkers = factory;
        self
    }

    pub fn with_app_attest_validators(mut self, factory: Arc<dyn AppAttestValidatorFactory>) -> Self {
        self.app_attest_validators = Some(factory);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn VerificationObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Create every checker and validator up front. Fails only on unusable configuration.
    pub fn build(self) -> Result<AttestationVerifier> {
        let offset = self.verification_offset;
        if offset != Duration::milliseconds(offset.num_milliseconds()) {
            return Err(AttestationError::configuration(
                Platform::Unknown,
                format!("verification offset {offset} is not a whole number of milliseconds"),
            ));
        }
        let app_attest: Arc<dyn AppAttestValidatorFactory> = match self.app_attest_validators {
            Some(factory) => factory,
            None => Arc::new(AppleValidatorFactory::new()?),
        };
        let clock: Arc<dyn Clock> = Arc::new(OffsetClock::new(
            Arc::clone(&self.clock),
            self.verification_offset,
        ));

        let android = AndroidCoordinator::new(
            &self.android,
            self.android_checkers.as_ref(),
            Arc::clone(&self.observer),
        )?;
        let apple = AppleCoordinator::new(
            &self.ios,
            app_attest.as_ref(),
            Arc::clone(&clock),
            self.verification_offset,
            Arc::clone(&self.observer),
        )?;
        debug!(
            android_strategies = self.android.enabled_strategies().len(),
            ios_apps = self.ios.applications().len(),
            offset_secs = self.verification_offset.num_seconds(),
            "Attestation verifier ready"
        );

        Ok(AttestationVerifier {
            android,
            apple,
            clock,
            base_clock: self.clock,
            verification_offset: self.verification_offset,
            android_config: self.android,
            ios_config: self.ios,
            observer: self.observer,
        })
    }
}

/// Verifies Android Key Attestation chains and Apple App Attest statements.
///
/// Build once with [`AttestationVerifier::builder`] and share; verification does not mutate it.
#[derive(Debug)]
pub struct AttestationVerifier {
    android: AndroidCoordinator,
    apple: AppleCoordinator,
    /// `base_clock` shifted by `verification_offset`.
    clock: Arc<dyn Clock>,
    base_clock: Arc<dyn Clock>,
    verification_offset: Duration,
    android_config: AndroidAttestationConfiguration,
    ios_config: IosAttestationConfiguration,
    observer: Arc<dyn VerificationObserver>,
}

impl AttestationVerifier {
    /// Defaults: system clock, no offset, [`StandardCheckerFactory`], [`AppleValidatorFactory`]
    /// trusting Apple's roots and [`TracingObserver`].
    pub fn builder(
        android: AndroidAttestationConfiguration,
        ios: IosAttestationConfiguration,
    ) -> AttestationVerifierBuilder {
        AttestationVerifierBuilder {
            android,
            ios,
            clock: Arc::new(SystemClock),
            verification_offset: Duration::zero(),
            android_checkers: Arc::new(StandardCheckerFactory::default()),
            app_attest_validators: None,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn android_configuration(&self) -> &AndroidAttestationConfiguration {
        &self.android_config
    }

    pub fn ios_configuration(&self) -> &IosAttestationConfiguration {
        &self.ios_config
    }

    pub fn verification_offset(&self) -> Duration {
        self.verification_offset
    }

    /// The offset-adjusted instant verification runs at.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Verify an App Attest statement without an assertion.
    pub fn verify_app_attestation(&self, statement: &[u8], challenge: &[u8]) -> AttestationResult {
        self.finish(Platform::Ios, self.apple.verify(statement, challenge, None))
    }

    /// Verify a statement and an assertion over `client_data`. `last_counter` is the highest
    /// signature counter expected before the assertion was made.
    pub fn verify_assertion(
        &self,
        statement: &[u8],
        assertion: &[u8],
        client_data: &[u8],
        challenge: &[u8],
        last_counter: u32,
    ) -> AttestationResult {
        let request = AssertionRequest {
            assertion,
            client_data,
            last_counter,
        };
        self.finish(
            Platform::Ios,
            self.apple.verify(statement, challenge, Some(request)),
        )
    }

    /// Verify an already parsed Android chain and attest its leaf key.
    pub fn verify_android_chain(
        &self,
        chain: &[X509],
        challenge: &[u8],
    ) -> KeyAttestation<PKey<Public>> {
        let Some(leaf_key) = chain.first().and_then(|leaf| leaf.public_key().ok()) else {
            return KeyAttestation::failure(AttestationResult::failed(
                AttestationError::android_content(
                    AndroidReason::AppUnexpected,
                    "certificate chain has no usable leaf key",
                    None,
                ),
            ));
        };
        let result = self.finish(
            Platform::Android,
            self.android
                .verify_chain(chain.to_vec(), self.clock.now(), challenge, None),
        );
        if result.is_error() {
            KeyAttestation::failure(result)
        } else {
            KeyAttestation::success(leaf_key, result)
        }
    }

    /// Capture the inputs of a [`verify_attestation`](AttestationService::verify_attestation)
    /// call, bound to the current instant, for later replay.
    pub fn debug_record(
        &self,
        method: ReplayMethod,
        proof: &[Vec<u8>],
        challenge: &[u8],
        client_data: Option<&[u8]>,
    ) -> DebugRecord {
        DebugRecord {
            method,
            android_configuration: self.android_config.clone(),
            ios_configuration: self.ios_config.clone(),
            proof: proof.to_vec(),
            challenge: challenge.to_vec(),
            client_data: client_data.map(<[u8]>::to_vec),
            verification_time: self.base_clock.now(),
            verification_offset_ms: self.verification_offset.num_milliseconds(),
        }
    }

    fn finish(&self, platform: Platform, result: AttestationResult) -> AttestationResult {
        match &result {
            AttestationResult::Error { explanation, cause } => {
                self.observer.observe(&VerificationEvent::Rejected {
                    platform,
                    explanation,
                    error: cause.as_ref(),
                })
            }
            _ => self
                .observer
                .observe(&VerificationEvent::Verified { platform }),
        }
        result
    }
}

impl AttestationService for AttestationVerifier {
    #[instrument(level = "debug", skip_all, fields(proof_len = proof.len(), with_client_data = client_data.is_some()))]
    fn verify_attestation(
        &self,
        proof: &[Vec<u8>],
        challenge: &[u8],
        client_data: Option<&[u8]>,
    ) -> AttestationResult {
        let shape = route(proof);
        self.observer.observe(&VerificationEvent::Routed {
            shape,
            proof_len: proof.len(),
        });

        let result = match (shape, proof) {
            (ProofShape::AndroidChain, _) => {
                self.android
                    .verify(proof, self.clock.now(), challenge, client_data)
            }
            (ProofShape::AppleStatement, [statement]) => match client_data {
                Some(_) => AttestationResult::failed(AttestationError::ios_content(
                    IosReason::AppUnexpected,
                    "invalid proof length; did you pass clientData without an assertion?",
                    None,
                )),
                None => self.apple.verify(statement, challenge, None),
            },
            (ProofShape::AppleStatement, [statement, assertion, ..]) => {
                let request = client_data.map(|client_data| AssertionRequest {
                    assertion,
                    client_data,
                    last_counter: 0,
                });
                self.apple.verify(statement, challenge, request)
            }
            _ => AttestationResult::error("attestation proof is empty", None),
        };
        self.finish(shape.platform(), result)
    }
}

/// Accepts every proof without looking at it. For tests of code that sits behind attestation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVerifier;

impl AttestationService for NoopVerifier {
    fn verify_attestation(
        &self,
        proof: &[Vec<u8>],
        _challenge: &[u8],
        client_data: Option<&[u8]>,
    ) -> AttestationResult {
        if proof.len() > 2 {
            AttestationResult::AndroidNoop {
                certificate_chain: proof.to_vec(),
            }
        } else {
            AttestationResult::IosNoop {
                client_data: client_data.map(<[u8]>::to_vec),
            }
        }
    }
}

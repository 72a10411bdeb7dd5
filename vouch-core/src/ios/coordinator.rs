//! Runs an App Attest statement past every configured app, then applies the checks that do
//! not depend on the validator library: freshness, the OS version gate and the assertion
//! counter.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, instrument};

use super::envelope::{parse_os_versions, StatementEnvelope};
use super::validator::{
    AppAttestValidator, AppAttestValidatorFactory, ValidatedAttestation, ValidatorContext,
};
use super::{IosAttestationConfiguration, APPLE_RECOMMENDED_MAX_AGE_SECS};
use crate::clock::Clock;
use crate::error::{AttestationError, Cause, IosReason, Result};
use crate::observer::{VerificationEvent, VerificationObserver};
use crate::result::{AssertedClientData, AttestationResult};
use crate::taxonomy::classify_app_attest;
use crate::version::ParsedVersions;

/// An assertion to check after the statement, and the data it signs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AssertionRequest<'a> {
    pub assertion: &'a [u8],
    pub client_data: &'a [u8],
    /// Highest signature counter expected before the assertion was made.
    pub last_counter: u32,
}

#[derive(Debug)]
pub(crate) struct AppleCoordinator {
    config: IosAttestationConfiguration,
    validators: Vec<Box<dyn AppAttestValidator>>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn VerificationObserver>,
}

/// Receipts may be `2 * |offset|` older than Apple recommends: the device clock can be off by
/// the offset in either direction.
pub(crate) fn receipt_max_age(offset: Duration) -> Duration {
    let magnitude = if offset < Duration::zero() { -offset } else { offset };
    magnitude
        .checked_mul(2)
        .and_then(|widened| widened.checked_add(&Duration::seconds(APPLE_RECOMMENDED_MAX_AGE_SECS)))
        .unwrap_or(Duration::MAX)
}

impl AppleCoordinator {
    /// `clock` must already carry the verification offset.
    pub fn new(
        config: &IosAttestationConfiguration,
        factory: &dyn AppAttestValidatorFactory,
        clock: Arc<dyn Clock>,
        offset: Duration,
        observer: Arc<dyn VerificationObserver>,
    ) -> Result<Self> {
        let context = ValidatorContext {
            clock: Arc::clone(&clock),
            receipt_max_age: receipt_max_age(offset),
        };
        let validators = config
            .applications()
            .iter()
            .map(|app| factory.create(app, &context))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            apps = validators.len(),
            receipt_max_age_secs = context.receipt_max_age.num_seconds(),
            "Created App Attest validators"
        );
        Ok(Self {
            config: config.clone(),
            validators,
            clock,
            observer,
        })
    }

    #[instrument(level = "debug", skip_all, fields(statement_len = statement.len(), with_assertion = assertion.is_some()))]
    pub fn verify(
        &self,
        statement: &[u8],
        challenge: &[u8],
        assertion: Option<AssertionRequest<'_>>,
    ) -> AttestationResult {
        let (validator, attestation) = match self.validate_statement(statement, challenge) {
            Ok(accepted) => accepted,
            Err(error) => return Self::rejected("iOS attestation failed", error),
        };
        debug!(app_id = %validator.app().app_id(), "App Attest statement accepted");

        if let Err(error) = self.check_freshness(&attestation) {
            return AttestationResult::failed(error);
        }
        let parsed_version = parse_os_versions(&attestation.certificate);
        if let Err(error) = self.check_version(validator, &parsed_version) {
            return AttestationResult::failed(error);
        }

        let Some(request) = assertion else {
            return AttestationResult::IosVerified {
                attestation,
                parsed_version,
                asserted_client_data: None,
            };
        };
        match Self::check_assertion(validator, &attestation, request, challenge) {
            Ok(asserted) => AttestationResult::IosVerified {
                attestation,
                parsed_version,
                asserted_client_data: Some(asserted),
            },
            Err(error) => Self::rejected("iOS assertion failed", error),
        }
    }

    fn rejected(context: &str, error: AttestationError) -> AttestationResult {
        AttestationResult::error(format!("{context}: {error}"), Some(error))
    }

    /// First app whose validator accepts the statement. If none does, the first app's failure
    /// is reported.
    fn validate_statement(
        &self,
        statement: &[u8],
        challenge: &[u8],
    ) -> std::result::Result<(&dyn AppAttestValidator, ValidatedAttestation), AttestationError> {
        let key_id = StatementEnvelope::parse(statement)
            .and_then(|envelope| envelope.key_id())
            .map_err(classify_app_attest)?;
        debug!(%key_id, "Derived App Attest key id");

        let mut first_failure = None;
        for validator in &self.validators {
            match validator.validate_attestation(statement, &key_id, challenge) {
                Ok(attestation) => return Ok((validator.as_ref(), attestation)),
                Err(error) => {
                    let app_id = validator.app().app_id();
                    self.observer.observe(&VerificationEvent::AppRejected {
                        app_id: &app_id,
                        error: &error,
                    });
                    first_failure.get_or_insert(error);
                }
            }
        }
        Err(match first_failure {
            Some(error) => classify_app_attest(error),
            None => AttestationError::ios_content(
                IosReason::AppUnexpected,
                "no App Attest validator configured",
                None,
            ),
        })
    }

    /// The statement must not be created in the future nor before the validity window.
    fn check_freshness(&self, attestation: &ValidatedAttestation) -> Result<()> {
        let now = self.clock.now();
        let created = attestation.receipt.effective_creation_time();
        if created > now {
            return Err(AttestationError::ios_content(
                IosReason::StatementTime,
                format!("attestation statement created in the future ({created} > {now})"),
                None,
            ));
        }
        let validity = self.config.statement_validity();
        if now.signed_duration_since(created) > validity {
            return Err(AttestationError::ios_content(
                IosReason::StatementTime,
                format!(
                    "attestation statement too old (created {created}, valid for {}s)",
                    validity.num_seconds()
                ),
                None,
            ));
        }
        Ok(())
    }

    fn check_version(&self, validator: &dyn AppAttestValidator, parsed: &ParsedVersions) -> Result<()> {
        let Some(minimum) = self.config.minimum_version_for(validator.app()) else {
            return Ok(());
        };
        match minimum.compare_to(parsed) {
            Ok(Ordering::Greater) => Err(AttestationError::ios_content(
                IosReason::OsVersion,
                format!("iOS version {} < {}", describe(parsed), minimum.sem_ver),
                None,
            )),
            Ok(_) => Ok(()),
            Err(error) => Err(AttestationError::ios_content(
                IosReason::OsVersion,
                "could not determine attested iOS version",
                Some(Cause::new(error)),
            )),
        }
    }

    fn check_assertion(
        validator: &dyn AppAttestValidator,
        attestation: &ValidatedAttestation,
        request: AssertionRequest<'_>,
        challenge: &[u8],
    ) -> std::result::Result<AssertedClientData, AttestationError> {
        let key = attestation.certificate.public_key().map_err(|e| {
            AttestationError::ios_content(
                IosReason::AppUnexpected,
                "attested certificate has no usable public key",
                Some(Cause::new(e)),
            )
        })?;
        let assertion = validator
            .validate_assertion(
                request.assertion,
                request.client_data,
                &key,
                request.last_counter,
                challenge,
            )
            .map_err(classify_app_attest)?;
        if assertion.sign_count != 1 {
            return Err(AttestationError::ios_content(
                IosReason::SigCtr,
                format!(
                    "iOS assertion counter is {}, but should be 1",
                    assertion.sign_count
                ),
                None,
            ));
        }
        Ok(AssertedClientData {
            client_data: request.client_data.to_vec(),
            assertion,
        })
    }
}

fn describe(parsed: &ParsedVersions) -> String {
    match (&parsed.sem_ver, &parsed.build_number) {
        (Some(sem_ver), _) => sem_ver.to_string(),
        (None, Some(build)) => build.to_string(),
        (None, None) => "unknown".to_string(),
    }
}

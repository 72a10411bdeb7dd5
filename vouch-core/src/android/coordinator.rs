//! Runs every enabled Android strategy and reconciles their outcomes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use openssl::x509::X509;
use tracing::{debug, instrument};

use super::checker::{AndroidAttestationChecker, AndroidCheckError, AndroidCheckerFactory};
use super::AndroidAttestationConfiguration;
use crate::error::{AndroidReason, AttestationError, Platform, Result};
use crate::observer::{VerificationEvent, VerificationObserver};
use crate::result::AttestationResult;
use crate::taxonomy::classify_android;

#[derive(Debug)]
pub(crate) struct AndroidCoordinator {
    checkers: Vec<Arc<dyn AndroidAttestationChecker>>,
    observer: Arc<dyn VerificationObserver>,
}

impl AndroidCoordinator {
    pub fn new(
        config: &AndroidAttestationConfiguration,
        factory: &dyn AndroidCheckerFactory,
        observer: Arc<dyn VerificationObserver>,
    ) -> Result<Self> {
        let checkers = config
            .enabled_strategies()
            .into_iter()
            .map(|strategy| factory.create(strategy, config))
            .collect::<Result<Vec<_>>>()?;
        if checkers.is_empty() {
            return Err(AttestationError::configuration(
                Platform::Android,
                "no Android checker available",
            ));
        }
        Ok(Self { checkers, observer })
    }

    /// Verify a DER chain (leaf first) at `at`.
    ///
    /// The chain is accepted if any strategy accepts it. Otherwise a time failure is preferred
    /// over other failures, since it points at clock skew rather than a bad device; failing that,
    /// the last strategy's failure is reported.
    #[instrument(level = "debug", skip_all, fields(chain_len = proof.len()))]
    pub fn verify(
        &self,
        proof: &[Vec<u8>],
        at: DateTime<Utc>,
        challenge: &[u8],
        client_data: Option<&[u8]>,
    ) -> AttestationResult {
        let chain: Vec<X509> = proof
            .iter()
            .filter_map(|der| X509::from_der(der).ok())
            .collect();
        if chain.len() != proof.len() {
            return AttestationResult::failed(AttestationError::android_content(
                AndroidReason::AppUnexpected,
                "could not parse certificate chain",
                None,
            ));
        }
        self.verify_chain(chain, at, challenge, client_data)
    }

    pub fn verify_chain(
        &self,
        chain: Vec<X509>,
        at: DateTime<Utc>,
        challenge: &[u8],
        client_data: Option<&[u8]>,
    ) -> AttestationResult {
        let mut failures: Vec<AndroidCheckError> = Vec::with_capacity(self.checkers.len());
        let mut accepted = None;
        for checker in &self.checkers {
            match checker.verify(&chain, at, challenge) {
                Ok(record) => {
                    debug!(strategy = %checker.strategy(), "Android strategy accepted chain");
                    accepted = Some(record);
                    break;
                }
                Err(error) => {
                    self.observer.observe(&VerificationEvent::StrategyFailed {
                        strategy: checker.strategy(),
                        error: &error,
                    });
                    failures.push(error);
                }
            }
        }

        let Some(record) = accepted else {
            return Self::reconcile(failures);
        };

        if let Some(client_data) = client_data {
            if let Err(error) = check_bound_key(&chain, client_data) {
                return AttestationResult::failed(error);
            }
        }
        AttestationResult::AndroidVerified {
            certificate_chain: chain,
            record,
        }
    }

    fn reconcile(mut failures: Vec<AndroidCheckError>) -> AttestationResult {
        let reported = match failures.iter().position(AndroidCheckError::is_time_failure) {
            Some(index) => Some(failures.swap_remove(index)),
            None => failures.pop(),
        };
        match reported {
            Some(error) => {
                let classified = classify_android(error);
                AttestationResult::error(
                    format!("Android attestation failed: {classified}"),
                    Some(classified),
                )
            }
            None => AttestationResult::failed(AttestationError::android_content(
                AndroidReason::AppUnexpected,
                "no strategy evaluated the chain",
                None,
            )),
        }
    }
}

/// The leaf must certify the key whose DER encoding the caller passed as client data.
fn check_bound_key(chain: &[X509], client_data: &[u8]) -> Result<()> {
    let leaf_key = chain
        .first()
        .and_then(|leaf| leaf.public_key().ok())
        .and_then(|key| key.public_key_to_der().ok());
    if leaf_key.as_deref() == Some(client_data) {
        Ok(())
    } else {
        Err(AttestationError::android_content(
            AndroidReason::AppUnexpected,
            "attested key does not match the leaf certificate",
            None,
        ))
    }
}

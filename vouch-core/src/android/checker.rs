//! Per-strategy Android attestation checkers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use openssl::error::ErrorStack;
use openssl::x509::X509;
use thiserror::Error;
use tracing::{debug, instrument};

use super::chain::{verify_chain, TrustAnchors};
use super::record::{
    AttestationRecord, AttestationRecordSource, AuthorizationList, KeyDescriptionExtension,
    SecurityLevel, VerifiedBootState,
};
use super::{AndroidAttestationConfiguration, AndroidStrategy};
use crate::clock::shift;
use crate::error::{AndroidReason, AttestationError, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateInvalidReason {
    /// A certificate is outside its validity period at the verification instant.
    Time,
    /// Broken chain or unknown root.
    Trust,
}

/// Failure raised by an [`AndroidAttestationChecker`].
#[derive(Debug, Error)]
pub enum AndroidCheckError {
    #[error("certificate chain invalid ({reason:?}): {message}")]
    CertificateInvalid {
        reason: CertificateInvalidReason,
        message: String,
    },

    #[error("certificate processing failed: {0}")]
    Certificate(#[from] ErrorStack),

    #[error("attestation value mismatch ({reason}): {message}")]
    AttestationValue {
        reason: AndroidReason,
        message: String,
    },

    #[error("malformed attestation record: {0}")]
    MalformedRecord(String),
}

impl AndroidCheckError {
    pub fn invalid_certificate(reason: CertificateInvalidReason, message: impl Into<String>) -> Self {
        Self::CertificateInvalid {
            reason,
            message: message.into(),
        }
    }

    pub fn value(reason: AndroidReason, message: impl Into<String>) -> Self {
        Self::AttestationValue {
            reason,
            message: message.into(),
        }
    }

    pub fn is_time_failure(&self) -> bool {
        matches!(
            self,
            Self::CertificateInvalid {
                reason: CertificateInvalidReason::Time,
                ..
            }
        )
    }
}

/// Verifies a chain and its attestation record under one strategy.
pub trait AndroidAttestationChecker: Send + Sync + fmt::Debug {
    fn strategy(&self) -> AndroidStrategy;

    /// Verify `chain` (leaf first) at `at`, returning the leaf's attestation record.
    fn verify(
        &self,
        chain: &[X509],
        at: DateTime<Utc>,
        challenge: &[u8],
    ) -> Result<AttestationRecord, AndroidCheckError>;
}

/// Creates the checker for each enabled strategy.
pub trait AndroidCheckerFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        strategy: AndroidStrategy,
        config: &AndroidAttestationConfiguration,
    ) -> Result<Arc<dyn AndroidAttestationChecker>, AttestationError>;
}

/// Builds [`StandardAndroidChecker`]s reading records through a shared source.
#[derive(Debug, Clone)]
pub struct StandardCheckerFactory {
    records: Arc<dyn AttestationRecordSource>,
}

impl StandardCheckerFactory {
    pub fn new(records: Arc<dyn AttestationRecordSource>) -> Self {
        Self { records }
    }
}

impl Default for StandardCheckerFactory {
    fn default() -> Self {
        Self::new(Arc::new(KeyDescriptionExtension))
    }
}

impl AndroidCheckerFactory for StandardCheckerFactory {
    fn create(
        &self,
        strategy: AndroidStrategy,
        config: &AndroidAttestationConfiguration,
    ) -> Result<Arc<dyn AndroidAttestationChecker>, AttestationError> {
        let anchors = TrustAnchors::from_certificates(config.trust_anchors_for(strategy))
            .map_err(|e| {
                AttestationError::configuration_caused_by(
                    Platform::Android,
                    format!("unusable {strategy} trust anchor"),
                    e,
                )
            })?;
        Ok(Arc::new(StandardAndroidChecker {
            strategy,
            config: config.clone(),
            anchors,
            records: Arc::clone(&self.records),
        }))
    }
}

/// Chain validation plus the attestation policy of one strategy.
#[derive(Debug)]
pub struct StandardAndroidChecker {
    strategy: AndroidStrategy,
    config: AndroidAttestationConfiguration,
    anchors: TrustAnchors,
    records: Arc<dyn AttestationRecordSource>,
}

impl AndroidAttestationChecker for StandardAndroidChecker {
    fn strategy(&self) -> AndroidStrategy {
        self.strategy
    }

    #[instrument(level = "debug", skip_all, fields(strategy = %self.strategy, chain_len = chain.len()))]
    fn verify(
        &self,
        chain: &[X509],
        at: DateTime<Utc>,
        challenge: &[u8],
    ) -> Result<AttestationRecord, AndroidCheckError> {
        let at = shift(at, self.config.verification_offset());
        verify_chain(chain, &self.anchors, at, self.config.ignores_leaf_validity())?;
        let leaf = chain.first().ok_or_else(|| {
            AndroidCheckError::invalid_certificate(CertificateInvalidReason::Trust, "empty chain")
        })?;
        let record = self.records.extract(leaf)?;
        self.check_record(&record, challenge)?;
        debug!("Attestation record accepted");
        Ok(record)
    }
}

impl StandardAndroidChecker {
    fn check_record(
        &self,
        record: &AttestationRecord,
        challenge: &[u8],
    ) -> Result<(), AndroidCheckError> {
        if record.attestation_challenge != challenge {
            return Err(AndroidCheckError::value(
                AndroidReason::Challenge,
                "attested challenge does not match",
            ));
        }
        self.check_security_levels(record)?;
        self.check_application(record)?;

        let enforced = self.enforced_list(record);
        self.check_system_integrity(enforced)?;
        self.check_os_version(enforced)?;
        if self.config.requires_rollback_resistance() && !enforced.rollback_resistance {
            return Err(AndroidCheckError::value(
                AndroidReason::RollbackResistance,
                "key is not rollback resistant",
            ));
        }
        Ok(())
    }

    /// Hardware-rooted strategies trust TEE-enforced values; software attestation has no others.
    fn enforced_list<'r>(&self, record: &'r AttestationRecord) -> &'r AuthorizationList {
        match self.strategy {
            AndroidStrategy::Hardware | AndroidStrategy::NougatHybrid => &record.tee_enforced,
            AndroidStrategy::Software => &record.software_enforced,
        }
    }

    fn check_security_levels(&self, record: &AttestationRecord) -> Result<(), AndroidCheckError> {
        let keymaster = record.keymaster_security_level;
        let attestation = record.attestation_security_level;
        let acceptable = match self.strategy {
            AndroidStrategy::Hardware if self.config.requires_strongbox() => {
                keymaster == SecurityLevel::StrongBox && attestation == SecurityLevel::StrongBox
            }
            AndroidStrategy::Hardware => {
                keymaster.is_hardware_backed() && attestation.is_hardware_backed()
            }
            AndroidStrategy::NougatHybrid => {
                keymaster.is_hardware_backed() && attestation == SecurityLevel::Software
            }
            AndroidStrategy::Software => {
                keymaster == SecurityLevel::Software && attestation == SecurityLevel::Software
            }
        };
        if acceptable {
            Ok(())
        } else {
            Err(AndroidCheckError::value(
                AndroidReason::SecLevel,
                format!(
                    "keymaster {keymaster} / attestation {attestation} not acceptable for {} attestation",
                    self.strategy
                ),
            ))
        }
    }

    fn check_application(&self, record: &AttestationRecord) -> Result<(), AndroidCheckError> {
        let app_id = record.application_id().ok_or_else(|| {
            AndroidCheckError::value(
                AndroidReason::PackageName,
                "record carries no attestation application id",
            )
        })?;
        let (app, package) = self
            .config
            .applications()
            .iter()
            .find_map(|app| {
                app_id
                    .package_infos
                    .iter()
                    .find(|info| info.package_name == app.package_name)
                    .map(|info| (app, info))
            })
            .ok_or_else(|| {
                let attested: Vec<&str> = app_id
                    .package_infos
                    .iter()
                    .map(|info| info.package_name.as_str())
                    .collect();
                AndroidCheckError::value(
                    AndroidReason::PackageName,
                    format!("no configured app matches {attested:?}"),
                )
            })?;

        if app_id.signature_digests.is_empty()
            || !app_id
                .signature_digests
                .iter()
                .all(|digest| app.signature_digests.contains(digest))
        {
            return Err(AndroidCheckError::value(
                AndroidReason::AppSignerDigest,
                format!("signer digests of {} not configured", app.package_name),
            ));
        }
        if let Some(minimum) = app.app_version {
            if package.version < minimum {
                return Err(AndroidCheckError::value(
                    AndroidReason::AppVersion,
                    format!("app version {} lower than {minimum}", package.version),
                ));
            }
        }
        Ok(())
    }

    /// Software attestation carries no trustworthy root of trust, so only hardware-rooted
    /// strategies look at it.
    fn check_system_integrity(&self, enforced: &AuthorizationList) -> Result<(), AndroidCheckError> {
        if self.config.allows_bootloader_unlock() || self.strategy == AndroidStrategy::Software {
            return Ok(());
        }
        match &enforced.root_of_trust {
            Some(root)
                if root.device_locked
                    && root.verified_boot_state == VerifiedBootState::Verified =>
            {
                Ok(())
            }
            Some(root) => Err(AndroidCheckError::value(
                AndroidReason::SystemIntegrity,
                format!(
                    "bootloader locked: {}, verified boot state: {:?}",
                    root.device_locked, root.verified_boot_state
                ),
            )),
            None => Err(AndroidCheckError::value(
                AndroidReason::SystemIntegrity,
                "no root of trust attested",
            )),
        }
    }

    fn check_os_version(&self, enforced: &AuthorizationList) -> Result<(), AndroidCheckError> {
        if let Some(minimum) = self.config.android_version() {
            match enforced.os_version {
                Some(version) if version >= minimum => {}
                other => {
                    return Err(AndroidCheckError::value(
                        AndroidReason::OsVersion,
                        format!("OS version {other:?} lower than {minimum}"),
                    ))
                }
            }
        }
        if let Some(minimum) = self.config.patch_level() {
            match enforced.os_patch_level {
                Some(level) if level >= minimum.as_yyyymm() => {}
                other => {
                    return Err(AndroidCheckError::value(
                        AndroidReason::OsVersion,
                        format!(
                            "patch level {other:?} older than {}",
                            minimum.as_yyyymm()
                        ),
                    ))
                }
            }
        }
        Ok(())
    }
}

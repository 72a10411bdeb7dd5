//! Android Key Attestation.
//!
//! A proof is a DER certificate chain, leaf first, whose leaf carries a KeyDescription
//! extension. Up to three [`AndroidStrategy`] checkers run against every chain and their
//! outcomes are reconciled by the coordinator.

pub mod chain;
pub mod checker;
pub(crate) mod coordinator;
pub mod record;

use std::fmt;

use openssl::x509::X509;
use serde::{Deserialize, Serialize};

use crate::error::{AttestationError, Platform, Result};

pub use checker::{
    AndroidAttestationChecker, AndroidCheckError, AndroidCheckerFactory, CertificateInvalidReason,
    StandardAndroidChecker, StandardCheckerFactory,
};
pub use record::{
    AttestationApplicationId, AttestationRecord, AttestationRecordSource, AuthorizationList,
    KeyDescriptionExtension, PackageInfo, RootOfTrust, SecurityLevel, VerifiedBootState,
};

/// Attestation strategies, ordered strictest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AndroidStrategy {
    /// Keymaster and attestation in TEE or StrongBox, rooted in a hardware anchor.
    Hardware,
    /// Keymaster in TEE, attestation in software: Android 7 devices.
    NougatHybrid,
    /// Software-only attestation, for emulators and testing.
    Software,
}

impl fmt::Display for AndroidStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware => write!(f, "hardware"),
            Self::NougatHybrid => write!(f, "nougat-hybrid"),
            Self::Software => write!(f, "software"),
        }
    }
}

/// One Android app that is allowed to attest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AndroidAppData {
    pub package_name: String,
    /// SHA-256 digests of the APK signer certificates.
    #[serde(with = "crate::encoding::hex_list")]
    pub signature_digests: Vec<Vec<u8>>,
    /// Minimum accepted app version code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<u64>,
}

impl AndroidAppData {
    pub fn new(package_name: impl Into<String>, signature_digests: Vec<Vec<u8>>) -> Self {
        Self {
            package_name: package_name.into(),
            signature_digests,
            app_version: None,
        }
    }

    pub fn with_app_version(mut self, version: u64) -> Self {
        self.app_version = Some(version);
        self
    }
}

/// Security patch level as year and month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatchLevel {
    pub year: u16,
    pub month: u8,
}

impl PatchLevel {
    pub fn new(year: u16, month: u8) -> Self {
        Self { year, month }
    }

    /// Patch level in the `YYYYMM` form used by attestation records.
    pub fn as_yyyymm(&self) -> u32 {
        u32::from(self.year) * 100 + u32::from(self.month)
    }
}

/// Unvalidated Android settings.
///
/// [`AndroidConfigurationBuilder::build`] validates and produces an
/// [`AndroidAttestationConfiguration`]; deserialization goes through the same path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AndroidConfigurationBuilder {
    applications: Vec<AndroidAppData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    android_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch_level: Option<PatchLevel>,
    require_strongbox: bool,
    allow_bootloader_unlock: bool,
    require_rollback_resistance: bool,
    ignore_leaf_validity: bool,
    #[serde(with = "crate::encoding::base64_list")]
    hardware_trust_anchors: Vec<Vec<u8>>,
    #[serde(with = "crate::encoding::base64_list")]
    software_trust_anchors: Vec<Vec<u8>>,
    disable_hardware_attestation: bool,
    enable_nougat_attestation: bool,
    enable_software_attestation: bool,
    verification_offset_secs: i64,
}

impl AndroidConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app(mut self, app: AndroidAppData) -> Self {
        self.applications.push(app);
        self
    }

    /// Minimum Android version, encoded as in attestation records (`140000` for Android 14).
    pub fn with_android_version(mut self, version: u32) -> Self {
        self.android_version = Some(version);
        self
    }

    pub fn with_patch_level(mut self, patch_level: PatchLevel) -> Self {
        self.patch_level = Some(patch_level);
        self
    }

    pub fn require_strongbox(mut self, require: bool) -> Self {
        self.require_strongbox = require;
        self
    }

    pub fn allow_bootloader_unlock(mut self, allow: bool) -> Self {
        self.allow_bootloader_unlock = allow;
        self
    }

    pub fn require_rollback_resistance(mut self, require: bool) -> Self {
        self.require_rollback_resistance = require;
        self
    }

    /// Skip validity period checks on the leaf. Some devices issue leaves with broken dates.
    pub fn ignore_leaf_validity(mut self, ignore: bool) -> Self {
        self.ignore_leaf_validity = ignore;
        self
    }

    pub fn with_hardware_trust_anchor(mut self, der: Vec<u8>) -> Self {
        self.hardware_trust_anchors.push(der);
        self
    }

    pub fn with_software_trust_anchor(mut self, der: Vec<u8>) -> Self {
        self.software_trust_anchors.push(der);
        self
    }

    pub fn disable_hardware_attestation(mut self, disable: bool) -> Self {
        self.disable_hardware_attestation = disable;
        self
    }

    pub fn enable_nougat_attestation(mut self, enable: bool) -> Self {
        self.enable_nougat_attestation = enable;
        self
    }

    pub fn enable_software_attestation(mut self, enable: bool) -> Self {
        self.enable_software_attestation = enable;
        self
    }

    /// Shift applied to the verification instant for chain validity checks only.
    pub fn with_verification_offset_secs(mut self, secs: i64) -> Self {
        self.verification_offset_secs = secs;
        self
    }

    pub fn build(self) -> Result<AndroidAttestationConfiguration> {
        if self.applications.is_empty() {
            return Err(AttestationError::configuration(
                Platform::Android,
                "no apps configured",
            ));
        }
        for app in &self.applications {
            if app.package_name.is_empty() {
                return Err(AttestationError::configuration(
                    Platform::Android,
                    "empty package name",
                ));
            }
            if app.signature_digests.is_empty() {
                return Err(AttestationError::configuration(
                    Platform::Android,
                    format!("no signature digests specified for {}", app.package_name),
                ));
            }
        }
        if let Some(level) = &self.patch_level {
            if !(1..=12).contains(&level.month) {
                return Err(AttestationError::configuration(
                    Platform::Android,
                    format!("invalid patch level month {}", level.month),
                ));
            }
        }
        if self.disable_hardware_attestation
            && !self.enable_nougat_attestation
            && !self.enable_software_attestation
        {
            return Err(AttestationError::configuration(
                Platform::Android,
                "neither hardware, nor nougat, nor software attestation enabled",
            ));
        }
        if !self.disable_hardware_attestation && self.hardware_trust_anchors.is_empty() {
            return Err(AttestationError::configuration(
                Platform::Android,
                "hardware attestation enabled without hardware trust anchors",
            ));
        }
        if (self.enable_nougat_attestation || self.enable_software_attestation)
            && self.software_trust_anchors.is_empty()
        {
            return Err(AttestationError::configuration(
                Platform::Android,
                "software-backed attestation enabled without software trust anchors",
            ));
        }
        for der in self
            .hardware_trust_anchors
            .iter()
            .chain(&self.software_trust_anchors)
        {
            X509::from_der(der).map_err(|e| {
                AttestationError::configuration_caused_by(
                    Platform::Android,
                    "trust anchor is not a DER certificate",
                    e,
                )
            })?;
        }
        Ok(AndroidAttestationConfiguration { settings: self })
    }
}

/// Validated Android attestation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "AndroidConfigurationBuilder",
    into = "AndroidConfigurationBuilder"
)]
pub struct AndroidAttestationConfiguration {
    settings: AndroidConfigurationBuilder,
}

impl AndroidAttestationConfiguration {
    pub fn builder() -> AndroidConfigurationBuilder {
        AndroidConfigurationBuilder::new()
    }

    pub fn applications(&self) -> &[AndroidAppData] {
        &self.settings.applications
    }

    pub fn android_version(&self) -> Option<u32> {
        self.settings.android_version
    }

    pub fn patch_level(&self) -> Option<PatchLevel> {
        self.settings.patch_level
    }

    pub fn requires_strongbox(&self) -> bool {
        self.settings.require_strongbox
    }

    pub fn allows_bootloader_unlock(&self) -> bool {
        self.settings.allow_bootloader_unlock
    }

    pub fn requires_rollback_resistance(&self) -> bool {
        self.settings.require_rollback_resistance
    }

    pub fn ignores_leaf_validity(&self) -> bool {
        self.settings.ignore_leaf_validity
    }

    pub fn hardware_trust_anchors(&self) -> &[Vec<u8>] {
        &self.settings.hardware_trust_anchors
    }

    pub fn software_trust_anchors(&self) -> &[Vec<u8>] {
        &self.settings.software_trust_anchors
    }

    pub fn verification_offset(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settings.verification_offset_secs)
    }

    /// Enabled strategies, strictest first.
    pub fn enabled_strategies(&self) -> Vec<AndroidStrategy> {
        let mut strategies = Vec::with_capacity(3);
        if !self.settings.disable_hardware_attestation {
            strategies.push(AndroidStrategy::Hardware);
        }
        if self.settings.enable_nougat_attestation {
            strategies.push(AndroidStrategy::NougatHybrid);
        }
        if self.settings.enable_software_attestation {
            strategies.push(AndroidStrategy::Software);
        }
        strategies
    }

    /// Trust anchors a strategy's chains must end in.
    pub fn trust_anchors_for(&self, strategy: AndroidStrategy) -> &[Vec<u8>] {
        match strategy {
            AndroidStrategy::Hardware => self.hardware_trust_anchors(),
            AndroidStrategy::NougatHybrid | AndroidStrategy::Software => {
                self.software_trust_anchors()
            }
        }
    }
}

impl TryFrom<AndroidConfigurationBuilder> for AndroidAttestationConfiguration {
    type Error = AttestationError;

    fn try_from(builder: AndroidConfigurationBuilder) -> Result<Self> {
        builder.build()
    }
}

impl From<AndroidAttestationConfiguration> for AndroidConfigurationBuilder {
    fn from(config: AndroidAttestationConfiguration) -> Self {
        config.settings
    }
}

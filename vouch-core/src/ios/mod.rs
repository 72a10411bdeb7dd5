//! Apple App Attest.
//!
//! A proof is a CBOR attestation statement, optionally followed by an assertion over client
//! data. Statement validation is delegated to one [`AppAttestValidator`] per configured app,
//! [`AppleValidator`] unless another factory is installed. Freshness, the OS version gate and
//! the assertion counter are checked here.

pub(crate) mod coordinator;
pub mod envelope;
pub mod native;
pub mod receipt;
pub mod validator;

use serde::{Deserialize, Serialize};

use crate::error::{AttestationError, Platform, Result};
use crate::version::OsVersions;

pub use envelope::{key_id_of, parse_os_versions, StatementEnvelope, OS_VERSION_OID};
pub use native::{
    AppleValidator, AppleValidatorFactory, AuthenticatorData, APPLE_ROOT_CA_G3, APP_ATTEST_ROOT_CA,
};
pub use receipt::{open_receipt, ReceiptPayload};
pub use validator::{
    AppAttestError, AppAttestValidator, AppAttestValidatorFactory, Assertion,
    AuthenticatorDataIssue, CertPathError, CertPathReason, Receipt, ReceiptError,
    ReceiptPayloadIssue, ValidatedAttestation, ValidatorContext,
};

/// Statement validity used when none is configured.
pub const DEFAULT_STATEMENT_VALIDITY_SECS: u64 = 5 * 60;

/// Receipt age in seconds Apple recommends accepting without any clock offset.
pub const APPLE_RECOMMENDED_MAX_AGE_SECS: i64 = 5 * 60;

/// One iOS app that is allowed to attest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IosAppData {
    pub team_identifier: String,
    pub bundle_identifier: String,
    /// Whether the app attests against the development (sandbox) environment.
    #[serde(default)]
    pub sandbox: bool,
    /// Replaces the globally configured minimum iOS version for this app.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_override: Option<OsVersions>,
}

impl IosAppData {
    pub fn new(team_identifier: impl Into<String>, bundle_identifier: impl Into<String>) -> Self {
        Self {
            team_identifier: team_identifier.into(),
            bundle_identifier: bundle_identifier.into(),
            sandbox: false,
            version_override: None,
        }
    }

    pub fn sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn override_version(mut self, version: OsVersions) -> Self {
        self.version_override = Some(version);
        self
    }

    /// `<team id>.<bundle id>`, the identity App Attest binds keys to.
    pub fn app_id(&self) -> String {
        format!("{}.{}", self.team_identifier, self.bundle_identifier)
    }
}

/// Serialized form of [`IosAttestationConfiguration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IosSettings {
    applications: Vec<IosAppData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ios_version: Option<OsVersions>,
    #[serde(default = "default_validity")]
    attestation_statement_validity_secs: u64,
}

fn default_validity() -> u64 {
    DEFAULT_STATEMENT_VALIDITY_SECS
}

/// Validated iOS attestation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "IosSettings", into = "IosSettings")]
pub struct IosAttestationConfiguration {
    settings: IosSettings,
}

impl IosAttestationConfiguration {
    pub fn new(applications: Vec<IosAppData>) -> Result<Self> {
        Self::with_settings(applications, None, DEFAULT_STATEMENT_VALIDITY_SECS)
    }

    pub fn single(app: IosAppData) -> Result<Self> {
        Self::new(vec![app])
    }

    pub fn with_settings(
        applications: Vec<IosAppData>,
        ios_version: Option<OsVersions>,
        attestation_statement_validity_secs: u64,
    ) -> Result<Self> {
        IosSettings {
            applications,
            ios_version,
            attestation_statement_validity_secs,
        }
        .try_into()
    }

    pub fn applications(&self) -> &[IosAppData] {
        &self.settings.applications
    }

    pub fn ios_version(&self) -> Option<&OsVersions> {
        self.settings.ios_version.as_ref()
    }

    pub fn statement_validity(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.settings.attestation_statement_validity_secs).unwrap_or(i64::MAX),
        )
    }

    /// The minimum iOS version that applies to `app`.
    pub fn minimum_version_for<'a>(&'a self, app: &'a IosAppData) -> Option<&'a OsVersions> {
        app.version_override.as_ref().or(self.ios_version())
    }
}

impl TryFrom<IosSettings> for IosAttestationConfiguration {
    type Error = AttestationError;

    fn try_from(settings: IosSettings) -> Result<Self> {
        if settings.applications.is_empty() {
            return Err(AttestationError::configuration(
                Platform::Ios,
                "no apps configured",
            ));
        }
        if let Some(app) = settings
            .applications
            .iter()
            .find(|app| app.team_identifier.is_empty() || app.bundle_identifier.is_empty())
        {
            return Err(AttestationError::configuration(
                Platform::Ios,
                format!("incomplete app identity `{}`", app.app_id()),
            ));
        }
        Ok(Self { settings })
    }
}

impl From<IosAttestationConfiguration> for IosSettings {
    fn from(config: IosAttestationConfiguration) -> Self {
        config.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_no_apps_rejected() {
        let err = IosAttestationConfiguration::new(vec![]).expect_err("no apps");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.platform(), Platform::Ios);
    }

    #[test]
    fn test_defaults_and_override() {
        let global = OsVersions::parse("16.0", "20A362").unwrap();
        let newer = OsVersions::parse("17.0", "21A329").unwrap();
        let plain = IosAppData::new("9CYHJNG644", "at.example.app");
        let pinned = IosAppData::new("9CYHJNG644", "at.example.pinned").override_version(newer.clone());
        let config = IosAttestationConfiguration::with_settings(
            vec![plain.clone(), pinned.clone()],
            Some(global.clone()),
            DEFAULT_STATEMENT_VALIDITY_SECS,
        )
        .unwrap();

        assert_eq!(config.statement_validity(), chrono::Duration::minutes(5));
        assert_eq!(config.minimum_version_for(&plain), Some(&global));
        assert_eq!(config.minimum_version_for(&pinned), Some(&newer));
        assert_eq!(plain.app_id(), "9CYHJNG644.at.example.app");
    }

    #[test]
    fn test_serde_defaults_validity_and_validates_versions() {
        let json = r#"{"applications":[{"teamIdentifier":"T","bundleIdentifier":"B"}]}"#;
        let config: IosAttestationConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(config.statement_validity(), chrono::Duration::seconds(300));
        assert!(!config.applications()[0].sandbox);

        let bad = r#"{"applications":[{"teamIdentifier":"T","bundleIdentifier":"B"}],
            "iosVersion":{"semVer":"17","buildNumber":"nope"}}"#;
        assert!(serde_json::from_str::<IosAttestationConfiguration>(bad).is_err());
        assert!(serde_json::from_str::<IosAttestationConfiguration>(r#"{"applications":[]}"#).is_err());
    }
}

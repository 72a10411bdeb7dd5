//! Closed error taxonomy for attestation failures.
//!
//! Every failure surfaced by a verification call is one of four kinds:
//!
//! - [`AttestationError::Content`]: the proof is well-formed and trusted, but some attested
//!   value (package, bundle, challenge, OS version, key, counter, statement age) does not match
//! - [`AttestationError::CertificateTime`]: the certificate chain is not valid at the
//!   verification instant, most likely because of clock skew
//! - [`AttestationError::CertificateTrust`]: the chain is broken or not rooted in a configured anchor
//! - [`AttestationError::Configuration`]: illegal setup, only raised at construction
//!
//! Callers branch on `(kind, platform, reason)`; the concrete error types of the underlying
//! collaborators are preserved as an opaque [`Cause`] and never surfaced raw.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Platform an attestation check was performed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Android,
    Ios,
    /// The proof was so malformed that no platform could be inferred.
    Unknown,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Android => write!(f, "Android"),
            Self::Ios => write!(f, "iOS"),
            Self::Unknown => write!(f, "unknown platform"),
        }
    }
}

/// Why an Android attestation record failed policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AndroidReason {
    /// No configured app matches the attested package name.
    PackageName,
    /// The APK signer certificate digests are not among the configured ones.
    AppSignerDigest,
    /// The attested app version is lower than configured.
    AppVersion,
    /// The attested challenge differs from the expected one.
    Challenge,
    /// OS version or patch level is lower than configured.
    OsVersion,
    /// Keymaster/attestation security level does not fit the strategy.
    SecLevel,
    /// Unlocked bootloader or unverified boot state.
    SystemIntegrity,
    /// Rollback resistance required but not attested.
    RollbackResistance,
    /// Anything else, including a mismatching attested key.
    AppUnexpected,
}

impl AndroidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PackageName => "PACKAGE_NAME",
            Self::AppSignerDigest => "APP_SIGNER_DIGEST",
            Self::AppVersion => "APP_VERSION",
            Self::Challenge => "CHALLENGE",
            Self::OsVersion => "OS_VERSION",
            Self::SecLevel => "SEC_LEVEL",
            Self::SystemIntegrity => "SYSTEM_INTEGRITY",
            Self::RollbackResistance => "ROLLBACK_RESISTANCE",
            Self::AppUnexpected => "APP_UNEXPECTED",
        }
    }
}

impl fmt::Display for AndroidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an Apple App Attest statement or assertion was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IosReason {
    /// iOS version too old, or the attested version could not be compared.
    OsVersion,
    /// Assertion signature counter is not exactly 1.
    SigCtr,
    /// Team identifier, bundle identifier or environment mismatch.
    Identifier,
    /// Nonce in the statement does not match the expected challenge.
    Challenge,
    /// Statement created in the future or older than the validity window.
    StatementTime,
    /// Generic case that must not happen for an authentic app.
    AppUnexpected,
}

impl IosReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OsVersion => "OS_VERSION",
            Self::SigCtr => "SIG_CTR",
            Self::Identifier => "IDENTIFIER",
            Self::Challenge => "CHALLENGE",
            Self::StatementTime => "STATEMENT_TIME",
            Self::AppUnexpected => "APP_UNEXPECTED",
        }
    }
}

impl fmt::Display for IosReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content reason paired with its platform.
///
/// The pairing is carried by the type: an iOS reason cannot end up on an Android error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentReason {
    Android(AndroidReason),
    Ios(IosReason),
    Unknown,
}

impl ContentReason {
    pub fn platform(&self) -> Platform {
        match self {
            Self::Android(_) => Platform::Android,
            Self::Ios(_) => Platform::Ios,
            Self::Unknown => Platform::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Android(reason) => reason.as_str(),
            Self::Ios(reason) => reason.as_str(),
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ContentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.platform(), self.as_str())
    }
}

/// Coarse kind of an [`AttestationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Content,
    CertificateTime,
    CertificateTrust,
    Configuration,
}

/// Opaque, shareable wrapper around the collaborator error that caused a failure.
#[derive(Clone)]
pub struct Cause(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl Cause {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// A cause that is only a message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Downcast the wrapped error to a concrete collaborator error type.
    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.0.as_ref()
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Cause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// The closed attestation error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum AttestationError {
    #[error("{reason} mismatch: {message}")]
    Content {
        reason: ContentReason,
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("{platform} certificate chain not valid at verification time: {message}")]
    CertificateTime {
        platform: Platform,
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("{platform} certificate chain not trusted: {message}")]
    CertificateTrust {
        platform: Platform,
        message: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("illegal {platform} configuration: {message}")]
    Configuration {
        platform: Platform,
        message: String,
        #[source]
        cause: Option<Cause>,
    },
}

impl AttestationError {
    pub fn android_content(
        reason: AndroidReason,
        message: impl Into<String>,
        cause: Option<Cause>,
    ) -> Self {
        Self::Content {
            reason: ContentReason::Android(reason),
            message: message.into(),
            cause,
        }
    }

    pub fn ios_content(reason: IosReason, message: impl Into<String>, cause: Option<Cause>) -> Self {
        Self::Content {
            reason: ContentReason::Ios(reason),
            message: message.into(),
            cause,
        }
    }

    pub fn unknown_content(message: impl Into<String>, cause: Option<Cause>) -> Self {
        Self::Content {
            reason: ContentReason::Unknown,
            message: message.into(),
            cause,
        }
    }

    pub fn certificate_time(
        platform: Platform,
        message: impl Into<String>,
        cause: Option<Cause>,
    ) -> Self {
        Self::CertificateTime {
            platform,
            message: message.into(),
            cause,
        }
    }

    pub fn certificate_trust(
        platform: Platform,
        message: impl Into<String>,
        cause: Option<Cause>,
    ) -> Self {
        Self::CertificateTrust {
            platform,
            message: message.into(),
            cause,
        }
    }

    pub fn configuration(platform: Platform, message: impl Into<String>) -> Self {
        Self::Configuration {
            platform,
            message: message.into(),
            cause: None,
        }
    }

    pub fn configuration_caused_by<E>(platform: Platform, message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Configuration {
            platform,
            message: message.into(),
            cause: Some(Cause::new(cause)),
        }
    }

    /// Replace the cause.
    pub fn caused_by(mut self, new_cause: Cause) -> Self {
        match &mut self {
            Self::Content { cause, .. }
            | Self::CertificateTime { cause, .. }
            | Self::CertificateTrust { cause, .. }
            | Self::Configuration { cause, .. } => *cause = Some(new_cause),
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Content { .. } => ErrorKind::Content,
            Self::CertificateTime { .. } => ErrorKind::CertificateTime,
            Self::CertificateTrust { .. } => ErrorKind::CertificateTrust,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            Self::Content { reason, .. } => reason.platform(),
            Self::CertificateTime { platform, .. }
            | Self::CertificateTrust { platform, .. }
            | Self::Configuration { platform, .. } => *platform,
        }
    }

    pub fn content_reason(&self) -> Option<ContentReason> {
        match self {
            Self::Content { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn android_reason(&self) -> Option<AndroidReason> {
        match self.content_reason() {
            Some(ContentReason::Android(reason)) => Some(reason),
            _ => None,
        }
    }

    pub fn ios_reason(&self) -> Option<IosReason> {
        match self.content_reason() {
            Some(ContentReason::Ios(reason)) => Some(reason),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Content { message, .. }
            | Self::CertificateTime { message, .. }
            | Self::CertificateTrust { message, .. }
            | Self::Configuration { message, .. } => message,
        }
    }

    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Content { cause, .. }
            | Self::CertificateTime { cause, .. }
            | Self::CertificateTrust { cause, .. }
            | Self::Configuration { cause, .. } => cause.as_ref(),
        }
    }
}

/// Equality ignores the opaque cause: two errors are equal when a caller could not tell them
/// apart by `(kind, platform, reason, message)`.
impl PartialEq for AttestationError {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind()
            && self.platform() == other.platform()
            && self.content_reason() == other.content_reason()
            && self.message() == other.message()
    }
}

impl Eq for AttestationError {}

pub type Result<T> = std::result::Result<T, AttestationError>;

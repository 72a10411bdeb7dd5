//! OS version ordering: semantic versions and Apple build numbers.
//!
//! Apple attests both a semantic version (`17.2.1`) and a build number (`21C66`). Build numbers
//! order by a derived semantic version: the leading digits are the build train (major), the
//! letters that follow are the minor version read as base-36, the digits after that are the
//! build version (patch), and trailing letters are a mastering counter (pre-release).
//!
//! Base-36 digits are case-insensitive, so `21C66` and `21c66` compare equal. Only the
//! mastering counter is compared case-sensitively.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{AttestationError, Platform};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid semantic version `{0}`")]
    InvalidSemVer(String),

    #[error("invalid build number `{0}`: {1}")]
    InvalidBuildNumber(String, &'static str),

    #[error("neither a semantic version nor a build number was attested")]
    NothingToCompare,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Identifier {
    Numeric(u64),
    Alpha(String),
}

impl Identifier {
    fn parse(raw: &str, original: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidSemVer(original.to_string());
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid());
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            if raw.len() > 1 && raw.starts_with('0') {
                return Err(invalid());
            }
            return raw.parse().map(Self::Numeric).map_err(|_| invalid());
        }
        Ok(Self::Alpha(raw.to_string()))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Numeric(a), Self::Numeric(b)) => a.cmp(b),
            (Self::Numeric(_), Self::Alpha(_)) => Ordering::Less,
            (Self::Alpha(_), Self::Numeric(_)) => Ordering::Greater,
            (Self::Alpha(a), Self::Alpha(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Alpha(s) => f.write_str(s),
        }
    }
}

/// A semantic version with SemVer 2.0 precedence.
///
/// Parsing is lenient about missing components: `17` and `17.2` read as `17.0.0` and `17.2.0`.
/// Build metadata is kept for display but ignored for ordering and equality.
#[derive(Debug, Clone)]
pub struct SemVer {
    major: u64,
    minor: u64,
    patch: u64,
    pre_release: Vec<Identifier>,
    build: Option<String>,
}

impl SemVer {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: Vec::new(),
            build: None,
        }
    }

    /// Attach a dot-separated pre-release tag.
    pub fn with_pre_release(mut self, pre_release: &str) -> Result<Self, VersionError> {
        self.pre_release = pre_release
            .split('.')
            .map(|id| Identifier::parse(id, pre_release))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    pub fn patch(&self) -> u64 {
        self.patch
    }

    pub fn is_pre_release(&self) -> bool {
        !self.pre_release.is_empty()
    }
}

impl FromStr for SemVer {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidSemVer(s.to_string());
        let (rest, build) = match s.split_once('+') {
            Some((rest, build)) if !build.is_empty() => (rest, Some(build.to_string())),
            Some(_) => return Err(invalid()),
            None => (s, None),
        };
        let (core, pre) = match rest.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (rest, None),
        };

        let mut numbers = [0u64; 3];
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return Err(invalid());
        }
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty()
                || !part.bytes().all(|b| b.is_ascii_digit())
                || (part.len() > 1 && part.starts_with('0'))
            {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }

        let mut version = SemVer::new(numbers[0], numbers[1], numbers[2]);
        if let Some(pre) = pre {
            version = version
                .with_pre_release(pre)
                .map_err(|_| invalid())?;
        }
        version.build = build;
        Ok(version)
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (self.is_pre_release(), other.is_pre_release()) {
                (false, false) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (true, true) => self.pre_release.cmp(&other.pre_release),
            })
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SemVer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SemVer {}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre_release.is_empty() {
            let ids: Vec<String> = self.pre_release.iter().map(ToString::to_string).collect();
            write!(f, "-{}", ids.join("."))?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl Serialize for SemVer {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SemVer {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An Apple build number such as `21C66` or `20B5012d`.
///
/// Equality follows the ordering, which ignores the case of the minor version letters.
/// [`Display`](fmt::Display) keeps the text as parsed.
#[derive(Debug, Clone)]
pub struct BuildNumber {
    raw: String,
    build_train: u64,
    minor_version: String,
    build_version: u64,
    mastering_counter: Option<String>,
    ordering_key: SemVer,
}

impl BuildNumber {
    pub fn build_train(&self) -> u64 {
        self.build_train
    }

    pub fn minor_version(&self) -> &str {
        &self.minor_version
    }

    pub fn build_version(&self) -> u64 {
        self.build_version
    }

    pub fn mastering_counter(&self) -> Option<&str> {
        self.mastering_counter.as_deref()
    }

    /// The semantic version this build number is ordered by.
    pub fn as_sem_ver(&self) -> &SemVer {
        &self.ordering_key
    }
}

impl FromStr for BuildNumber {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why| VersionError::InvalidBuildNumber(s.to_string(), why);
        if !s.is_ascii() {
            return Err(invalid("non-ASCII characters"));
        }

        let train_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        if train_end == 0 {
            return Err(invalid("missing build train"));
        }
        let minor_end = s[train_end..]
            .find(|c: char| !c.is_ascii_alphabetic())
            .map_or(s.len(), |i| train_end + i);
        if minor_end == train_end {
            return Err(invalid("missing minor version"));
        }
        let mastering_start = s.trim_end_matches(|c: char| c.is_ascii_alphabetic()).len();
        if mastering_start <= minor_end {
            return Err(invalid("missing build version"));
        }
        let build_digits = &s[minor_end..mastering_start];
        if !build_digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("unexpected characters in build version"));
        }

        let build_train: u64 = s[..train_end]
            .parse()
            .map_err(|_| invalid("build train out of range"))?;
        let minor_version = s[train_end..minor_end].to_string();
        let minor_numeric = u64::from_str_radix(&minor_version, 36)
            .map_err(|_| invalid("minor version out of range"))?;
        let build_version: u64 = build_digits
            .parse()
            .map_err(|_| invalid("build version out of range"))?;
        let mastering_counter =
            (mastering_start < s.len()).then(|| s[mastering_start..].to_string());

        let mut ordering_key = SemVer::new(build_train, minor_numeric, build_version);
        if let Some(counter) = &mastering_counter {
            ordering_key = ordering_key
                .with_pre_release(counter)
                .map_err(|_| invalid("invalid mastering counter"))?;
        }

        Ok(Self {
            raw: s.to_string(),
            build_train,
            minor_version,
            build_version,
            mastering_counter,
            ordering_key,
        })
    }
}

impl Ord for BuildNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering_key.cmp(&other.ordering_key)
    }
}

impl PartialOrd for BuildNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for BuildNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BuildNumber {}

impl fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for BuildNumber {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for BuildNumber {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// OS version information read from an attestation certificate. Either half may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedVersions {
    pub sem_ver: Option<SemVer>,
    pub build_number: Option<BuildNumber>,
}

/// A configured minimum OS version, given both as semantic version and build number.
///
/// Both halves are parsed eagerly so that malformed configuration fails at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsVersions {
    pub sem_ver: SemVer,
    pub build_number: BuildNumber,
}

impl OsVersions {
    pub fn parse(sem_ver: &str, build_number: &str) -> Result<Self, AttestationError> {
        let sem_ver = sem_ver.parse().map_err(|e| {
            AttestationError::configuration_caused_by(Platform::Ios, "malformed iOS version", e)
        })?;
        let build_number = build_number.parse().map_err(|e| {
            AttestationError::configuration_caused_by(
                Platform::Ios,
                "malformed iOS build number",
                e,
            )
        })?;
        Ok(Self {
            sem_ver,
            build_number,
        })
    }

    /// Compare this configured minimum against attested versions.
    ///
    /// The semantic version wins when attested, otherwise the build number is used. Returns
    /// `Greater` when the configured minimum is newer than what was attested.
    pub fn compare_to(&self, parsed: &ParsedVersions) -> Result<Ordering, VersionError> {
        if let Some(attested) = &parsed.sem_ver {
            return Ok(self.sem_ver.cmp(attested));
        }
        if let Some(attested) = &parsed.build_number {
            return Ok(self.build_number.cmp(attested));
        }
        Err(VersionError::NothingToCompare)
    }
}

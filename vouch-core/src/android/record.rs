//! Android attestation records and the KeyDescription extension parser.

use std::fmt;

use openssl::x509::X509Ref;
use serde::{Deserialize, Serialize};
use tracing::debug;
use x509_parser::der_parser::ber::BerObject;
use x509_parser::der_parser::error::BerError;
use x509_parser::der_parser::parse_der;

use super::checker::AndroidCheckError;

/// OID of the Android KeyDescription certificate extension.
pub const KEY_DESCRIPTION_OID: &str = "1.3.6.1.4.1.11129.2.1.17";

const TAG_ROLLBACK_RESISTANCE: u32 = 703;
const TAG_ROOT_OF_TRUST: u32 = 704;
const TAG_OS_VERSION: u32 = 705;
const TAG_OS_PATCH_LEVEL: u32 = 706;
const TAG_ATTESTATION_APPLICATION_ID: u32 = 709;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    Software,
    TrustedEnvironment,
    StrongBox,
}

impl SecurityLevel {
    fn from_asn1(value: u32) -> Result<Self, BerError> {
        match value {
            0 => Ok(Self::Software),
            1 => Ok(Self::TrustedEnvironment),
            2 => Ok(Self::StrongBox),
            _ => Err(BerError::BerValueError),
        }
    }

    pub fn is_hardware_backed(&self) -> bool {
        !matches!(self, Self::Software)
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Software => write!(f, "Software"),
            Self::TrustedEnvironment => write!(f, "TrustedEnvironment"),
            Self::StrongBox => write!(f, "StrongBox"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifiedBootState {
    Verified,
    SelfSigned,
    Unverified,
    Failed,
}

impl VerifiedBootState {
    fn from_asn1(value: u32) -> Result<Self, BerError> {
        match value {
            0 => Ok(Self::Verified),
            1 => Ok(Self::SelfSigned),
            2 => Ok(Self::Unverified),
            3 => Ok(Self::Failed),
            _ => Err(BerError::BerValueError),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootOfTrust {
    pub verified_boot_key: Vec<u8>,
    pub device_locked: bool,
    pub verified_boot_state: VerifiedBootState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub package_name: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationApplicationId {
    pub package_infos: Vec<PackageInfo>,
    pub signature_digests: Vec<Vec<u8>>,
}

/// The subset of a keymaster authorization list the policy looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationList {
    pub rollback_resistance: bool,
    pub root_of_trust: Option<RootOfTrust>,
    pub os_version: Option<u32>,
    pub os_patch_level: Option<u32>,
    pub attestation_application_id: Option<AttestationApplicationId>,
}

/// Decoded KeyDescription of an attested key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationRecord {
    pub attestation_version: u32,
    pub attestation_security_level: SecurityLevel,
    pub keymaster_version: u32,
    pub keymaster_security_level: SecurityLevel,
    pub attestation_challenge: Vec<u8>,
    pub software_enforced: AuthorizationList,
    pub tee_enforced: AuthorizationList,
}

impl AttestationRecord {
    /// The attestation application id, wherever the device chose to put it.
    pub fn application_id(&self) -> Option<&AttestationApplicationId> {
        self.software_enforced
            .attestation_application_id
            .as_ref()
            .or(self.tee_enforced.attestation_application_id.as_ref())
    }
}

/// Extracts the attestation record from a leaf certificate.
pub trait AttestationRecordSource: Send + Sync + fmt::Debug {
    fn extract(&self, leaf: &X509Ref) -> Result<AttestationRecord, AndroidCheckError>;
}

/// Reads the record from the KeyDescription extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyDescriptionExtension;

impl AttestationRecordSource for KeyDescriptionExtension {
    fn extract(&self, leaf: &X509Ref) -> Result<AttestationRecord, AndroidCheckError> {
        let der = leaf.to_der()?;
        let (_, cert) = x509_parser::parse_x509_certificate(&der)
            .map_err(|e| AndroidCheckError::MalformedRecord(format!("leaf certificate: {e}")))?;
        let extension = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == KEY_DESCRIPTION_OID)
            .ok_or_else(|| {
                AndroidCheckError::MalformedRecord("leaf has no KeyDescription extension".into())
            })?;
        let record = parse_key_description(extension.value).map_err(|e| {
            AndroidCheckError::MalformedRecord(format!("KeyDescription: {e}"))
        })?;
        debug!(
            attestation_version = record.attestation_version,
            attestation_security_level = %record.attestation_security_level,
            keymaster_security_level = %record.keymaster_security_level,
            "Parsed attestation record"
        );
        Ok(record)
    }
}

/// Parse the DER body of a KeyDescription extension.
pub fn parse_key_description(extension_data: &[u8]) -> Result<AttestationRecord, BerError> {
    let (_, parsed) = parse_der(extension_data)?;
    let key_description = parsed.as_sequence()?;
    if key_description.len() < 8 {
        return Err(BerError::InvalidLength);
    }

    Ok(AttestationRecord {
        attestation_version: key_description[0].as_u32()?,
        attestation_security_level: SecurityLevel::from_asn1(key_description[1].as_u32()?)?,
        keymaster_version: key_description[2].as_u32()?,
        keymaster_security_level: SecurityLevel::from_asn1(key_description[3].as_u32()?)?,
        attestation_challenge: key_description[4].as_slice()?.to_vec(),
        software_enforced: parse_authorization_list(&key_description[6])?,
        tee_enforced: parse_authorization_list(&key_description[7])?,
    })
}

/// Unwrap an explicitly tagged element into the object it carries.
fn explicit_inner<'a>(elem: &'a BerObject<'a>) -> Result<BerObject<'a>, BerError> {
    let raw = elem.content.as_slice()?;
    let (_, inner) = parse_der(raw)?;
    Ok(inner)
}

fn parse_authorization_list(list: &BerObject<'_>) -> Result<AuthorizationList, BerError> {
    let mut authorizations = AuthorizationList::default();
    for elem in list.as_sequence()? {
        match elem.tag().0 {
            TAG_ROLLBACK_RESISTANCE => authorizations.rollback_resistance = true,
            TAG_ROOT_OF_TRUST => {
                authorizations.root_of_trust = Some(parse_root_of_trust(&explicit_inner(elem)?)?);
            }
            TAG_OS_VERSION => authorizations.os_version = Some(explicit_inner(elem)?.as_u32()?),
            TAG_OS_PATCH_LEVEL => {
                authorizations.os_patch_level = Some(explicit_inner(elem)?.as_u32()?);
            }
            TAG_ATTESTATION_APPLICATION_ID => {
                let octets = explicit_inner(elem)?;
                let (_, app_id) = parse_der(octets.as_slice()?)?;
                authorizations.attestation_application_id =
                    Some(parse_application_id(&app_id)?);
            }
            _ => {}
        }
    }
    Ok(authorizations)
}

fn parse_root_of_trust(root: &BerObject<'_>) -> Result<RootOfTrust, BerError> {
    let fields = root.as_sequence()?;
    if fields.len() < 3 {
        return Err(BerError::InvalidLength);
    }
    Ok(RootOfTrust {
        verified_boot_key: fields[0].as_slice()?.to_vec(),
        device_locked: fields[1].as_bool()?,
        verified_boot_state: VerifiedBootState::from_asn1(fields[2].as_u32()?)?,
    })
}

fn parse_application_id(app_id: &BerObject<'_>) -> Result<AttestationApplicationId, BerError> {
    let fields = app_id.as_sequence()?;
    if fields.len() != 2 {
        return Err(BerError::InvalidLength);
    }
    let package_infos = fields[0]
        .as_set()?
        .iter()
        .map(|info| {
            let info = info.as_sequence()?;
            if info.len() != 2 {
                return Err(BerError::InvalidLength);
            }
            Ok(PackageInfo {
                package_name: std::str::from_utf8(info[0].as_slice()?)
                    .map_err(|_| BerError::StringInvalidCharset)?
                    .to_owned(),
                version: info[1].as_u64()?,
            })
        })
        .collect::<Result<Vec<_>, BerError>>()?;
    let signature_digests = fields[1]
        .as_set()?
        .iter()
        .map(|digest| digest.as_slice().map(<[u8]>::to_vec))
        .collect::<Result<Vec<_>, BerError>>()?;
    Ok(AttestationApplicationId {
        package_infos,
        signature_digests,
    })
}

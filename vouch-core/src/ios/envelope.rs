//! CBOR envelope of an App Attest statement and the values read straight off its leaf.

use base64::{engine::general_purpose::STANDARD, Engine};
use ciborium::Value;
use openssl::sha::sha256;
use openssl::x509::X509Ref;
use tracing::debug;
use x509_parser::der_parser::ber::BerObject;
use x509_parser::der_parser::parse_der;

use super::validator::AppAttestError;
use crate::version::ParsedVersions;

/// Apple extension carrying the attested OS version.
pub const OS_VERSION_OID: &str = "1.2.840.113635.100.8.7";

const OS_VERSION_TAG: u32 = 1400;
const BUILD_NUMBER_TAG: u32 = OS_VERSION_TAG + 3;

/// The parts of an attestation statement the engine needs before any validator runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementEnvelope {
    pub format: String,
    /// `attStmt.x5c`, leaf first.
    pub certificates: Vec<Vec<u8>>,
    pub receipt: Vec<u8>,
    pub authenticator_data: Vec<u8>,
}

pub(crate) fn entry<'v>(map: &'v [(Value, Value)], key: &str) -> Option<&'v Value> {
    map.iter()
        .find_map(|(k, v)| matches!(k, Value::Text(text) if text == key).then_some(v))
}

pub(crate) fn bytes_of(value: Option<&Value>, what: &str) -> Result<Vec<u8>, AppAttestError> {
    match value {
        Some(Value::Bytes(bytes)) => Ok(bytes.clone()),
        _ => Err(AppAttestError::InvalidFormat(format!("{what} is not a byte string"))),
    }
}

impl StatementEnvelope {
    pub fn parse(statement: &[u8]) -> Result<Self, AppAttestError> {
        let value: Value = ciborium::from_reader(statement)
            .map_err(|e| AppAttestError::InvalidFormat(format!("statement is not CBOR: {e}")))?;
        let Value::Map(root) = value else {
            return Err(AppAttestError::InvalidFormat("statement is not a CBOR map".into()));
        };

        let format = match entry(&root, "fmt") {
            Some(Value::Text(format)) => format.clone(),
            _ => return Err(AppAttestError::InvalidFormat("missing fmt".into())),
        };
        let Some(Value::Map(att_stmt)) = entry(&root, "attStmt") else {
            return Err(AppAttestError::InvalidFormat("missing attStmt".into()));
        };
        let certificates = match entry(att_stmt, "x5c") {
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .map(|item| bytes_of(Some(item), "x5c entry"))
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(AppAttestError::InvalidFormat("missing or empty x5c".into())),
        };
        let receipt = bytes_of(entry(att_stmt, "receipt"), "receipt")?;
        let authenticator_data = bytes_of(entry(&root, "authData"), "authData")?;

        Ok(Self {
            format,
            certificates,
            receipt,
            authenticator_data,
        })
    }

    pub fn leaf(&self) -> &[u8] {
        // parse() guarantees at least one certificate
        self.certificates.first().map_or(&[][..], Vec::as_slice)
    }

    /// Key identifier of the attested key.
    pub fn key_id(&self) -> Result<String, AppAttestError> {
        key_id_of(self.leaf())
    }
}

/// Base64 of the SHA-256 of the leaf's raw public key bit string.
pub fn key_id_of(leaf_der: &[u8]) -> Result<String, AppAttestError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf_der)
        .map_err(|e| AppAttestError::InvalidFormat(format!("leaf certificate: {e}")))?;
    let key = &cert.public_key().subject_public_key.data;
    Ok(STANDARD.encode(sha256(key)))
}

/// The OCTET STRING inside the explicitly tagged element `tag` of `sequence`.
pub(crate) fn tagged_bytes(sequence: &[BerObject<'_>], tag: u32) -> Option<Vec<u8>> {
    sequence
        .iter()
        .filter(|elem| elem.tag().0 == tag)
        .find_map(|elem| {
            let raw = elem.content.as_slice().ok()?;
            let (_, inner) = parse_der(raw).ok()?;
            let octets = inner.as_slice().ok()?;
            (!octets.is_empty()).then(|| octets.to_vec())
        })
}

fn tagged_octets(sequence: &[BerObject<'_>], tag: u32) -> Option<String> {
    tagged_bytes(sequence, tag).map(|octets| String::from_utf8_lossy(&octets).into_owned())
}

/// Read the attested iOS version and build number. Unparseable halves are left empty.
pub fn parse_os_versions(certificate: &X509Ref) -> ParsedVersions {
    let Ok(der) = certificate.to_der() else {
        return ParsedVersions::default();
    };
    let Ok((_, cert)) = x509_parser::parse_x509_certificate(&der) else {
        return ParsedVersions::default();
    };
    let Some(extension) = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == OS_VERSION_OID)
    else {
        return ParsedVersions::default();
    };
    let Ok((_, parsed)) = parse_der(extension.value) else {
        return ParsedVersions::default();
    };
    let Ok(sequence) = parsed.as_sequence() else {
        return ParsedVersions::default();
    };

    let versions = ParsedVersions {
        sem_ver: tagged_octets(sequence, OS_VERSION_TAG).and_then(|s| s.parse().ok()),
        build_number: tagged_octets(sequence, BUILD_NUMBER_TAG).and_then(|s| s.parse().ok()),
    };
    debug!(
        sem_ver = ?versions.sem_ver.as_ref().map(ToString::to_string),
        build_number = ?versions.build_number.as_ref().map(ToString::to_string),
        "Parsed attested iOS version"
    );
    versions
}

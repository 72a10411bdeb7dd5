//! Apple's attestation receipt: a PKCS #7 signed SET of typed fields.
//!
//! Each field is `SEQUENCE { type INTEGER, version INTEGER, value OCTET STRING }`. Times are
//! RFC 3339 strings.

use chrono::{DateTime, Utc};
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::X509;
use tracing::debug;
use x509_parser::der_parser::error::BerError;
use x509_parser::der_parser::parse_ber;

use super::native::trust_store;
use super::validator::{AppAttestError, ReceiptError};

const APP_ID: u32 = 2;
const ATTESTED_CERTIFICATE: u32 = 3;
const RECEIPT_TYPE: u32 = 6;
const CREATION_TIME: u32 = 12;
const RISK_METRIC: u32 = 17;
const NOT_BEFORE: u32 = 19;
const EXPIRATION_TIME: u32 = 21;

/// Receipt type of a receipt handed out with an attestation statement.
pub const ATTEST_RECEIPT_TYPE: &str = "ATTEST";

/// Decoded receipt fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptPayload {
    pub app_id: String,
    /// DER of the credential certificate the receipt was issued for.
    pub attested_certificate: Vec<u8>,
    pub receipt_type: String,
    pub creation_time: DateTime<Utc>,
    pub risk_metric: Option<u32>,
    pub not_before: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
}

fn malformed(message: impl Into<String>) -> ReceiptError {
    ReceiptError::Malformed(message.into())
}

fn text(value: &[u8], what: &str) -> Result<String, ReceiptError> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| malformed(format!("{what} is not UTF-8")))
}

fn time(value: &[u8], what: &str) -> Result<DateTime<Utc>, ReceiptError> {
    let raw = text(value, what)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| malformed(format!("{what} `{raw}`: {e}")))
}

impl ReceiptPayload {
    /// Parse the signed content of a receipt. Unknown field types are skipped.
    pub fn parse(payload: &[u8]) -> Result<Self, ReceiptError> {
        let ber = |e: BerError| malformed(format!("receipt payload: {e}"));
        let (_, parsed) = parse_ber(payload).map_err(|e| malformed(format!("receipt payload: {e}")))?;

        let mut app_id = None;
        let mut attested_certificate = None;
        let mut receipt_type = None;
        let mut creation_time = None;
        let mut risk_metric = None;
        let mut not_before = None;
        let mut expiration_time = None;
        for field in parsed.as_set().map_err(ber)? {
            let parts = field.as_sequence().map_err(ber)?;
            let [kind, _version, value] = parts.as_slice() else {
                return Err(malformed("receipt field is not a triple"));
            };
            let value = value.as_slice().map_err(ber)?;
            match kind.as_u32().map_err(ber)? {
                APP_ID => app_id = Some(text(value, "app id")?),
                ATTESTED_CERTIFICATE => attested_certificate = Some(value.to_vec()),
                RECEIPT_TYPE => receipt_type = Some(text(value, "receipt type")?),
                CREATION_TIME => creation_time = Some(time(value, "creation time")?),
                RISK_METRIC => risk_metric = text(value, "risk metric")?.parse().ok(),
                NOT_BEFORE => not_before = Some(time(value, "not before")?),
                EXPIRATION_TIME => expiration_time = Some(time(value, "expiration time")?),
                _ => {}
            }
        }

        Ok(Self {
            app_id: app_id.ok_or_else(|| malformed("receipt has no app id"))?,
            attested_certificate: attested_certificate
                .ok_or_else(|| malformed("receipt has no attested certificate"))?,
            receipt_type: receipt_type.ok_or_else(|| malformed("receipt has no type"))?,
            creation_time: creation_time.ok_or_else(|| malformed("receipt has no creation time"))?,
            risk_metric,
            not_before,
            expiration_time,
        })
    }
}

/// Check the receipt signature chains to `root` and return its fields.
pub fn open_receipt(receipt: &[u8], root: &X509) -> Result<ReceiptPayload, AppAttestError> {
    let pkcs7 = Pkcs7::from_der(receipt).map_err(|e| {
        AppAttestError::receipt("unreadable receipt", malformed(e.to_string()))
    })?;
    let store = trust_store(root)?;
    let extra_certificates = Stack::<X509>::new()?;
    let mut payload = Vec::new();
    pkcs7
        .verify(
            &extra_certificates,
            &store,
            None,
            Some(&mut payload),
            Pkcs7Flags::BINARY,
        )
        .map_err(|e| {
            AppAttestError::receipt(
                "receipt signature rejected",
                ReceiptError::InvalidSignature(e.to_string()),
            )
        })?;

    let parsed = ReceiptPayload::parse(&payload)
        .map_err(|e| AppAttestError::receipt("unreadable receipt payload", e))?;
    debug!(
        app_id = %parsed.app_id,
        receipt_type = %parsed.receipt_type,
        creation_time = %parsed.creation_time,
        "Receipt signature verified"
    );
    Ok(parsed)
}

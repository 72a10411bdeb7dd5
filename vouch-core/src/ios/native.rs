//! Built-in App Attest validator on openssl.
//!
//! A statement is accepted when its certificate path ends in the App Attest root, the
//! credential certificate's nonce binds the authenticator data to the challenge, the key id
//! matches the credential key, the authenticator data names this app and environment, and the
//! receipt is signed under Apple's receipt root for the same app and credential.

use chrono::{DateTime, Utc};
use ciborium::Value;
use openssl::asn1::Asn1Time;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKeyRef, Public};
use openssl::sha::{sha256, Sha256};
use openssl::sign::Verifier;
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509StoreContext, X509};
use std::cmp::Ordering;
use tracing::{debug, instrument};
use x509_parser::der_parser::parse_der;

use super::envelope::{bytes_of, entry, key_id_of, tagged_bytes, StatementEnvelope};
use super::receipt::{open_receipt, ATTEST_RECEIPT_TYPE};
use super::validator::{
    AppAttestError, AppAttestValidator, AppAttestValidatorFactory, Assertion,
    AuthenticatorDataIssue, CertPathError, CertPathReason, Receipt, ReceiptError,
    ReceiptPayloadIssue, ValidatedAttestation, ValidatorContext,
};
use super::IosAppData;
use crate::error::{AttestationError, Platform, Result};

/// Apple App Attestation Root CA.
pub const APP_ATTEST_ROOT_CA: &str = "-----BEGIN CERTIFICATE-----
MIICITCCAaegAwIBAgIQC/O+DvHN0uD7jG5yH2IXmDAKBggqhkjOPQQDAzBSMSYw
JAYDVQQDDB1BcHBsZSBBcHAgQXR0ZXN0YXRpb24gUm9vdCBDQTETMBEGA1UECgwK
QXBwbGUgSW5jLjETMBEGA1UECAwKQ2FsaWZvcm5pYTAeFw0yMDAzMTgxODMyNTNa
Fw00NTAzMTUwMDAwMDBaMFIxJjAkBgNVBAMMHUFwcGxlIEFwcCBBdHRlc3RhdGlv
biBSb290IENBMRMwEQYDVQQKDApBcHBsZSBJbmMuMRMwEQYDVQQIDApDYWxpZm9y
bmlhMHYwEAYHKoZIzj0CAQYFK4EEACIDYgAERTHhmLW07ATaFQIEVwTtT4dyctdh
NbJhFs/Ii2FdCgAHGbpphY3+d8qjuDngIN3WVhQUBHAoMeQ/cLiP1sOUtgjqK9au
Yen1mMEvRq9Sk3Jm5X8U62H+xTD3FE9TgS41o0IwQDAPBgNVHRMBAf8EBTADAQH/
MB0GA1UdDgQWBBSskRBTM72+aEH/pwyp5frq5eWKoTAOBgNVHQ8BAf8EBAMCAQYw
CgYIKoZIzj0EAwMDaAAwZQIwQgFGnByvsiVbpTKwSga0kP0e8EeDS4+sQmTvb7vn
53O5+FRXgeLhpJ06ysC5PrOyAjEAp5U4xDgEgllF7En3VcE3iexZZtKeYnpqtijV
oyFraWVIyd/dganmrduC1bmTBGwD
-----END CERTIFICATE-----
";

/// Apple Root CA - G3, which signs App Attest receipts.
pub const APPLE_ROOT_CA_G3: &str = "-----BEGIN CERTIFICATE-----
MIICQzCCAcmgAwIBAgIILcX8iNLFS5UwCgYIKoZIzj0EAwMwZzEbMBkGA1UEAwwS
QXBwbGUgUm9vdCBDQSAtIEczMSYwJAYDVQQLDB1BcHBsZSBDZXJ0aWZpY2F0aW9u
IEF1dGhvcml0eTETMBEGA1UECgwKQXBwbGUgSW5jLjELMAkGA1UEBhMCVVMwHhcN
MTQwNDMwMTgxOTA2WhcNMzkwNDMwMTgxOTA2WjBnMRswGQYDVQQDDBJBcHBsZSBS
b290IENBIC0gRzMxJjAkBgNVBAsMHUFwcGxlIENlcnRpZmljYXRpb24gQXV0aG9y
aXR5MRMwEQYDVQQKDApBcHBsZSBJbmMuMQswCQYDVQQGEwJVUzB2MBAGByqGSM49
AgEGBSuBBAAiA2IABJjpLz1AcqTtkyJygRMc3RCV8cWjTnHcFBbZDuWmBSp3ZHtf
TjjTuxxEtX/1H7YyYl3J6YRbTzBPEVoA/VhYDKX1DyxNB0cTddqXl5dvMVztK517
IDvYuVTZXpmkOlEKMaNCMEAwHQYDVR0OBBYEFLuw3qFYM4iapIqZ3r6966/ayySr
MA8GA1UdEwEB/wQFMAMBAf8wDgYDVR0PAQH/BAQDAgEGMAoGCCqGSM49BAMDA2gA
MGUCMQCD6cHEFl4aXTQY2e3v9GwOAEZLuN+yRhHFD/3meoyhpmvOwgPUnPWTxnS4
at+qIxUCMG1mihDK1A3UT82NQz60imOlM27jbdoXt2QfyFMm+YhidDkLF1vLUagM
6BgD56KyKA==
-----END CERTIFICATE-----
";

/// Credential certificate extension holding the attestation nonce.
pub const NONCE_OID: &str = "1.2.840.113635.100.8.2";
const NONCE_TAG: u32 = 1;

pub const AAGUID_PRODUCTION: &[u8; 16] = b"appattest\0\0\0\0\0\0\0";
pub const AAGUID_DEVELOPMENT: &[u8; 16] = b"appattestdevelop";

const STATEMENT_FORMAT: &str = "apple-appattest";
const FLAG_ATTESTED_CREDENTIAL: u8 = 0x40;

/// Store trusting only `root`. Validity is checked against the injected clock instead.
pub(crate) fn trust_store(root: &X509) -> std::result::Result<X509Store, ErrorStack> {
    let mut builder = X509StoreBuilder::new()?;
    builder.add_cert(root.clone())?;
    builder.set_flags(X509VerifyFlags::NO_CHECK_TIME)?;
    Ok(builder.build())
}

/// Parsed WebAuthn-style authenticator data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: u8,
    pub sign_count: u32,
    pub aaguid: Option<[u8; 16]>,
    pub credential_id: Option<Vec<u8>>,
}

fn auth_data_error(message: impl Into<String>) -> AppAttestError {
    AppAttestError::InvalidAuthenticatorData {
        issue: AuthenticatorDataIssue::Other,
        message: message.into(),
    }
}

impl AuthenticatorData {
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, AppAttestError> {
        if bytes.len() < 37 {
            return Err(auth_data_error(format!(
                "authenticator data is {} bytes, expected at least 37",
                bytes.len()
            )));
        }
        let rp_id_hash: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| auth_data_error("rp id hash"))?;
        let flags = bytes[32];
        let sign_count = u32::from_be_bytes([bytes[33], bytes[34], bytes[35], bytes[36]]);

        let (aaguid, credential_id) = if flags & FLAG_ATTESTED_CREDENTIAL != 0 {
            if bytes.len() < 55 {
                return Err(auth_data_error("attested credential data truncated"));
            }
            let aaguid: [u8; 16] = bytes[37..53]
                .try_into()
                .map_err(|_| auth_data_error("aaguid"))?;
            let id_len = usize::from(u16::from_be_bytes([bytes[53], bytes[54]]));
            let credential_id = bytes
                .get(55..55 + id_len)
                .ok_or_else(|| auth_data_error("credential id truncated"))?;
            (Some(aaguid), Some(credential_id.to_vec()))
        } else {
            (None, None)
        };

        Ok(Self {
            rp_id_hash,
            flags,
            sign_count,
            aaguid,
            credential_id,
        })
    }

    fn verify_app_id(&self, app_id: &str) -> std::result::Result<(), AppAttestError> {
        if self.rp_id_hash != sha256(app_id.as_bytes()) {
            return Err(AppAttestError::InvalidAuthenticatorData {
                issue: AuthenticatorDataIssue::AppIdMismatch,
                message: format!("RP ID hash is not the hash of {app_id}"),
            });
        }
        Ok(())
    }
}

/// `SHA-256(authenticatorData || SHA-256(clientData))`.
fn nonce_of(authenticator_data: &[u8], client_data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(authenticator_data);
    hasher.update(&sha256(client_data));
    hasher.finish()
}

fn credential_nonce(leaf_der: &[u8]) -> std::result::Result<Vec<u8>, AppAttestError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf_der)
        .map_err(|e| AppAttestError::InvalidFormat(format!("credential certificate: {e}")))?;
    let extension = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == NONCE_OID)
        .ok_or_else(|| AppAttestError::InvalidNonce("credential certificate has no nonce".into()))?;
    let (_, parsed) = parse_der(extension.value)
        .map_err(|e| AppAttestError::InvalidNonce(format!("nonce extension: {e}")))?;
    let sequence = parsed
        .as_sequence()
        .map_err(|e| AppAttestError::InvalidNonce(format!("nonce extension: {e}")))?;
    tagged_bytes(sequence, NONCE_TAG)
        .ok_or_else(|| AppAttestError::InvalidNonce("nonce extension is empty".into()))
}

fn path_error(reason: CertPathReason, message: impl Into<String>) -> AppAttestError {
    AppAttestError::chain(
        "credential certificate path invalid",
        CertPathError {
            reason,
            message: message.into(),
        },
    )
}

/// Validate `certificates` (credential first) up to `root`, then each validity window at `at`.
fn verify_path(
    certificates: &[X509],
    root: &X509,
    at: DateTime<Utc>,
) -> std::result::Result<(), AppAttestError> {
    let Some((credential, intermediates)) = certificates.split_first() else {
        return Err(path_error(CertPathReason::Other, "no certificates"));
    };
    let store = trust_store(root)?;
    let mut untrusted = Stack::new()?;
    for certificate in intermediates {
        untrusted.push(certificate.clone())?;
    }
    let mut context = X509StoreContext::new()?;
    let failure = context.init(&store, credential, &untrusted, |ctx| {
        Ok(if ctx.verify_cert()? { None } else { Some(ctx.error()) })
    })?;
    if let Some(failure) = failure {
        return Err(path_error(
            CertPathReason::UntrustedRoot,
            failure.error_string(),
        ));
    }

    let instant = Asn1Time::from_unix(at.timestamp())?;
    for (index, certificate) in certificates.iter().enumerate() {
        if certificate.not_before().compare(&instant)? == Ordering::Greater {
            return Err(path_error(
                CertPathReason::NotYetValid,
                format!("certificate {index} is not yet valid at {at}"),
            ));
        }
        if certificate.not_after().compare(&instant)? == Ordering::Less {
            return Err(path_error(
                CertPathReason::Expired,
                format!("certificate {index} expired before {at}"),
            ));
        }
    }
    Ok(())
}

fn payload_error(issue: ReceiptPayloadIssue, message: impl Into<String>) -> AppAttestError {
    AppAttestError::receipt(
        "receipt rejected",
        ReceiptError::InvalidPayload {
            issue,
            message: message.into(),
        },
    )
}

/// Validator for one app, trusting the given roots.
#[derive(Debug)]
pub struct AppleValidator {
    app: IosAppData,
    context: ValidatorContext,
    attestation_root: X509,
    receipt_root: X509,
}

impl AppleValidator {
    fn expected_aaguid(&self) -> &'static [u8; 16] {
        if self.app.sandbox {
            AAGUID_DEVELOPMENT
        } else {
            AAGUID_PRODUCTION
        }
    }

    fn check_receipt(
        &self,
        receipt: &[u8],
        credential_der: &[u8],
        now: DateTime<Utc>,
    ) -> std::result::Result<Receipt, AppAttestError> {
        let payload = open_receipt(receipt, &self.receipt_root)?;
        let app_id = self.app.app_id();
        if payload.app_id != app_id {
            return Err(payload_error(
                ReceiptPayloadIssue::AppIdMismatch,
                format!("receipt issued for {}", payload.app_id),
            ));
        }
        if payload.attested_certificate != credential_der {
            return Err(payload_error(
                ReceiptPayloadIssue::Other,
                "receipt was issued for another credential certificate",
            ));
        }
        if payload.receipt_type != ATTEST_RECEIPT_TYPE {
            return Err(payload_error(
                ReceiptPayloadIssue::Other,
                format!("receipt type {}", payload.receipt_type),
            ));
        }
        if payload.creation_time > now {
            return Err(payload_error(
                ReceiptPayloadIssue::CreationTimeAfter,
                format!("receipt created at {} after {now}", payload.creation_time),
            ));
        }
        if payload.creation_time < now - self.context.receipt_max_age {
            return Err(payload_error(
                ReceiptPayloadIssue::TooOld,
                format!(
                    "receipt created at {} is older than {}s",
                    payload.creation_time,
                    self.context.receipt_max_age.num_seconds()
                ),
            ));
        }
        Ok(Receipt {
            app_id: payload.app_id,
            creation_time: payload.creation_time,
            not_before: payload.not_before,
            expiration_time: payload.expiration_time,
            risk_metric: payload.risk_metric,
        })
    }
}

impl AppAttestValidator for AppleValidator {
    fn app(&self) -> &IosAppData {
        &self.app
    }

    #[instrument(level = "debug", skip_all, fields(app_id = %self.app.app_id(), %key_id))]
    fn validate_attestation(
        &self,
        statement: &[u8],
        key_id: &str,
        challenge: &[u8],
    ) -> std::result::Result<ValidatedAttestation, AppAttestError> {
        let envelope = StatementEnvelope::parse(statement)?;
        if envelope.format != STATEMENT_FORMAT {
            return Err(AppAttestError::InvalidFormat(format!(
                "unexpected statement format {}",
                envelope.format
            )));
        }
        let certificates = envelope
            .certificates
            .iter()
            .map(|der| X509::from_der(der))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppAttestError::InvalidFormat(format!("x5c: {e}")))?;
        let now = self.context.clock.now();
        verify_path(&certificates, &self.attestation_root, now)?;

        let auth_data = AuthenticatorData::parse(&envelope.authenticator_data)?;
        if credential_nonce(envelope.leaf())? != nonce_of(&envelope.authenticator_data, challenge) {
            return Err(AppAttestError::InvalidNonce(
                "credential nonce does not match authenticator data and challenge".into(),
            ));
        }
        let credential_key_id = key_id_of(envelope.leaf())?;
        if credential_key_id != key_id {
            return Err(AppAttestError::InvalidPublicKey(
                "credential key does not hash to the key id".into(),
            ));
        }
        auth_data.verify_app_id(&self.app.app_id())?;
        if auth_data.sign_count != 0 {
            return Err(auth_data_error(format!(
                "attestation counter is {}, expected 0",
                auth_data.sign_count
            )));
        }
        if auth_data.aaguid.as_ref() != Some(self.expected_aaguid()) {
            return Err(AppAttestError::InvalidAuthenticatorData {
                issue: AuthenticatorDataIssue::AaguidMismatch,
                message: format!(
                    "AAGUID does not match the {} environment",
                    if self.app.sandbox { "development" } else { "production" }
                ),
            });
        }
        let credential_id = auth_data.credential_id.as_deref().unwrap_or_default();
        if credential_key_id != base64_of(credential_id) {
            return Err(AppAttestError::InvalidPublicKey(
                "credential id is not the key id".into(),
            ));
        }

        let receipt = self.check_receipt(&envelope.receipt, envelope.leaf(), now)?;
        debug!(creation_time = %receipt.creation_time, "App Attest statement valid");
        let certificate = certificates
            .into_iter()
            .next()
            .ok_or_else(|| AppAttestError::InvalidFormat("missing credential certificate".into()))?;
        Ok(ValidatedAttestation {
            certificate,
            receipt,
            authenticator_data: envelope.authenticator_data,
        })
    }

    /// Assertions sign client data only; the challenge was bound by the statement.
    fn validate_assertion(
        &self,
        assertion: &[u8],
        client_data: &[u8],
        attested_key: &PKeyRef<Public>,
        last_counter: u32,
        _challenge: &[u8],
    ) -> std::result::Result<Assertion, AppAttestError> {
        let value: Value = ciborium::from_reader(assertion)
            .map_err(|e| AppAttestError::InvalidAssertion(format!("assertion is not CBOR: {e}")))?;
        let Value::Map(map) = value else {
            return Err(AppAttestError::InvalidAssertion("assertion is not a CBOR map".into()));
        };
        let signature = bytes_of(entry(&map, "signature"), "signature")?;
        let authenticator_data = bytes_of(entry(&map, "authenticatorData"), "authenticatorData")?;

        let auth_data = AuthenticatorData::parse(&authenticator_data)?;
        auth_data.verify_app_id(&self.app.app_id())?;
        if auth_data.sign_count <= last_counter {
            return Err(AppAttestError::InvalidAssertion(format!(
                "counter {} did not increase past {last_counter}",
                auth_data.sign_count
            )));
        }
        let mut verifier = Verifier::new(MessageDigest::sha256(), attested_key)?;
        verifier.update(&nonce_of(&authenticator_data, client_data))?;
        if !verifier.verify(&signature).unwrap_or(false) {
            return Err(AppAttestError::InvalidAssertion("signature does not verify".into()));
        }
        Ok(Assertion {
            sign_count: auth_data.sign_count,
            authenticator_data,
            signature,
        })
    }
}

fn base64_of(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(bytes)
}

/// Creates [`AppleValidator`]s. Trusts Apple's production roots unless told otherwise.
#[derive(Debug, Clone)]
pub struct AppleValidatorFactory {
    attestation_root: X509,
    receipt_root: X509,
}

impl AppleValidatorFactory {
    pub fn new() -> Result<Self> {
        let parse = |pem: &str, what: &str| {
            X509::from_pem(pem.as_bytes()).map_err(|e| {
                AttestationError::configuration_caused_by(
                    Platform::Ios,
                    format!("{what} is not a certificate"),
                    e,
                )
            })
        };
        Ok(Self::with_roots(
            parse(APP_ATTEST_ROOT_CA, "App Attest root")?,
            parse(APPLE_ROOT_CA_G3, "receipt root")?,
        ))
    }

    pub fn with_roots(attestation_root: X509, receipt_root: X509) -> Self {
        Self {
            attestation_root,
            receipt_root,
        }
    }
}

impl AppAttestValidatorFactory for AppleValidatorFactory {
    fn create(
        &self,
        app: &IosAppData,
        context: &ValidatorContext,
    ) -> Result<Box<dyn AppAttestValidator>> {
        Ok(Box::new(AppleValidator {
            app: app.clone(),
            context: context.clone(),
            attestation_root: self.attestation_root.clone(),
            receipt_root: self.receipt_root.clone(),
        }))
    }
}

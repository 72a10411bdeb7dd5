//! Key attestation: binding a verified proof to one specific public key.
//!
//! Android attests the leaf key directly. On iOS the key has to be signed as client data of an
//! assertion, and the app may have encoded it either as DER or as a raw X9.63 point. Each
//! encoding is tried in a fixed order until one verifies.

use std::ops::ControlFlow;

use openssl::bn::BigNumContext;
use openssl::ec::{EcGroup, EcKey, EcPoint, PointConversionForm};
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Public};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::dispatcher::AttestationService;
use crate::error::{AndroidReason, AttestationError, Cause};
use crate::result::{AttestationResult, KeyAttestation};

#[derive(Debug, Error)]
pub enum KeyEncodingError {
    #[error("{0} encoding needs an EC key")]
    NotEc(KeyEncoding),

    #[error("no supported curve has {0}-byte points")]
    UnknownPointLength(usize),

    #[error(transparent)]
    OpenSsl(#[from] ErrorStack),
}

/// Ways a client may have serialised the key it wants attested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyEncoding {
    /// DER SubjectPublicKeyInfo.
    Der,
    /// Uncompressed ANSI X9.63 point, as iOS `SecKeyCopyExternalRepresentation` produces.
    IosNative,
}

impl KeyEncoding {
    /// Order in which encodings are tried. DER first: it is what Android attests and what most
    /// clients send.
    pub const ORDER: [KeyEncoding; 2] = [KeyEncoding::Der, KeyEncoding::IosNative];

    pub fn encode(&self, key: &PKeyRef<Public>) -> Result<Vec<u8>, KeyEncodingError> {
        match self {
            Self::Der => Ok(key.public_key_to_der()?),
            Self::IosNative => {
                let ec = key.ec_key().map_err(|_| KeyEncodingError::NotEc(*self))?;
                let mut ctx = BigNumContext::new()?;
                Ok(ec
                    .public_key()
                    .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)?)
            }
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<PKey<Public>, KeyEncodingError> {
        match self {
            Self::Der => Ok(PKey::public_key_from_der(bytes)?),
            Self::IosNative => {
                let group = EcGroup::from_curve_name(curve_for_point(bytes.len())?)?;
                let mut ctx = BigNumContext::new()?;
                let point = EcPoint::from_bytes(&group, bytes, &mut ctx)?;
                Ok(PKey::from_ec_key(EcKey::from_public_key(&group, &point)?)?)
            }
        }
    }
}

impl std::fmt::Display for KeyEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Der => f.write_str("DER"),
            Self::IosNative => f.write_str("X9.63"),
        }
    }
}

fn curve_for_point(len: usize) -> Result<Nid, KeyEncodingError> {
    match len {
        33 | 65 => Ok(Nid::X9_62_PRIME256V1),
        49 | 97 => Ok(Nid::SECP384R1),
        67 | 133 => Ok(Nid::SECP521R1),
        other => Err(KeyEncodingError::UnknownPointLength(other)),
    }
}

/// Decode a public key given in any supported encoding.
pub fn decode_public_key(bytes: &[u8]) -> Result<PKey<Public>, KeyEncodingError> {
    KeyEncoding::Der
        .decode(bytes)
        .or_else(|_| KeyEncoding::IosNative.decode(bytes))
}

/// Verifies a proof once per key encoding and binds the first positive result to the key.
#[derive(Debug)]
pub struct KeyBindingResolver<'a, S: AttestationService + ?Sized> {
    service: &'a S,
}

impl<'a, S: AttestationService + ?Sized> KeyBindingResolver<'a, S> {
    pub fn new(service: &'a S) -> Self {
        Self { service }
    }

    /// If every encoding fails, the last failure is reported: later encodings are the more
    /// iOS specific ones.
    #[instrument(level = "debug", skip_all, fields(proof_len = proof.len()))]
    pub fn resolve(
        &self,
        proof: &[Vec<u8>],
        challenge: &[u8],
        key: &PKeyRef<Public>,
    ) -> KeyAttestation<PKey<Public>> {
        let outcome = KeyEncoding::ORDER
            .iter()
            .try_fold(None, |last_error, encoding| {
                let encoded = match encoding.encode(key) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        debug!(%encoding, error = %e, "Key encoding not applicable");
                        return ControlFlow::Continue(last_error);
                    }
                };
                let result = self
                    .service
                    .verify_attestation(proof, challenge, Some(&encoded));
                if result.is_error() {
                    debug!(%encoding, "Key attestation failed with this encoding");
                    ControlFlow::Continue(Some(result))
                } else {
                    debug!(%encoding, "Key attested");
                    ControlFlow::Break(result)
                }
            });

        match outcome {
            ControlFlow::Break(result) => bind(key, result),
            ControlFlow::Continue(Some(error)) => KeyAttestation::failure(error),
            ControlFlow::Continue(None) => KeyAttestation::failure(AttestationResult::failed(
                AttestationError::unknown_content("key to be attested could not be encoded", None),
            )),
        }
    }
}

/// An Android result must attest exactly `key` in its leaf.
fn bind(key: &PKeyRef<Public>, result: AttestationResult) -> KeyAttestation<PKey<Public>> {
    if let Some(leaf) = result.android_leaf() {
        let expected = key.public_key_to_der();
        let attested = leaf.public_key().and_then(|k| k.public_key_to_der());
        let matches = matches!((&expected, &attested), (Ok(a), Ok(b)) if a == b);
        if !matches {
            let cause = attested.err().or(expected.err()).map(Cause::new);
            return KeyAttestation::failure(AttestationResult::failed(
                AttestationError::android_content(
                    AndroidReason::AppUnexpected,
                    "key to be attested does not match the key of the attestation certificate",
                    cause,
                ),
            ));
        }
    }
    KeyAttestation::success(key.to_owned(), result)
}

//! Certificate chain validation for Android attestation chains.
//!
//! Android chains are short and carry no usable revocation or policy information, so the chain
//! is walked explicitly: every certificate must be signed by its successor, the last one must
//! carry a configured trust anchor key, and every certificate must be valid at the
//! verification instant. A certificate may appear only once, and the leaf must be an end-entity
//! certificate. Trust failures are reported before time failures.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::x509::{X509Ref, X509VerifyResult, X509};
use tracing::debug;

use super::checker::{AndroidCheckError, CertificateInvalidReason};

/// Public keys of the certificates a chain may end in, as DER SubjectPublicKeyInfo.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    keys: Vec<Vec<u8>>,
}

impl TrustAnchors {
    pub fn from_certificates(certificates: &[Vec<u8>]) -> Result<Self, AndroidCheckError> {
        let keys = certificates
            .iter()
            .map(|der| Ok(X509::from_der(der)?.public_key()?.public_key_to_der()?))
            .collect::<Result<Vec<_>, AndroidCheckError>>()?;
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn contains_key_of(&self, certificate: &X509Ref) -> Result<bool, AndroidCheckError> {
        let key = certificate.public_key()?.public_key_to_der()?;
        Ok(self.keys.iter().any(|anchor| *anchor == key))
    }
}

/// Validate `chain` (leaf first) against `anchors` at instant `at`.
pub fn verify_chain(
    chain: &[X509],
    anchors: &TrustAnchors,
    at: DateTime<Utc>,
    ignore_leaf_validity: bool,
) -> Result<(), AndroidCheckError> {
    let (leaf, root) = match chain {
        [] => {
            return Err(AndroidCheckError::invalid_certificate(
                CertificateInvalidReason::Trust,
                "empty chain",
            ))
        }
        [only] => (only, only),
        [leaf, .., root] => (leaf, root),
    };

    let mut seen = HashSet::with_capacity(chain.len());
    for (index, certificate) in chain.iter().enumerate() {
        if !seen.insert(certificate.to_der()?) {
            return Err(AndroidCheckError::invalid_certificate(
                CertificateInvalidReason::Trust,
                format!("certificate {index} appears more than once"),
            ));
        }
    }
    check_end_entity(leaf)?;

    for (index, pair) in chain.windows(2).enumerate() {
        let (child, parent) = (&pair[0], &pair[1]);
        if parent.issued(child) != X509VerifyResult::OK {
            return Err(AndroidCheckError::invalid_certificate(
                CertificateInvalidReason::Trust,
                format!("certificate {index} was not issued by certificate {}", index + 1),
            ));
        }
        if !child.verify(&*parent.public_key()?)? {
            return Err(AndroidCheckError::invalid_certificate(
                CertificateInvalidReason::Trust,
                format!("signature of certificate {index} does not verify"),
            ));
        }
    }

    if !anchors.contains_key_of(root)? {
        return Err(AndroidCheckError::invalid_certificate(
            CertificateInvalidReason::Trust,
            "chain is not rooted in a configured trust anchor",
        ));
    }

    let instant = Asn1Time::from_unix(at.timestamp())?;
    for (index, certificate) in chain.iter().enumerate() {
        if index == 0 && ignore_leaf_validity {
            continue;
        }
        if certificate.not_before().compare(&instant)? == Ordering::Greater {
            return Err(AndroidCheckError::invalid_certificate(
                CertificateInvalidReason::Time,
                format!("certificate {index} is not yet valid at {at}"),
            ));
        }
        if certificate.not_after().compare(&instant)? == Ordering::Less {
            return Err(AndroidCheckError::invalid_certificate(
                CertificateInvalidReason::Time,
                format!("certificate {index} expired before {at}"),
            ));
        }
    }

    debug!(chain_len = chain.len(), %at, "Certificate chain valid");
    Ok(())
}

/// A leaf that is a CA or signed by its own key is a chain slice, not an attested key.
fn check_end_entity(leaf: &X509Ref) -> Result<(), AndroidCheckError> {
    let der = leaf.to_der()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&der).map_err(|e| {
        AndroidCheckError::invalid_certificate(CertificateInvalidReason::Trust, format!("leaf: {e}"))
    })?;
    if parsed.is_ca() {
        return Err(AndroidCheckError::invalid_certificate(
            CertificateInvalidReason::Trust,
            "leaf certificate is a certificate authority",
        ));
    }
    if leaf.issued(leaf) == X509VerifyResult::OK && leaf.verify(&*leaf.public_key()?)? {
        return Err(AndroidCheckError::invalid_certificate(
            CertificateInvalidReason::Trust,
            "leaf certificate is self-signed",
        ));
    }
    Ok(())
}

//! Maps collaborator errors onto the closed [`AttestationError`] taxonomy.
//!
//! Mapping is total: anything that is not recognised becomes a content failure with reason
//! `APP_UNEXPECTED` for the platform at hand. The original error is kept as the cause.

use std::error::Error as StdError;

use tracing::debug;

use crate::android::{AndroidCheckError, CertificateInvalidReason};
use crate::error::{AndroidReason, AttestationError, Cause, IosReason, Platform};
use crate::ios::{
    AppAttestError, AuthenticatorDataIssue, CertPathError, CertPathReason, ReceiptError,
    ReceiptPayloadIssue,
};

/// Classify an Android checker failure.
pub fn classify_android(error: AndroidCheckError) -> AttestationError {
    let message = error.to_string();
    let classified = match &error {
        AndroidCheckError::CertificateInvalid {
            reason: CertificateInvalidReason::Time,
            ..
        } => AttestationError::certificate_time(Platform::Android, message, None),
        AndroidCheckError::CertificateInvalid {
            reason: CertificateInvalidReason::Trust,
            ..
        }
        | AndroidCheckError::Certificate(_) => {
            AttestationError::certificate_trust(Platform::Android, message, None)
        }
        AndroidCheckError::AttestationValue { reason, .. } => {
            AttestationError::android_content(*reason, message, None)
        }
        AndroidCheckError::MalformedRecord(_) => {
            AttestationError::android_content(AndroidReason::AppUnexpected, message, None)
        }
    };
    with_cause(classified, error)
}

/// Walk `error` and its sources looking for a `T`.
fn find_in_chain<'e, T: StdError + 'static>(
    error: Option<&'e (dyn StdError + 'static)>,
) -> Option<&'e T> {
    std::iter::successors(error, |&e| e.source()).find_map(|e| e.downcast_ref::<T>())
}

/// Classify an App Attest validator failure.
pub fn classify_app_attest(error: AppAttestError) -> AttestationError {
    let message = error.to_string();
    let classified = match &error {
        AppAttestError::InvalidAuthenticatorData { issue, .. } => match issue {
            AuthenticatorDataIssue::AppIdMismatch | AuthenticatorDataIssue::AaguidMismatch => {
                AttestationError::ios_content(IosReason::Identifier, message, None)
            }
            AuthenticatorDataIssue::Other => {
                AttestationError::ios_content(IosReason::AppUnexpected, message, None)
            }
        },
        AppAttestError::InvalidCertificateChain { source, .. } => {
            let source = source.as_deref().map(|e| e as &(dyn StdError + 'static));
            match find_in_chain::<CertPathError>(source) {
                Some(path)
                    if matches!(
                        path.reason,
                        CertPathReason::NotYetValid | CertPathReason::Expired
                    ) =>
                {
                    AttestationError::certificate_time(Platform::Ios, message, None)
                }
                _ => AttestationError::certificate_trust(Platform::Ios, message, None),
            }
        }
        AppAttestError::InvalidNonce(_) => {
            AttestationError::ios_content(IosReason::Challenge, message, None)
        }
        AppAttestError::InvalidReceipt { source, .. } => {
            let source = source.as_deref().map(|e| e as &(dyn StdError + 'static));
            match find_in_chain::<ReceiptError>(source) {
                Some(ReceiptError::InvalidPayload {
                    issue: ReceiptPayloadIssue::CreationTimeAfter,
                    ..
                }) => AttestationError::ios_content(IosReason::StatementTime, message, None),
                _ => AttestationError::ios_content(IosReason::AppUnexpected, message, None),
            }
        }
        AppAttestError::InvalidFormat(_)
        | AppAttestError::InvalidPublicKey(_)
        | AppAttestError::InvalidAssertion(_)
        | AppAttestError::Other(_) => {
            AttestationError::ios_content(IosReason::AppUnexpected, message, None)
        }
    };
    with_cause(classified, error)
}

fn with_cause<E>(classified: AttestationError, error: E) -> AttestationError
where
    E: StdError + Send + Sync + 'static,
{
    debug!(kind = ?classified.kind(), platform = %classified.platform(), "Classified attestation failure");
    classified.caused_by(Cause::new(error))
}

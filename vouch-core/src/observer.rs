//! Hooks into the verification flow.
//!
//! The verifier reports routing decisions, per-strategy and per-app failures, and final
//! outcomes to a [`VerificationObserver`]. The default [`TracingObserver`] turns them into
//! `tracing` events; embedders can plug in metrics or audit logging instead.

use std::fmt;

use tracing::{debug, info, warn};

use crate::android::{AndroidCheckError, AndroidStrategy};
use crate::dispatcher::ProofShape;
use crate::error::{AttestationError, Platform};
use crate::ios::AppAttestError;

#[derive(Debug, Clone, Copy)]
pub enum VerificationEvent<'a> {
    /// A proof was routed to a platform.
    Routed { shape: ProofShape, proof_len: usize },
    /// One Android strategy rejected a chain. Others may still accept it.
    StrategyFailed {
        strategy: AndroidStrategy,
        error: &'a AndroidCheckError,
    },
    /// One configured iOS app rejected a statement. Others may still accept it.
    AppRejected {
        app_id: &'a str,
        error: &'a AppAttestError,
    },
    Verified { platform: Platform },
    Rejected {
        platform: Platform,
        explanation: &'a str,
        error: Option<&'a AttestationError>,
    },
}

pub trait VerificationObserver: Send + Sync + fmt::Debug {
    fn observe(&self, event: &VerificationEvent<'_>);
}

/// Emits every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl VerificationObserver for TracingObserver {
    fn observe(&self, event: &VerificationEvent<'_>) {
        match event {
            VerificationEvent::Routed { shape, proof_len } => {
                debug!(?shape, proof_len, "Routed attestation proof");
            }
            VerificationEvent::StrategyFailed { strategy, error } => {
                debug!(%strategy, error = %error, "Android strategy rejected chain");
            }
            VerificationEvent::AppRejected { app_id, error } => {
                debug!(app_id, error = %error, "App Attest validator rejected statement");
            }
            VerificationEvent::Verified { platform } => {
                info!(%platform, "Attestation verified");
            }
            VerificationEvent::Rejected {
                platform,
                explanation,
                error,
            } => {
                warn!(
                    %platform,
                    kind = ?error.map(AttestationError::kind),
                    reason = error.and_then(AttestationError::content_reason).map(|r| r.as_str()),
                    explanation,
                    "Attestation rejected"
                );
            }
        }
    }
}

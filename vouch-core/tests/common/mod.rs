//! Shared fixtures: generated certificate chains, App Attest statements and an in-memory App
//! Attest validator that skips Apple's roots and receipt signatures.

#![allow(dead_code)]

#[path = "../../src/test_support.rs"]
pub mod support;

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use ciborium::Value;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;
use serde::{Deserialize, Serialize};

use support::der::{self, Levels};
use support::{issue, issue_with_extension, self_signed, TestCert};
use vouch_core::android::record::KEY_DESCRIPTION_OID;
use vouch_core::ios::{
    key_id_of, AppAttestError, AppAttestValidator, AppAttestValidatorFactory, Assertion,
    AuthenticatorDataIssue, CertPathError, CertPathReason, Receipt, ReceiptError,
    ReceiptPayloadIssue, StatementEnvelope, ValidatedAttestation, ValidatorContext,
    OS_VERSION_OID,
};
use vouch_core::{
    AndroidAppData, AndroidAttestationConfiguration, AttestationError, AttestationVerifier,
    FixedClock, IosAppData, IosAttestationConfiguration,
};

pub const PACKAGE: &str = "at.example.wallet";
pub const DIGEST: [u8; 32] = [0xAB; 32];
pub const TEAM: &str = "9CYHJNG644";
pub const BUNDLE: &str = "at.example.wallet.ios";

/// Fixed verification instant for deterministic tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Root, intermediate and attestation leaf, all valid around [`t0`].
pub struct AndroidChain {
    pub root: TestCert,
    pub intermediate: TestCert,
    pub leaf: TestCert,
}

impl AndroidChain {
    pub fn new(challenge: &[u8]) -> Self {
        Self::for_package(challenge, PACKAGE, Levels::TEE)
    }

    pub fn for_package(challenge: &[u8], package: &str, levels: Levels) -> Self {
        let root = self_signed("root", t0() - Duration::days(365), t0() + Duration::days(3650));
        let intermediate = issue(
            "intermediate",
            &root,
            t0() - Duration::days(30),
            t0() + Duration::days(365),
            true,
        );
        let leaf = issue_with_extension(
            "attestation",
            &intermediate,
            t0() - Duration::days(1),
            t0() + Duration::days(1),
            KEY_DESCRIPTION_OID,
            &der::key_description(challenge, package, 7, &[DIGEST], levels),
        );
        Self {
            root,
            intermediate,
            leaf,
        }
    }

    pub fn certificates(&self) -> Vec<X509> {
        vec![
            self.leaf.cert.clone(),
            self.intermediate.cert.clone(),
            self.root.cert.clone(),
        ]
    }

    pub fn proof(&self) -> Vec<Vec<u8>> {
        self.certificates()
            .iter()
            .map(|cert| cert.to_der().unwrap())
            .collect()
    }

    pub fn root_der(&self) -> Vec<u8> {
        self.root.cert.to_der().unwrap()
    }

    pub fn leaf_key(&self) -> PKey<Public> {
        public_of(&self.leaf.key)
    }

    /// Hardware-only configuration trusting this chain's root.
    pub fn config(&self) -> AndroidAttestationConfiguration {
        AndroidAttestationConfiguration::builder()
            .with_app(AndroidAppData::new(PACKAGE, vec![DIGEST.to_vec()]))
            .with_hardware_trust_anchor(self.root_der())
            .build()
            .unwrap()
    }
}

pub fn public_of(key: &PKeyRef<Private>) -> PKey<Public> {
    PKey::public_key_from_der(&key.public_key_to_der().unwrap()).unwrap()
}

/// The receipt the fake validator understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FakeReceipt {
    pub app_id: String,
    pub challenge: String,
    pub created_at: DateTime<Utc>,
}

/// The assertion the fake validator understands: a signature over client data and challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FakeAssertion {
    pub sign_count: u32,
    pub signature: String,
}

/// An App Attest credential: key and leaf certificate, optionally carrying an OS version.
pub struct AppleDevice {
    pub credential: TestCert,
}

impl AppleDevice {
    pub fn new(os_version: Option<(&str, &str)>) -> Self {
        let ca = self_signed("App Attest CA", t0() - Duration::days(365), t0() + Duration::days(365));
        let credential = match os_version {
            Some((sem_ver, build)) => issue_with_extension(
                "credential",
                &ca,
                t0() - Duration::days(1),
                t0() + Duration::days(1),
                OS_VERSION_OID,
                &der::seq(&[
                    der::explicit(1400, &der::octets(sem_ver.as_bytes())),
                    der::explicit(1403, &der::octets(build.as_bytes())),
                ]),
            ),
            None => issue("credential", &ca, t0() - Duration::days(1), t0() + Duration::days(1), false),
        };
        Self { credential }
    }

    pub fn statement(&self, app_id: &str, challenge: &[u8], created_at: DateTime<Utc>) -> Vec<u8> {
        let receipt = FakeReceipt {
            app_id: app_id.to_string(),
            challenge: hex::encode(challenge),
            created_at,
        };
        let value = Value::Map(vec![
            (Value::Text("fmt".into()), Value::Text("apple-appattest".into())),
            (
                Value::Text("attStmt".into()),
                Value::Map(vec![
                    (
                        Value::Text("x5c".into()),
                        Value::Array(vec![Value::Bytes(self.credential.cert.to_der().unwrap())]),
                    ),
                    (
                        Value::Text("receipt".into()),
                        Value::Bytes(serde_json::to_vec(&receipt).unwrap()),
                    ),
                ]),
            ),
            (Value::Text("authData".into()), Value::Bytes(vec![0u8; 37])),
        ]);
        let mut out = Vec::new();
        ciborium::into_writer(&value, &mut out).unwrap();
        out
    }

    pub fn assertion(&self, client_data: &[u8], challenge: &[u8], sign_count: u32) -> Vec<u8> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.credential.key).unwrap();
        signer.update(client_data).unwrap();
        signer.update(challenge).unwrap();
        let assertion = FakeAssertion {
            sign_count,
            signature: hex::encode(signer.sign_to_vec().unwrap()),
        };
        serde_json::to_vec(&assertion).unwrap()
    }
}

pub fn app_id() -> String {
    IosAppData::new(TEAM, BUNDLE).app_id()
}

/// Validator that checks the fake receipt and assertion formats.
#[derive(Debug)]
pub struct FakeValidator {
    app: IosAppData,
    context: ValidatorContext,
    /// Report an expired certificate path instead of validating.
    expired_chain: bool,
}

impl AppAttestValidator for FakeValidator {
    fn app(&self) -> &IosAppData {
        &self.app
    }

    fn validate_attestation(
        &self,
        statement: &[u8],
        key_id: &str,
        challenge: &[u8],
    ) -> Result<ValidatedAttestation, AppAttestError> {
        if self.expired_chain {
            return Err(AppAttestError::chain(
                "credential certificate path invalid",
                CertPathError {
                    reason: CertPathReason::Expired,
                    message: "expired".into(),
                },
            ));
        }
        let envelope = StatementEnvelope::parse(statement)?;
        let receipt: FakeReceipt = serde_json::from_slice(&envelope.receipt).map_err(|e| {
            AppAttestError::receipt("unreadable receipt", ReceiptError::Malformed(e.to_string()))
        })?;
        if receipt.app_id != self.app.app_id() {
            return Err(AppAttestError::InvalidAuthenticatorData {
                issue: AuthenticatorDataIssue::AppIdMismatch,
                message: format!("App ID does not match RP ID hash ({})", receipt.app_id),
            });
        }
        if key_id_of(envelope.leaf())? != key_id {
            return Err(AppAttestError::InvalidPublicKey("key id mismatch".into()));
        }
        if hex::decode(&receipt.challenge).ok().as_deref() != Some(challenge) {
            return Err(AppAttestError::InvalidNonce("nonce does not match".into()));
        }
        if receipt.created_at < self.context.clock.now() - self.context.receipt_max_age {
            return Err(AppAttestError::receipt(
                "receipt rejected",
                ReceiptError::InvalidPayload {
                    issue: ReceiptPayloadIssue::TooOld,
                    message: "receipt too old".into(),
                },
            ));
        }
        let certificate = X509::from_der(envelope.leaf())
            .map_err(|e| AppAttestError::InvalidFormat(e.to_string()))?;
        Ok(ValidatedAttestation {
            certificate,
            receipt: Receipt {
                app_id: receipt.app_id,
                creation_time: receipt.created_at,
                not_before: None,
                expiration_time: None,
                risk_metric: None,
            },
            authenticator_data: envelope.authenticator_data,
        })
    }

    fn validate_assertion(
        &self,
        assertion: &[u8],
        client_data: &[u8],
        attested_key: &PKeyRef<Public>,
        last_counter: u32,
        challenge: &[u8],
    ) -> Result<Assertion, AppAttestError> {
        let parsed: FakeAssertion = serde_json::from_slice(assertion)
            .map_err(|e| AppAttestError::InvalidAssertion(e.to_string()))?;
        if parsed.sign_count <= last_counter {
            return Err(AppAttestError::InvalidAssertion("counter did not increase".into()));
        }
        let signature = hex::decode(&parsed.signature)
            .map_err(|e| AppAttestError::InvalidAssertion(e.to_string()))?;
        let valid = Verifier::new(MessageDigest::sha256(), attested_key)
            .and_then(|mut verifier| {
                verifier.update(client_data)?;
                verifier.update(challenge)?;
                verifier.verify(&signature)
            })
            .unwrap_or(false);
        if !valid {
            return Err(AppAttestError::InvalidAssertion("signature does not verify".into()));
        }
        Ok(Assertion {
            sign_count: parsed.sign_count,
            authenticator_data: Vec::new(),
            signature,
        })
    }
}

/// Creates [`FakeValidator`]s. Apps whose bundle id is listed fail with an expired chain.
#[derive(Debug, Default)]
pub struct FakeValidatorFactory {
    pub expired_chain_bundles: Vec<String>,
}

impl AppAttestValidatorFactory for FakeValidatorFactory {
    fn create(
        &self,
        app: &IosAppData,
        context: &ValidatorContext,
    ) -> Result<Box<dyn AppAttestValidator>, AttestationError> {
        Ok(Box::new(FakeValidator {
            app: app.clone(),
            context: context.clone(),
            expired_chain: self.expired_chain_bundles.contains(&app.bundle_identifier),
        }))
    }
}

pub fn ios_config() -> IosAttestationConfiguration {
    IosAttestationConfiguration::single(IosAppData::new(TEAM, BUNDLE)).unwrap()
}

/// Verifier frozen at `at` with the fake App Attest validators.
pub fn verifier_at(
    android: AndroidAttestationConfiguration,
    ios: IosAttestationConfiguration,
    at: DateTime<Utc>,
) -> AttestationVerifier {
    AttestationVerifier::builder(android, ios)
        .with_clock(Arc::new(FixedClock::new(at)))
        .with_app_attest_validators(Arc::new(FakeValidatorFactory::default()))
        .build()
        .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

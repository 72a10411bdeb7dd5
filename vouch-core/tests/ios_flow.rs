//! App Attest statements and assertions through the public verifier.

mod common;

use std::sync::Arc;

use chrono::Duration;

use common::{app_id, ios_config, t0, verifier_at, AndroidChain, AppleDevice, BUNDLE, TEAM};
use vouch_core::{
    AttestationResult, AttestationService, AttestationVerifier, ErrorKind, FixedClock,
    IosAppData, IosAttestationConfiguration, IosReason, OsVersions, Platform,
};

const CHALLENGE: &[u8] = b"ios-challenge";

fn android() -> vouch_core::AndroidAttestationConfiguration {
    AndroidChain::new(CHALLENGE).config()
}

fn ios_reason(result: &AttestationResult) -> Option<IosReason> {
    result.error_cause().and_then(|cause| cause.ios_reason())
}

fn with_min_version(min: (&str, &str)) -> IosAttestationConfiguration {
    IosAttestationConfiguration::with_settings(
        vec![IosAppData::new(TEAM, BUNDLE)],
        Some(OsVersions::parse(min.0, min.1).unwrap()),
        300,
    )
    .unwrap()
}

#[test]
fn test_statement_is_verified() {
    common::init_tracing();
    let device = AppleDevice::new(Some(("17.2.1", "21C66")));
    let verifier = verifier_at(android(), ios_config(), t0());

    let statement = device.statement(&app_id(), CHALLENGE, t0() - Duration::seconds(30));
    let result = verifier.verify_attestation(&[statement], CHALLENGE, None);
    match &result {
        AttestationResult::IosVerified {
            attestation,
            parsed_version,
            asserted_client_data,
        } => {
            assert_eq!(attestation.receipt.app_id, app_id());
            assert_eq!(parsed_version.sem_ver, Some("17.2.1".parse().unwrap()));
            assert_eq!(parsed_version.build_number, Some("21C66".parse().unwrap()));
            assert!(asserted_client_data.is_none());
        }
        other => panic!("expected iOS success, got {other}"),
    }
}

#[test]
fn test_wrong_challenge_and_unknown_app() {
    let device = AppleDevice::new(None);
    let verifier = verifier_at(android(), ios_config(), t0());

    let statement = device.statement(&app_id(), b"other challenge", t0());
    let result = verifier.verify_app_attestation(&statement, CHALLENGE);
    assert_eq!(ios_reason(&result), Some(IosReason::Challenge));

    let statement = device.statement("TEAM.at.example.unknown", CHALLENGE, t0());
    let result = verifier.verify_app_attestation(&statement, CHALLENGE);
    assert_eq!(ios_reason(&result), Some(IosReason::Identifier));
}

#[test]
fn test_first_app_failure_is_reported() {
    let device = AppleDevice::new(None);
    let statement = device.statement("TEAM.at.example.unknown", CHALLENGE, t0());
    let broken = IosAppData::new(TEAM, "at.example.broken");
    let plain = IosAppData::new(TEAM, BUNDLE);
    let factory = Arc::new(common::FakeValidatorFactory {
        expired_chain_bundles: vec!["at.example.broken".into()],
    });
    let verifier = |apps: Vec<IosAppData>| {
        AttestationVerifier::builder(android(), IosAttestationConfiguration::new(apps).unwrap())
            .with_clock(Arc::new(FixedClock::new(t0())))
            .with_app_attest_validators(factory.clone())
            .build()
            .unwrap()
    };

    let broken_first = verifier(vec![broken.clone(), plain.clone()]);
    let result = broken_first.verify_app_attestation(&statement, CHALLENGE);
    let cause = result.error_cause().expect("error");
    assert_eq!(cause.kind(), ErrorKind::CertificateTime);
    assert_eq!(cause.platform(), Platform::Ios);

    let plain_first = verifier(vec![plain, broken]);
    let result = plain_first.verify_app_attestation(&statement, CHALLENGE);
    assert_eq!(ios_reason(&result), Some(IosReason::Identifier));
}

#[test]
fn test_any_configured_app_may_accept() {
    let device = AppleDevice::new(None);
    let other = IosAppData::new(TEAM, "at.example.other");
    let config =
        IosAttestationConfiguration::new(vec![other, IosAppData::new(TEAM, BUNDLE)]).unwrap();
    let verifier = verifier_at(android(), config, t0());

    let statement = device.statement(&app_id(), CHALLENGE, t0());
    assert!(!verifier.verify_app_attestation(&statement, CHALLENGE).is_error());
}

#[test]
fn test_statement_from_the_future_is_stale() {
    let device = AppleDevice::new(None);
    let verifier = verifier_at(android(), ios_config(), t0());

    let statement = device.statement(&app_id(), CHALLENGE, t0() + Duration::seconds(1));
    let result = verifier.verify_app_attestation(&statement, CHALLENGE);
    assert_eq!(ios_reason(&result), Some(IosReason::StatementTime));
}

#[test]
fn test_statement_older_than_validity_is_stale() {
    let device = AppleDevice::new(None);
    let config =
        IosAttestationConfiguration::with_settings(vec![IosAppData::new(TEAM, BUNDLE)], None, 120)
            .unwrap();
    let verifier = verifier_at(android(), config, t0());

    let fresh = device.statement(&app_id(), CHALLENGE, t0() - Duration::seconds(120));
    assert!(!verifier.verify_app_attestation(&fresh, CHALLENGE).is_error());

    let stale = device.statement(&app_id(), CHALLENGE, t0() - Duration::seconds(121));
    let result = verifier.verify_app_attestation(&stale, CHALLENGE);
    assert_eq!(ios_reason(&result), Some(IosReason::StatementTime));
}

#[test]
fn test_day_offset_with_shorter_validity_is_stale() {
    let device = AppleDevice::new(None);
    let statement = device.statement(&app_id(), CHALLENGE, t0());
    let config = IosAttestationConfiguration::with_settings(
        vec![IosAppData::new(TEAM, BUNDLE)],
        None,
        23 * 60 * 60,
    )
    .unwrap();

    for offset in [Duration::days(1), Duration::days(-1)] {
        let verifier = AttestationVerifier::builder(android(), config.clone())
            .with_clock(Arc::new(FixedClock::new(t0())))
            .with_verification_offset(offset)
            .with_app_attest_validators(Arc::new(common::FakeValidatorFactory::default()))
            .build()
            .unwrap();
        let result = verifier.verify_app_attestation(&statement, CHALLENGE);
        assert_eq!(ios_reason(&result), Some(IosReason::StatementTime), "offset {offset}");
    }
}

#[test]
fn test_version_gate_is_strict() {
    let verifier = verifier_at(android(), with_min_version(("17.0", "21A329")), t0());

    for (sem_ver, build) in [("17.2.1", "21C66"), ("17.0", "21A329")] {
        let device = AppleDevice::new(Some((sem_ver, build)));
        let statement = device.statement(&app_id(), CHALLENGE, t0());
        let result = verifier.verify_app_attestation(&statement, CHALLENGE);
        assert!(!result.is_error(), "{sem_ver}: {result}");
    }

    let old = AppleDevice::new(Some(("16.7", "20H19")));
    let statement = old.statement(&app_id(), CHALLENGE, t0());
    let result = verifier.verify_app_attestation(&statement, CHALLENGE);
    assert_eq!(ios_reason(&result), Some(IosReason::OsVersion));
}

#[test]
fn test_missing_version_fails_gate() {
    let verifier = verifier_at(android(), with_min_version(("17.0", "21A329")), t0());
    let device = AppleDevice::new(None);
    let statement = device.statement(&app_id(), CHALLENGE, t0());
    let result = verifier.verify_app_attestation(&statement, CHALLENGE);
    assert_eq!(ios_reason(&result), Some(IosReason::OsVersion));
}

#[test]
fn test_build_number_used_without_sem_ver() {
    let verifier = verifier_at(android(), with_min_version(("17.0", "21A329")), t0());
    // An unparseable semantic version falls back to the build number.
    let newer = AppleDevice::new(Some(("garbage", "21C66")));
    let statement = newer.statement(&app_id(), CHALLENGE, t0());
    assert!(!verifier.verify_app_attestation(&statement, CHALLENGE).is_error());

    let older = AppleDevice::new(Some(("garbage", "20H19")));
    let statement = older.statement(&app_id(), CHALLENGE, t0());
    let result = verifier.verify_app_attestation(&statement, CHALLENGE);
    assert_eq!(ios_reason(&result), Some(IosReason::OsVersion));
}

#[test]
fn test_per_app_override_replaces_global_minimum() {
    let relaxed = IosAppData::new(TEAM, BUNDLE).override_version(OsVersions::parse("15.0", "19A346").unwrap());
    let config = IosAttestationConfiguration::with_settings(
        vec![relaxed],
        Some(OsVersions::parse("17.0", "21A329").unwrap()),
        300,
    )
    .unwrap();
    let verifier = verifier_at(android(), config, t0());

    let device = AppleDevice::new(Some(("16.7", "20H19")));
    let statement = device.statement(&app_id(), CHALLENGE, t0());
    assert!(!verifier.verify_app_attestation(&statement, CHALLENGE).is_error());
}

#[test]
fn test_assertion_over_client_data() {
    let device = AppleDevice::new(None);
    let verifier = verifier_at(android(), ios_config(), t0());
    let statement = device.statement(&app_id(), CHALLENGE, t0());
    let client_data = b"{\"action\":\"enroll\"}";

    let proof = vec![statement.clone(), device.assertion(client_data, CHALLENGE, 1)];
    let result = verifier.verify_attestation(&proof, CHALLENGE, Some(client_data));
    match &result {
        AttestationResult::IosVerified {
            asserted_client_data: Some(asserted),
            ..
        } => {
            assert_eq!(asserted.client_data, client_data);
            assert_eq!(asserted.assertion.sign_count, 1);
        }
        other => panic!("expected asserted iOS success, got {other}"),
    }

    let tampered = verifier.verify_assertion(
        &statement,
        &device.assertion(b"something else", CHALLENGE, 1),
        client_data,
        CHALLENGE,
        0,
    );
    assert_eq!(ios_reason(&tampered), Some(IosReason::AppUnexpected));
}

#[test]
fn test_assertion_counter_must_be_one() {
    let device = AppleDevice::new(None);
    let verifier = verifier_at(android(), ios_config(), t0());
    let statement = device.statement(&app_id(), CHALLENGE, t0());

    let result = verifier.verify_assertion(
        &statement,
        &device.assertion(b"data", CHALLENGE, 2),
        b"data",
        CHALLENGE,
        0,
    );
    assert_eq!(ios_reason(&result), Some(IosReason::SigCtr));
}

#[test]
fn test_client_data_without_assertion_is_usage_error() {
    let device = AppleDevice::new(None);
    let verifier = verifier_at(android(), ios_config(), t0());
    let statement = device.statement(&app_id(), CHALLENGE, t0());

    let result = verifier.verify_attestation(&[statement], CHALLENGE, Some(b"data"));
    let cause = result.error_cause().expect("error");
    assert_eq!(cause.ios_reason(), Some(IosReason::AppUnexpected));
    assert!(cause.message().contains("clientData without an assertion"));
}

#[test]
fn test_empty_and_malformed_proofs() {
    let verifier = verifier_at(android(), ios_config(), t0());

    let empty = verifier.verify_attestation(&[], CHALLENGE, None);
    assert!(empty.is_error());
    assert!(empty.error_cause().is_none());

    let garbage = verifier.verify_attestation(&[b"\xff\x00garbage".to_vec()], CHALLENGE, None);
    assert_eq!(ios_reason(&garbage), Some(IosReason::AppUnexpected));
}

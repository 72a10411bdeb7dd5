//! Certificate and DER fixtures for unit tests.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Duration, Utc};
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Builder, X509Extension, X509NameBuilder, X509};

static SERIAL: AtomicU32 = AtomicU32::new(1);

pub(crate) struct TestCert {
    pub key: PKey<Private>,
    pub cert: X509,
}

pub(crate) fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn build(
    common_name: &str,
    key: &PKey<Private>,
    issuer: Option<&TestCert>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    ca: bool,
    extensions: Vec<X509Extension>,
) -> X509 {
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(SERIAL.fetch_add(1, Ordering::Relaxed)).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("O", "Vouch Test").unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();
    builder.set_subject_name(&name).unwrap();
    match issuer {
        Some(issuer) => builder.set_issuer_name(issuer.cert.subject_name()).unwrap(),
        None => builder.set_issuer_name(&name).unwrap(),
    }

    builder
        .set_not_before(&Asn1Time::from_unix(not_before.timestamp()).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(not_after.timestamp()).unwrap())
        .unwrap();
    builder.set_pubkey(key).unwrap();

    if ca {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .digital_signature()
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }
    for extension in extensions {
        builder.append_extension(extension).unwrap();
    }

    let signing_key = issuer.map_or(key, |issuer| &issuer.key);
    builder.sign(signing_key, MessageDigest::sha256()).unwrap();
    builder.build()
}

pub(crate) fn self_signed(
    common_name: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> TestCert {
    let key = ec_key();
    let cert = build(common_name, &key, None, not_before, not_after, true, vec![]);
    TestCert { key, cert }
}

pub(crate) fn issue(
    common_name: &str,
    issuer: &TestCert,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    ca: bool,
) -> TestCert {
    let key = ec_key();
    let cert = build(common_name, &key, Some(issuer), not_before, not_after, ca, vec![]);
    TestCert { key, cert }
}

pub(crate) fn issue_with_extension(
    common_name: &str,
    issuer: &TestCert,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    oid: &str,
    value: &[u8],
) -> TestCert {
    issue_for_key(common_name, ec_key(), issuer, not_before, not_after, &[(oid, value)])
}

/// End-entity certificate for a key the caller generated up front.
pub(crate) fn issue_for_key(
    common_name: &str,
    key: PKey<Private>,
    issuer: &TestCert,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    extensions: &[(&str, &[u8])],
) -> TestCert {
    let extensions = extensions
        .iter()
        .map(|(oid, value)| {
            X509Extension::new_from_der(
                &Asn1Object::from_str(oid).unwrap(),
                false,
                &Asn1OctetString::new_from_bytes(value).unwrap(),
            )
            .unwrap()
        })
        .collect();
    let cert = build(
        common_name,
        &key,
        Some(issuer),
        not_before,
        not_after,
        false,
        extensions,
    );
    TestCert { key, cert }
}

pub(crate) fn self_signed_der() -> Vec<u8> {
    let now = Utc::now();
    self_signed("anchor", now - Duration::days(1), now + Duration::days(1))
        .cert
        .to_der()
        .unwrap()
}

/// Minimal DER writer for hand-built ASN.1 structures.
pub(crate) mod der {
    fn length(len: usize) -> Vec<u8> {
        if len < 0x80 {
            return vec![len as u8];
        }
        let bytes: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        let mut out = vec![0x80 | bytes.len() as u8];
        out.extend(bytes);
        out
    }

    pub fn tlv(tag: &[u8], content: &[u8]) -> Vec<u8> {
        let mut out = tag.to_vec();
        out.extend(length(content.len()));
        out.extend_from_slice(content);
        out
    }

    pub fn seq(items: &[Vec<u8>]) -> Vec<u8> {
        tlv(&[0x30], &items.concat())
    }

    pub fn set(items: &[Vec<u8>]) -> Vec<u8> {
        tlv(&[0x31], &items.concat())
    }

    pub fn int(value: u64) -> Vec<u8> {
        let mut bytes: Vec<u8> = value
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        if bytes.first().map_or(true, |b| b & 0x80 != 0) {
            bytes.insert(0, 0);
        }
        tlv(&[0x02], &bytes)
    }

    pub fn enumerated(value: u8) -> Vec<u8> {
        tlv(&[0x0A], &[value])
    }

    pub fn octets(bytes: &[u8]) -> Vec<u8> {
        tlv(&[0x04], bytes)
    }

    pub fn boolean(value: bool) -> Vec<u8> {
        tlv(&[0x01], &[if value { 0xFF } else { 0x00 }])
    }

    pub fn null() -> Vec<u8> {
        vec![0x05, 0x00]
    }

    /// Context-specific, constructed, explicit tag.
    pub fn explicit(tag: u32, inner: &[u8]) -> Vec<u8> {
        if tag < 31 {
            return tlv(&[0xA0 | tag as u8], inner);
        }
        let mut number = vec![(tag & 0x7F) as u8];
        let mut rest = tag >> 7;
        while rest > 0 {
            number.push((rest & 0x7F) as u8 | 0x80);
            rest >>= 7;
        }
        number.reverse();
        let mut header = vec![0xBF];
        header.extend(number);
        tlv(&header, inner)
    }

    #[derive(Debug, Clone, Copy)]
    pub struct Levels {
        pub attestation: u8,
        pub keymaster: u8,
    }

    impl Levels {
        pub const SOFTWARE: Self = Self {
            attestation: 0,
            keymaster: 0,
        };
        pub const TEE: Self = Self {
            attestation: 1,
            keymaster: 1,
        };
        pub const NOUGAT: Self = Self {
            attestation: 0,
            keymaster: 1,
        };
    }

    /// A KeyDescription for Android 14, patch level 2024-01, locked and verified boot.
    pub fn key_description(
        challenge: &[u8],
        package: &str,
        version: u64,
        digests: &[[u8; 32]],
        levels: Levels,
    ) -> Vec<u8> {
        let digests: Vec<Vec<u8>> = digests.iter().map(|d| octets(d)).collect();
        let app_id = seq(&[
            set(&[seq(&[octets(package.as_bytes()), int(version)])]),
            set(&digests),
        ]);
        let root_of_trust = seq(&[
            octets(&[0x11; 32]),
            boolean(true),
            enumerated(0),
            octets(&[0x22; 32]),
        ]);
        let enforced = vec![
            explicit(703, &null()),
            explicit(704, &root_of_trust),
            explicit(705, &int(140000)),
            explicit(706, &int(202401)),
        ];
        let mut software = enforced.clone();
        software.push(explicit(709, &octets(&app_id)));
        seq(&[
            int(3),
            enumerated(levels.attestation),
            int(4),
            enumerated(levels.keymaster),
            octets(challenge),
            octets(&[]),
            seq(&software),
            seq(&enforced),
        ])
    }
}

/// Generated stand-ins for Apple's App Attest and receipt roots, and a device using them.
pub(crate) mod app_attest {
    use chrono::{DateTime, Duration, SecondsFormat, Utc};
    use ciborium::Value;
    use openssl::bn::BigNumContext;
    use openssl::ec::PointConversionForm;
    use openssl::hash::MessageDigest;
    use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
    use openssl::pkey::{PKey, Private};
    use openssl::sha::{sha256, Sha256};
    use openssl::sign::Signer;
    use openssl::stack::Stack;
    use openssl::x509::X509;

    use super::{der, ec_key, issue, issue_for_key, self_signed, TestCert};

    pub const NONCE_OID: &str = "1.2.840.113635.100.8.2";
    pub const AAGUID_PRODUCTION: [u8; 16] = *b"appattest\0\0\0\0\0\0\0";
    pub const AAGUID_DEVELOPMENT: [u8; 16] = *b"appattestdevelop";

    pub struct AppleRoots {
        pub attestation: TestCert,
        pub intermediate: TestCert,
        pub receipt: TestCert,
        pub receipt_signer: TestCert,
    }

    impl AppleRoots {
        /// Roots valid for a year before and ten years after `around`.
        pub fn new(around: DateTime<Utc>) -> Self {
            let from = around - Duration::days(365);
            let until = around + Duration::days(3650);
            let attestation = self_signed("App Attestation Root CA", from, until);
            let intermediate = issue("App Attestation CA 1", &attestation, from, until, true);
            let receipt = self_signed("Root CA - G3", from, until);
            let receipt_signer = issue("Fraud Receipt Signing", &receipt, from, until, false);
            Self {
                attestation,
                intermediate,
                receipt,
                receipt_signer,
            }
        }

        /// An ATTEST receipt for `credential`, created at `created_at`.
        pub fn receipt(&self, app_id: &str, credential: &[u8], created_at: DateTime<Utc>) -> Vec<u8> {
            let field = |kind: u64, value: &[u8]| {
                der::seq(&[der::int(kind), der::int(1), der::octets(value)])
            };
            let time = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);
            let payload = der::set(&[
                field(2, app_id.as_bytes()),
                field(3, credential),
                field(6, b"ATTEST"),
                field(12, time(created_at).as_bytes()),
                field(21, time(created_at + Duration::days(90)).as_bytes()),
            ]);
            self.sign_receipt(&payload)
        }

        pub fn sign_receipt(&self, payload: &[u8]) -> Vec<u8> {
            Pkcs7::sign(
                &self.receipt_signer.cert,
                &self.receipt_signer.key,
                &Stack::<X509>::new().unwrap(),
                payload,
                Pkcs7Flags::BINARY,
            )
            .unwrap()
            .to_der()
            .unwrap()
        }
    }

    pub fn to_cbor(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        ciborium::into_writer(value, &mut out).unwrap();
        out
    }

    fn text(s: &str) -> Value {
        Value::Text(s.into())
    }

    /// An App Attest key pair on one device.
    pub struct Device {
        pub key: PKey<Private>,
        pub aaguid: [u8; 16],
    }

    impl Device {
        pub fn new() -> Self {
            Self {
                key: ec_key(),
                aaguid: AAGUID_PRODUCTION,
            }
        }

        pub fn sandbox() -> Self {
            Self {
                aaguid: AAGUID_DEVELOPMENT,
                ..Self::new()
            }
        }

        /// Uncompressed EC point of the attested key.
        pub fn raw_public_key(&self) -> Vec<u8> {
            let ec = self.key.ec_key().unwrap();
            let mut ctx = BigNumContext::new().unwrap();
            ec.public_key()
                .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)
                .unwrap()
        }

        pub fn key_id(&self) -> [u8; 32] {
            sha256(&self.raw_public_key())
        }

        /// Authenticator data with attested credential data for this key.
        pub fn authenticator_data(&self, app_id: &str, sign_count: u32) -> Vec<u8> {
            let mut data = sha256(app_id.as_bytes()).to_vec();
            data.push(0x40);
            data.extend(sign_count.to_be_bytes());
            data.extend(self.aaguid);
            data.extend(32u16.to_be_bytes());
            data.extend(self.key_id());
            data
        }

        pub fn statement(
            &self,
            roots: &AppleRoots,
            app_id: &str,
            challenge: &[u8],
            created_at: DateTime<Utc>,
        ) -> Vec<u8> {
            let auth_data = self.authenticator_data(app_id, 0);
            self.statement_with(roots, app_id, challenge, created_at, &auth_data)
        }

        /// A statement over arbitrary authenticator data, with a matching nonce and receipt.
        pub fn statement_with(
            &self,
            roots: &AppleRoots,
            app_id: &str,
            challenge: &[u8],
            created_at: DateTime<Utc>,
            auth_data: &[u8],
        ) -> Vec<u8> {
            let mut nonce = Sha256::new();
            nonce.update(auth_data);
            nonce.update(&sha256(challenge));
            let nonce = nonce.finish();
            let extension = der::seq(&[der::explicit(1, &der::octets(&nonce))]);
            let credential = issue_for_key(
                "credential",
                self.key.clone(),
                &roots.intermediate,
                created_at - Duration::days(1),
                created_at + Duration::days(30),
                &[(NONCE_OID, extension.as_slice())],
            );
            let credential_der = credential.cert.to_der().unwrap();
            let receipt = roots.receipt(app_id, &credential_der, created_at);
            to_cbor(&Value::Map(vec![
                (text("fmt"), text("apple-appattest")),
                (
                    text("attStmt"),
                    Value::Map(vec![
                        (
                            text("x5c"),
                            Value::Array(vec![
                                Value::Bytes(credential_der),
                                Value::Bytes(roots.intermediate.cert.to_der().unwrap()),
                            ]),
                        ),
                        (text("receipt"), Value::Bytes(receipt)),
                    ]),
                ),
                (text("authData"), Value::Bytes(auth_data.to_vec())),
            ]))
        }

        /// An assertion over `client_data` with the given counter.
        pub fn assertion(&self, app_id: &str, client_data: &[u8], sign_count: u32) -> Vec<u8> {
            let mut auth_data = sha256(app_id.as_bytes()).to_vec();
            auth_data.push(0x00);
            auth_data.extend(sign_count.to_be_bytes());
            let mut nonce = Sha256::new();
            nonce.update(&auth_data);
            nonce.update(&sha256(client_data));
            let mut signer = Signer::new(MessageDigest::sha256(), &self.key).unwrap();
            signer.update(&nonce.finish()).unwrap();
            to_cbor(&Value::Map(vec![
                (text("signature"), Value::Bytes(signer.sign_to_vec().unwrap())),
                (text("authenticatorData"), Value::Bytes(auth_data)),
            ]))
        }
    }
}

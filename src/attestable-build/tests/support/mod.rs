// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Shared fixtures: a throwaway P-384 PKI and an attestor that signs real
//! COSE_Sign1 documents with it, shaped like the ones the NSM returns.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use attestable_build::attestation::{AttestationError, Attestor, Verifier};
use coset::{CborSerializable, CoseSign1Builder, HeaderBuilder};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P384_SHA384_FIXED_SIGNING};
use serde_cbor::Value;

/// 2025-01-01T00:00:00Z
pub const IN_WINDOW_SECS: u64 = 1_735_689_600;
/// 2019-01-01T00:00:00Z, before the leaf is valid.
pub const BEFORE_WINDOW_SECS: u64 = 1_546_300_800;
/// 2101-01-01T00:00:00Z, after the leaf expired.
pub const AFTER_WINDOW_SECS: u64 = 4_133_980_800;

pub fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs(secs)
}

pub struct TestPki {
    pub root_pem: String,
    pub root_der: Vec<u8>,
    pub leaf_der: Vec<u8>,
    leaf_pkcs8: Vec<u8>,
}

impl TestPki {
    /// Root valid forever, leaf valid from 2020 through 2099. The leaf carries
    /// the same v3 extensions an enclave leaf does.
    pub fn generate() -> Self {
        let root_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let mut root_params = CertificateParams::default();
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        root_params.distinguished_name = name("attestable-build test root");
        let root = root_params.self_signed(&root_key).unwrap();
        let issuer = Issuer::new(root_params, root_key);

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let mut leaf_params = CertificateParams::default();
        leaf_params.is_ca = IsCa::NoCa;
        leaf_params.distinguished_name = name("i-0123456789abcdef0-enc0123456789abcdef");
        leaf_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        leaf_params.use_authority_key_identifier_extension = true;
        leaf_params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        leaf_params.not_after = rcgen::date_time_ymd(2100, 1, 1);
        let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

        Self {
            root_pem: root.pem(),
            root_der: root.der().to_vec(),
            leaf_der: leaf.der().to_vec(),
            leaf_pkcs8: leaf_key.serialize_der(),
        }
    }

    pub fn verifier(&self) -> Verifier {
        Verifier::with_root_der(self.root_der.clone())
    }
}

fn name(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name
}

/// Signs attestation documents with a [`TestPki`] leaf.
pub struct SoftwareAttestor {
    pki: TestPki,
    pub pcr0: Vec<u8>,
}

impl SoftwareAttestor {
    pub fn new(pki: TestPki) -> Self {
        Self {
            pki,
            pcr0: vec![0xab; 48],
        }
    }

    pub fn verifier(&self) -> Verifier {
        self.pki.verifier()
    }

    pub fn root_pem(&self) -> &str {
        &self.pki.root_pem
    }
}

impl Attestor for SoftwareAttestor {
    fn attest(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AttestationError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AttestationError::Rejected(e.to_string()))?
            .as_millis();

        let pcrs = BTreeMap::from([
            (Value::Integer(0), Value::Bytes(self.pcr0.clone())),
            (Value::Integer(1), Value::Bytes(vec![0; 48])),
            (Value::Integer(2), Value::Bytes(vec![0; 48])),
        ]);
        let text = |s: &str| Value::Text(s.to_string());
        let document = BTreeMap::from([
            (text("module_id"), text("i-0123456789abcdef0-enc0123456789abcdef")),
            (text("digest"), text("SHA384")),
            (text("timestamp"), Value::Integer(timestamp as i128)),
            (text("pcrs"), Value::Map(pcrs)),
            (text("certificate"), Value::Bytes(self.pki.leaf_der.clone())),
            (text("cabundle"), Value::Array(vec![Value::Bytes(self.pki.root_der.clone())])),
            (text("public_key"), Value::Null),
            (text("user_data"), Value::Bytes(user_data.to_vec())),
            (text("nonce"), Value::Bytes(nonce.to_vec())),
        ]);
        let payload = serde_cbor::to_vec(&Value::Map(document)).map_err(|e| AttestationError::Rejected(e.to_string()))?;

        let rng = SystemRandom::new();
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, &self.pki.leaf_pkcs8, &rng)
            .map_err(|e| AttestationError::Rejected(e.to_string()))?;

        let protected = HeaderBuilder::new().algorithm(coset::iana::Algorithm::ES384).build();
        let mut signing_error = None;
        let sign1 = CoseSign1Builder::new()
            .protected(protected)
            .payload(payload)
            .create_signature(&[], |message| match key.sign(&rng, message) {
                Ok(signature) => signature.as_ref().to_vec(),
                Err(e) => {
                    signing_error = Some(e.to_string());
                    Vec::new()
                }
            })
            .build();
        if let Some(e) = signing_error {
            return Err(AttestationError::Rejected(e));
        }
        sign1.to_vec().map_err(|e| AttestationError::Rejected(format!("{e:?}")))
    }
}

/// A project directory with a `build.json` and one source file.
pub fn project(manifest: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("build.json"), manifest).unwrap();
    fs::write(dir.path().join("main.c"), "int main(void) { return 0; }\n").unwrap();
    dir
}

pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

pub const ECHO_MANIFEST: &str =
    r#"{"language":"c","input":{"cmd":"echo hi > out.txt","env":[]},"output":{"files":["out.txt"]}}"#;

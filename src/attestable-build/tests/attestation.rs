// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

mod support;

use attestable_build::attestation::{self, AttestationError, AttestationPayload};
use attestable_build::orchestrator::verify_build_report;
use attestable_build::report;
use coset::{CborSerializable, CoseSign1};
use support::{at, SoftwareAttestor, TestPki, AFTER_WINDOW_SECS, BEFORE_WINDOW_SECS, IN_WINDOW_SECS};

fn payload(nonce: &str) -> AttestationPayload {
    AttestationPayload {
        nonce: nonce.to_string(),
        source_revision: "3f7c1d2e9a8b7c6d5e4f3a2b1c0d9e8f7a6b5c4d".to_string(),
        repo: Some("https://example.com/app.git".to_string()),
        input_hash: format!("0x{}", "11".repeat(32)),
        output_hash: format!("0x{}", "22".repeat(32)),
        image_identity: "ata-build-rust".to_string(),
    }
}

#[test]
fn test_bind_then_verify_recovers_user_data() {
    let attestor = SoftwareAttestor::new(TestPki::generate());
    let payload = payload("0123456789abcdef0123456789abcdef");

    let document = attestation::bind(&attestor, &payload).unwrap();
    let (verified, recovered) =
        verify_build_report(&attestor.verifier(), &document, &payload.nonce, at(IN_WINDOW_SECS)).unwrap();

    assert_eq!(verified.user_data, payload.to_user_data().unwrap());
    assert_eq!(recovered, payload);
    assert_eq!(verified.measurement(), attestor.pcr0.as_slice());
    assert_eq!(verified.nonce.as_deref(), Some(payload.nonce.as_bytes()));

    let markdown = report::render_markdown(&verified);
    assert!(markdown.contains(&format!("`0x{}`", hex::encode(&attestor.pcr0))));
    assert!(markdown.contains("\t\"outputHash\""));
}

#[test]
fn test_outside_validity_window_fails() {
    let attestor = SoftwareAttestor::new(TestPki::generate());
    let payload = payload("aa");
    let document = attestation::bind(&attestor, &payload).unwrap();
    let verifier = attestor.verifier();

    for secs in [AFTER_WINDOW_SECS, BEFORE_WINDOW_SECS] {
        let err = verifier.verify(&document, at(secs)).unwrap_err();
        assert!(matches!(err, AttestationError::UntrustedChain(_)), "{err}");
    }
}

#[test]
fn test_foreign_root_is_untrusted() {
    let attestor = SoftwareAttestor::new(TestPki::generate());
    let document = attestation::bind(&attestor, &payload("aa")).unwrap();

    let stranger = TestPki::generate().verifier();
    let err = stranger.verify(&document, at(IN_WINDOW_SECS)).unwrap_err();
    assert!(matches!(err, AttestationError::UntrustedChain(_)));
}

#[test]
fn test_tampered_signature_rejected() {
    let attestor = SoftwareAttestor::new(TestPki::generate());
    let document = attestation::bind(&attestor, &payload("aa")).unwrap();

    let mut cose = CoseSign1::from_slice(&document).unwrap();
    if let Some(last) = cose.signature.last_mut() {
        *last ^= 0x01;
    }
    let tampered = cose.to_vec().unwrap();

    // The untouched document passes, so the failure below is the signature.
    attestor.verifier().verify(&document, at(IN_WINDOW_SECS)).unwrap();
    let err = attestor.verifier().verify(&tampered, at(IN_WINDOW_SECS)).unwrap_err();
    assert!(matches!(err, AttestationError::BadSignature(_)), "{err}");
}

#[test]
fn test_replayed_document_rejected() {
    let attestor = SoftwareAttestor::new(TestPki::generate());
    let document = attestation::bind(&attestor, &payload("aaaa")).unwrap();

    let err = verify_build_report(&attestor.verifier(), &document, "bbbb", at(IN_WINDOW_SECS)).unwrap_err();
    match err {
        AttestationError::NonceMismatch { expected, actual } => {
            assert_eq!(expected, "bbbb");
            assert_eq!(actual, "aaaa");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_leaf_accepted_at_current_time() {
    let attestor = SoftwareAttestor::new(TestPki::generate());
    let payload = payload("cafe");
    let document = attestation::bind(&attestor, &payload).unwrap();

    let (_, recovered) = verify_build_report(&attestor.verifier(), &document, "cafe", std::time::SystemTime::now()).unwrap();
    assert_eq!(recovered, payload);
}

#[test]
fn test_oversized_payload_never_reaches_device() {
    let attestor = SoftwareAttestor::new(TestPki::generate());
    let mut big = payload("aa");
    big.repo = Some("x".repeat(attestation::MAX_USER_DATA));

    let err = attestation::bind(&attestor, &big).unwrap_err();
    assert!(matches!(err, AttestationError::PayloadTooLarge { .. }));
}

// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Binding build results into attestation documents, and checking them.

mod nsm;
mod verify;

pub use nsm::NsmAttestor;
pub use verify::{VerifiedDocument, Verifier, AWS_NITRO_ROOT_CA_PEM};

use serde::{Deserialize, Serialize};

/// Largest `user_data` the NSM accepts.
pub const MAX_USER_DATA: usize = 512;

/// What the worker asks the hardware to vouch for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationPayload {
    pub nonce: String,
    pub source_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub input_hash: String,
    pub output_hash: String,
    pub image_identity: String,
}

impl AttestationPayload {
    pub fn to_user_data(&self) -> Result<Vec<u8>, AttestationError> {
        serde_json::to_vec(self).map_err(AttestationError::Encode)
    }

    pub fn from_user_data(bytes: &[u8]) -> Result<Self, AttestationError> {
        serde_json::from_slice(bytes).map_err(AttestationError::Decode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("could not encode attestation payload")]
    Encode(#[source] serde_json::Error),

    #[error("attestation user data is not a build payload")]
    Decode(#[source] serde_json::Error),

    #[error("attestation payload is {size} bytes, the limit is {MAX_USER_DATA}")]
    PayloadTooLarge { size: usize },

    #[error("attestation device is unavailable")]
    DeviceUnavailable,

    #[error("attestation device rejected the request: {0}")]
    Rejected(String),

    #[error("could not parse attestation document: {0}")]
    Malformed(String),

    #[error("attestation certificate chain is not trusted: {0}")]
    UntrustedChain(String),

    #[error("attestation signature is invalid: {0}")]
    BadSignature(String),

    #[error("attestation nonce mismatch: expected {expected:?}, document has {actual:?}")]
    NonceMismatch { expected: String, actual: String },
}

/// Source of attestation documents.
pub trait Attestor: Send + Sync {
    /// Returns the raw document, unmodified.
    fn attest(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AttestationError>;
}

/// Serialize `payload` and have `attestor` sign it, using the ASCII of the
/// payload's nonce as the freshness token.
#[tracing::instrument(skip_all, fields(nonce = %payload.nonce))]
pub fn bind(attestor: &dyn Attestor, payload: &AttestationPayload) -> Result<Vec<u8>, AttestationError> {
    let user_data = payload.to_user_data()?;
    if user_data.len() > MAX_USER_DATA {
        return Err(AttestationError::PayloadTooLarge { size: user_data.len() });
    }
    let document = attestor.attest(&user_data, payload.nonce.as_bytes())?;
    tracing::debug!(size = document.len(), "Attestation document issued");
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    }

    impl Attestor for Recording {
        fn attest(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AttestationError> {
            self.calls.lock().unwrap().push((user_data.to_vec(), nonce.to_vec()));
            Ok(b"document".to_vec())
        }
    }

    fn payload() -> AttestationPayload {
        AttestationPayload {
            nonce: "00112233445566778899aabbccddeeff".into(),
            source_revision: "0123456789abcdef0123456789abcdef01234567".into(),
            repo: Some("https://github.com/example/app".into()),
            input_hash: format!("0x{}", "11".repeat(32)),
            output_hash: format!("0x{}", "22".repeat(32)),
            image_identity: "ata-build-rust".into(),
        }
    }

    #[test]
    fn test_payload_uses_camel_case() {
        let json: serde_json::Value = serde_json::from_slice(&payload().to_user_data().unwrap()).unwrap();
        for key in ["nonce", "sourceRevision", "repo", "inputHash", "outputHash", "imageIdentity"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_repo_omitted_when_unknown() {
        let mut p = payload();
        p.repo = None;
        let json = String::from_utf8(p.to_user_data().unwrap()).unwrap();
        assert!(!json.contains("repo"));
        assert_eq!(AttestationPayload::from_user_data(json.as_bytes()).unwrap(), p);
    }

    #[test]
    fn test_bind_passes_nonce_ascii() {
        let attestor = Recording::default();
        let doc = bind(&attestor, &payload()).unwrap();
        assert_eq!(doc, b"document");

        let calls = attestor.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, b"00112233445566778899aabbccddeeff");
        assert_eq!(AttestationPayload::from_user_data(&calls[0].0).unwrap(), payload());
    }

    #[test]
    fn test_oversized_payload_rejected_before_device() {
        let attestor = Recording::default();
        let mut p = payload();
        p.image_identity = "x".repeat(MAX_USER_DATA);
        let err = bind(&attestor, &p).unwrap_err();
        assert!(matches!(err, AttestationError::PayloadTooLarge { .. }));
        assert!(attestor.calls.lock().unwrap().is_empty());
    }
}

// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use coset::{CborSerializable, CoseSign1, RegisteredLabelWithPrivate};
use serde_cbor::Value as CborValue;

use super::AttestationError;

pub const AWS_NITRO_ROOT_CA_PEM: &str = r#"-----BEGIN CERTIFICATE-----
MIICETCCAZagAwIBAgIRAPkxdWgbkK/hHUbMtOTn+FYwCgYIKoZIzj0EAwMwSTEL
MAkGA1UEBhMCVVMxDzANBgNVBAoMBkFtYXpvbjEMMAoGA1UECwwDQVdTMRswGQYD
VQQDDBJhd3Mubml0cm8tZW5jbGF2ZXMwHhcNMTkxMDI4MTMyODA1WhcNNDkxMDI4
MTQyODA1WjBJMQswCQYDVQQGEwJVUzEPMA0GA1UECgwGQW1hem9uMQwwCgYDVQQL
DANBV1MxGzAZBgNVBAMMEmF3cy5uaXRyby1lbmNsYXZlczB2MBAGByqGSM49AgEG
BSuBBAAiA2IABPwCVOumCMHzaHDimtqQvkY4MpJzbolL//Zy2YlES1BR5TSksfbb
48C8WBoyt7F2Bw7eEtaaP+ohG2bnUs990d0JX28TcPQXCEPZ3BABIeTPYwEoCWZE
h8l5YoQwTcU/9KNCMEAwDwYDVR0TAQH/BAUwAwEB/zAdBgNVHQ4EFgQUkCW1DdkF
R+eWw5b6cp3PmanfS5YwDgYDVR0PAQH/BAQDAgGGMAoGCCqGSM49BAMDA2kAMGYC
MQCjfy+Rocm9Xue4YnwWmNJVA44fA0P5W2OpYow9OYCVRaEevL8uO1XYru5xtMPW
rfMCMQCi85sWBbJwKKXdS6BptQFuZbT73o/gBh1qUxl/nNr12UO8Yfwr6wPLb+6N
IwLz3/Y=
-----END CERTIFICATE-----"#;

/// The parts of an attestation document a build cares about, after the
/// signature and certificate chain have been checked.
#[derive(Debug, Clone)]
pub struct VerifiedDocument {
    pub module_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub pcrs: BTreeMap<u32, Vec<u8>>,
    pub user_data: Vec<u8>,
    pub nonce: Option<Vec<u8>>,
}

impl VerifiedDocument {
    /// PCR0, the enclave image measurement. Empty if the document has none.
    pub fn measurement(&self) -> &[u8] {
        self.pcrs.get(&0).map_or(&[], Vec::as_slice)
    }
}

/// Checks COSE_Sign1 attestation documents against a root certificate.
#[derive(Debug, Clone)]
pub struct Verifier {
    root_der: Vec<u8>,
}

impl Verifier {
    pub fn aws_nitro() -> Result<Self, AttestationError> {
        Self::from_pem(AWS_NITRO_ROOT_CA_PEM)
    }

    /// Trust the single certificate in `root_pem` instead of the AWS root.
    pub fn from_pem(root_pem: &str) -> Result<Self, AttestationError> {
        let root = pem::parse(root_pem)
            .map_err(|e| AttestationError::UntrustedChain(format!("could not parse root CA: {e}")))?;
        Ok(Self::with_root_der(root.contents().to_vec()))
    }

    pub fn with_root_der(root_der: Vec<u8>) -> Self {
        Self { root_der }
    }

    #[tracing::instrument(skip_all)]
    pub fn verify(&self, document: &[u8], now: SystemTime) -> Result<VerifiedDocument, AttestationError> {
        let cose = CoseSign1::from_slice(document)
            .map_err(|e| AttestationError::Malformed(format!("not a COSE_Sign1 structure: {e:?}")))?;
        let payload = cose
            .payload
            .as_deref()
            .ok_or_else(|| AttestationError::Malformed("COSE_Sign1 has no payload".to_string()))?;

        let fields = DocumentFields::parse(payload)?;
        self.verify_chain(&fields.certificate, &fields.cabundle, now)?;
        verify_signature(&cose, payload, &fields.certificate)?;

        tracing::debug!(module_id = %fields.module_id, "Attestation document verified");
        Ok(VerifiedDocument {
            module_id: fields.module_id,
            timestamp: fields.timestamp,
            pcrs: fields.pcrs,
            user_data: fields.user_data,
            nonce: fields.nonce,
        })
    }

    fn verify_chain(&self, leaf: &[u8], cabundle: &[Vec<u8>], now: SystemTime) -> Result<(), AttestationError> {
        let untrusted = |what: &str, e: webpki::Error| AttestationError::UntrustedChain(format!("{what}: {e:?}"));

        let anchor =
            webpki::TrustAnchor::try_from_cert_der(&self.root_der).map_err(|e| untrusted("bad trust root", e))?;
        let end_entity = webpki::EndEntityCert::try_from(leaf).map_err(|e| untrusted("bad leaf certificate", e))?;

        let seconds = now
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AttestationError::UntrustedChain(format!("verification time before epoch: {e}")))?
            .as_secs();
        let intermediates: Vec<&[u8]> = cabundle.iter().map(Vec::as_slice).collect();

        end_entity
            .verify_is_valid_tls_server_cert(
                &[&webpki::ECDSA_P384_SHA384],
                &webpki::TlsServerTrustAnchors(&[anchor]),
                &intermediates,
                webpki::Time::from_seconds_since_unix_epoch(seconds),
            )
            .map_err(|e| untrusted("chain does not validate", e))
    }
}

fn verify_signature(cose: &CoseSign1, payload: &[u8], leaf: &[u8]) -> Result<(), AttestationError> {
    let alg = cose
        .protected
        .header
        .alg
        .as_ref()
        .ok_or_else(|| AttestationError::BadSignature("no algorithm in protected header".to_string()))?;
    if *alg != RegisteredLabelWithPrivate::Assigned(coset::iana::Algorithm::ES384) {
        return Err(AttestationError::BadSignature(format!("unsupported algorithm {alg:?}")));
    }

    let (_, cert) = x509_parser::parse_x509_certificate(leaf)
        .map_err(|e| AttestationError::Malformed(format!("bad leaf certificate: {e}")))?;
    let public_key = cert.public_key().subject_public_key.data.as_ref();

    let message = coset::sig_structure_data(
        coset::SignatureContext::CoseSign1,
        cose.protected.clone(),
        None,
        &[],
        payload,
    );

    // COSE carries the raw r||s form, which is what the FIXED variant expects.
    ring::signature::UnparsedPublicKey::new(&ring::signature::ECDSA_P384_SHA384_FIXED, public_key)
        .verify(&message, &cose.signature)
        .map_err(|_| AttestationError::BadSignature("ES384 signature does not match".to_string()))
}

struct DocumentFields {
    module_id: String,
    timestamp: u64,
    pcrs: BTreeMap<u32, Vec<u8>>,
    certificate: Vec<u8>,
    cabundle: Vec<Vec<u8>>,
    user_data: Vec<u8>,
    nonce: Option<Vec<u8>>,
}

impl DocumentFields {
    fn parse(payload: &[u8]) -> Result<Self, AttestationError> {
        let malformed = |msg: &str| AttestationError::Malformed(msg.to_string());

        let doc: CborValue =
            serde_cbor::from_slice(payload).map_err(|e| AttestationError::Malformed(format!("payload is not CBOR: {e}")))?;
        let CborValue::Map(map) = doc else {
            return Err(malformed("payload is not a CBOR map"));
        };
        let get = |key: &str| map.get(&CborValue::Text(key.to_string()));

        let module_id = match get("module_id") {
            Some(CborValue::Text(id)) => id.clone(),
            _ => return Err(malformed("missing module_id")),
        };
        let timestamp = match get("timestamp") {
            Some(CborValue::Integer(ts)) => u64::try_from(*ts).map_err(|_| malformed("timestamp out of range"))?,
            _ => return Err(malformed("missing timestamp")),
        };
        let certificate = match get("certificate") {
            Some(CborValue::Bytes(der)) => der.clone(),
            _ => return Err(malformed("missing certificate")),
        };
        let cabundle = match get("cabundle") {
            Some(CborValue::Array(certs)) => certs
                .iter()
                .map(|cert| match cert {
                    CborValue::Bytes(der) => Ok(der.clone()),
                    _ => Err(malformed("cabundle entry is not a byte string")),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(malformed("missing cabundle")),
        };
        if cabundle.is_empty() {
            return Err(malformed("empty cabundle"));
        }

        let mut pcrs = BTreeMap::new();
        match get("pcrs") {
            Some(CborValue::Map(entries)) => {
                for (index, value) in entries {
                    match (index, value) {
                        (CborValue::Integer(index), CborValue::Bytes(bytes)) => {
                            let index = u32::try_from(*index).map_err(|_| malformed("PCR index out of range"))?;
                            pcrs.insert(index, bytes.clone());
                        }
                        _ => return Err(malformed("malformed PCR entry")),
                    }
                }
            }
            _ => return Err(malformed("missing pcrs")),
        }

        let optional_bytes = |key: &str| match get(key) {
            Some(CborValue::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(CborValue::Null) | None => Ok(None),
            Some(_) => Err(AttestationError::Malformed(format!("{key} is not a byte string"))),
        };

        Ok(Self {
            module_id,
            timestamp,
            pcrs,
            certificate,
            cabundle,
            user_data: optional_bytes("user_data")?.unwrap_or_default(),
            nonce: optional_bytes("nonce")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aws_root_loads() {
        let verifier = Verifier::aws_nitro().unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(&verifier.root_der).unwrap();
        assert!(cert.subject().to_string().contains("aws.nitro-enclaves"));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let verifier = Verifier::aws_nitro().unwrap();
        let err = verifier.verify(b"not cose", SystemTime::now()).unwrap_err();
        assert!(matches!(err, AttestationError::Malformed(_)));
    }

    #[test]
    fn test_measurement_defaults_to_empty() {
        let doc = VerifiedDocument {
            module_id: "i-0".into(),
            timestamp: 0,
            pcrs: BTreeMap::from([(1, vec![1; 48])]),
            user_data: Vec::new(),
            nonce: None,
        };
        assert!(doc.measurement().is_empty());
    }
}

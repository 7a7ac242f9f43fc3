// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

use std::error::Error as StdError;
use std::path::PathBuf;

use crate::attestation::AttestationError;
use crate::fingerprint::FingerprintError;
use crate::manifest::ManifestError;
use crate::readiness::BootError;
use crate::rpc::RpcError;
use crate::transport::TransportError;
use crate::vendor::VendorError;

/// Coarse classification of orchestrator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    TransientInfrastructure,
    Protocol,
    Integrity,
    Attestation,
    Worker,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid build configuration")]
    Manifest(#[from] ManifestError),

    #[error("invalid orchestrator configuration: {0}")]
    Config(String),

    #[error("transport setup failed")]
    Transport(#[from] TransportError),

    #[error("worker did not come up")]
    Boot(#[from] BootError),

    #[error("dependency vendoring failed")]
    Vendor(#[from] VendorError),

    #[error("worker rejected {call}")]
    Rpc {
        call: &'static str,
        #[source]
        source: RpcError,
    },

    #[error("could not fingerprint {what}")]
    Integrity {
        what: &'static str,
        #[source]
        source: FingerprintError,
    },

    #[error("artifact {artifact:?} does not match the attested output hash (attested {attested}, received {actual})")]
    ArtifactMismatch {
        artifact: PathBuf,
        attested: String,
        actual: String,
    },

    /// The build ran and its output was saved, but the attestation could not
    /// be verified.
    #[error("artifact produced at {artifact:?}, provenance unverifiable")]
    Unverifiable {
        artifact: PathBuf,
        #[source]
        source: AttestationError,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Manifest(_) | Self::Config(_) => ErrorKind::Configuration,
            Self::Transport(e) if e.is_configuration() => ErrorKind::Configuration,
            Self::Transport(_) => ErrorKind::Io,
            Self::Boot(BootError::TransientExhausted { .. }) => ErrorKind::TransientInfrastructure,
            Self::Boot(_) => ErrorKind::Worker,
            Self::Vendor(VendorError::Manifest(_)) => ErrorKind::Configuration,
            Self::Vendor(_) => ErrorKind::Worker,
            Self::Rpc { source, .. } if source.is_protocol() => ErrorKind::Protocol,
            Self::Rpc { .. } => ErrorKind::Io,
            Self::Integrity { .. } | Self::ArtifactMismatch { .. } => ErrorKind::Integrity,
            Self::Unverifiable { .. } => ErrorKind::Attestation,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }

    pub(crate) fn rpc(call: &'static str) -> impl FnOnce(RpcError) -> Self {
        move |source| Self::Rpc { call, source }
    }
}

/// `error: cause: cause`, the whole source chain on one line.
pub fn render_chain(error: &(dyn StdError + 'static)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_chain() {
        let err = BuildError::Io {
            context: "could not write report".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert_eq!(render_chain(&err), "could not write report: disk full");
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            BuildError::from(TransportError::UnknownScheme {
                scheme: "http".into(),
                uri: "http://x".into()
            })
            .kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            BuildError::Rpc {
                call: "/build",
                source: RpcError::Status {
                    status: 400,
                    message: "boom".into()
                }
            }
            .kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            BuildError::Unverifiable {
                artifact: "app.tar".into(),
                source: AttestationError::BadSignature("x".into())
            }
            .kind(),
            ErrorKind::Attestation
        );
        assert_eq!(
            BuildError::Boot(BootError::TransientExhausted {
                attempts: 3,
                signature: "[ E29 ] Ioctl failure"
            })
            .kind(),
            ErrorKind::TransientInfrastructure
        );
    }
}

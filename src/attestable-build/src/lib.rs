// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Attestable builds inside Nitro enclaves.
//!
//! The orchestrator ([`orchestrator::run_build`]) boots a worker, ships it the
//! source tree over HTTP on a unix, tcp or vsock transport, and gets back the
//! build output together with an attestation document binding the nonce, the
//! input and output fingerprints and the source revision. The worker side is
//! [`rpc::serve_worker`] driving [`build::run_build`].

pub mod archive;
pub mod attestation;
pub mod build;
pub mod error;
pub mod exec;
pub mod fingerprint;
pub mod git;
pub mod manifest;
pub mod orchestrator;
pub mod process;
pub mod readiness;
pub mod report;
pub mod rpc;
pub mod transport;
pub mod vendor;

pub use error::{BuildError, ErrorKind};

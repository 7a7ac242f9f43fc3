// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! The worker side of a build: unpack, fingerprint, run, fingerprint again,
//! package and attest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempPath;
use tracing::{debug, info};

use crate::archive;
use crate::attestation::{self, AttestationPayload, Attestor};
use crate::exec;
use crate::fingerprint::{self, FileSetFingerprint, ALL_ENTRIES};
use crate::git::{self, RevisionInfo};
use crate::manifest::BuildManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Unpack,
    Manifest,
    Revision,
    InputFingerprint,
    Command,
    OutputFingerprint,
    Package,
    Attestation,
}

#[derive(Debug, thiserror::Error, bon::Builder)]
#[error("build in {work_dir:?} failed at stage {stage:?}")]
pub struct BuildStageError {
    #[builder(into)]
    work_dir: PathBuf,
    stage: BuildStage,

    #[source]
    #[builder(into)]
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl BuildStageError {
    pub fn stage(&self) -> BuildStage {
        self.stage
    }
}

/// Everything the worker knows about one build.
#[derive(Debug)]
pub struct BuildSession {
    pub manifest: BuildManifest,
    pub nonce: String,
    pub revision: RevisionInfo,
    pub input: FileSetFingerprint,
    pub output: FileSetFingerprint,
}

impl BuildSession {
    pub fn payload(&self, image_identity: &str) -> AttestationPayload {
        AttestationPayload {
            nonce: self.nonce.clone(),
            source_revision: self.revision.commit.clone().unwrap_or_default(),
            repo: self.revision.repo.clone(),
            input_hash: self.input.root_hex(),
            output_hash: self.output.root_hex(),
            image_identity: image_identity.to_string(),
        }
    }
}

/// A finished build, ready to be streamed back.
#[derive(Debug)]
pub struct BuildOutcome {
    pub session: BuildSession,
    pub payload: AttestationPayload,
    /// Output archive. Removed when dropped.
    pub archive: TempPath,
    /// `None` when the worker runs without an attestation device.
    pub report: Option<Vec<u8>>,
}

/// Inputs that stay fixed for the lifetime of a worker.
#[derive(Clone, bon::Builder)]
pub struct BuildEnvironment {
    #[builder(into)]
    pub work_dir: PathBuf,
    pub attestor: Option<Arc<dyn Attestor>>,
    #[builder(into, default = String::from("unknown"))]
    pub image_identity: String,
    #[builder(default = fingerprint::DEFAULT_HASH_WORKERS)]
    pub hash_workers: usize,
}

/// Run a complete build from the source archive at `source_archive`.
#[tracing::instrument(skip_all, fields(nonce = %nonce))]
pub async fn run_build(
    env: &BuildEnvironment,
    source_archive: &Path,
    nonce: &str,
) -> Result<BuildOutcome, BuildStageError> {
    let work_dir = env.work_dir.as_path();
    let stub = BuildStageError::builder().work_dir(work_dir);

    if let Err(source) = archive::unpack_async(source_archive.to_path_buf(), work_dir.to_path_buf()).await {
        return Err(stub.stage(BuildStage::Unpack).source(source).build());
    }

    let manifest = match BuildManifest::read_from_dir(work_dir).await {
        Ok(m) => m,
        Err(source) => return Err(stub.stage(BuildStage::Manifest).source(source).build()),
    };
    let build_env = match manifest.env_pairs() {
        Ok(pairs) => pairs,
        Err(source) => return Err(stub.stage(BuildStage::Manifest).source(source).build()),
    };

    let revision = match git::read_revision(work_dir).await {
        Ok(r) => r,
        Err(source) => return Err(stub.stage(BuildStage::Revision).source(source).build()),
    };
    debug!(?revision, "Source revision");

    let input = match hash_tree(work_dir, vec![ALL_ENTRIES.to_string()], env.hash_workers).await {
        Ok(fp) => fp,
        Err(source) => return Err(stub.stage(BuildStage::InputFingerprint).source(source).build()),
    };
    info!(files = input.files.len(), input_hash = %input.root_hex(), "Input fingerprinted");

    info!(cmd = %manifest.input.cmd, "Running build command");
    if let Err(source) = exec::run_shell(&manifest.input.cmd, work_dir, &build_env).await {
        return Err(stub.stage(BuildStage::Command).source(source).build());
    }

    let output = match hash_outputs(work_dir, manifest.output.files.clone(), env.hash_workers).await {
        Ok(fp) => fp,
        Err(source) => return Err(stub.stage(BuildStage::OutputFingerprint).source(source).build()),
    };
    info!(files = ?output.files, output_hash = %output.root_hex(), "Output fingerprinted");

    let archive = match package_outputs(work_dir, &output.files).await {
        Ok(path) => path,
        Err(source) => return Err(stub.stage(BuildStage::Package).source(source).build()),
    };

    let session = BuildSession {
        manifest,
        nonce: nonce.to_string(),
        revision,
        input,
        output,
    };
    let payload = session.payload(&env.image_identity);

    let report = match &env.attestor {
        Some(attestor) => {
            let attestor = Arc::clone(attestor);
            let bind_payload = payload.clone();
            let bound = tokio::task::spawn_blocking(move || attestation::bind(attestor.as_ref(), &bind_payload))
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
                .and_then(|r| r.map_err(Into::into));
            match bound {
                Ok(document) => Some(document),
                Err(source) => return Err(stub.stage(BuildStage::Attestation).source(source).build()),
            }
        }
        None => {
            info!("No attestation device configured, returning unattested output");
            None
        }
    };

    Ok(BuildOutcome {
        session,
        payload,
        archive,
        report,
    })
}

async fn hash_tree(
    root: &Path,
    patterns: Vec<String>,
    workers: usize,
) -> Result<FileSetFingerprint, Box<dyn std::error::Error + Send + Sync>> {
    let root = root.to_path_buf();
    let fp = tokio::task::spawn_blocking(move || fingerprint::fingerprint(&root, &patterns, workers, None)).await??;
    Ok(fp)
}

async fn hash_outputs(
    root: &Path,
    patterns: Vec<String>,
    workers: usize,
) -> Result<FileSetFingerprint, Box<dyn std::error::Error + Send + Sync>> {
    let root = root.to_path_buf();
    let fp =
        tokio::task::spawn_blocking(move || fingerprint::fingerprint_with_subtrees(&root, &patterns, workers, None))
            .await??;
    Ok(fp)
}

async fn package_outputs(
    root: &Path,
    files: &[String],
) -> Result<TempPath, Box<dyn std::error::Error + Send + Sync>> {
    let archive = tempfile::Builder::new()
        .prefix("worker-output-")
        .suffix(".tar")
        .tempfile()?
        .into_temp_path();
    archive::pack_entries_async(root.to_path_buf(), files.to_vec(), archive.to_path_buf()).await?;
    Ok(archive)
}

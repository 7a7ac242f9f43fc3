// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Host side of a build.
//!
//! [`run_build`] drives one complete session: serve the log sink, vendor
//! dependencies in a container if the manifest asks for it, pack the source,
//! boot the worker (enclave or local process), upload vendor archives and the
//! source, save the returned artifact and check its attestation.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive;
use crate::attestation::{AttestationError, AttestationPayload, VerifiedDocument, Verifier};
use crate::error::BuildError;
use crate::exec;
use crate::fingerprint::{self, FileSetFingerprint};
use crate::manifest::BuildManifest;
use crate::process::{ProcessSpec, SpawnError, SupervisedProcess};
use crate::readiness::{self, BootPolicy, BootedWorker, LaunchedWorker, ReadinessProbe, WorkerLauncher};
use crate::report;
use crate::rpc::{serve_log_sink, BuildResponse, RpcClient, RpcError};
use crate::transport::{self, Transport, WORKER_PORT};
use crate::vendor::VendorIndex;

/// Where the vendor container sees the source tree.
const VENDOR_CONTAINER_CODE_DIR: &str = "/workspace/code";
/// Where the vendor container writes archives and their index.
const VENDOR_CONTAINER_OUT_DIR: &str = "/tmp/vendor";

/// How the worker is started.
#[derive(Debug, Clone)]
pub enum WorkerMode {
    /// Boot an enclave image with `nitro-cli`.
    Enclave {
        eif: PathBuf,
        memory_mib: u64,
        cpu_count: u32,
        /// Used for the first attempt only; retries always pick a fresh CID.
        cid: Option<u32>,
    },
    /// Run `<program> worker` as a plain child process, without attestation.
    Local { program: PathBuf },
}

#[derive(Debug, bon::Builder)]
pub struct OrchestratorConfig {
    #[builder(into)]
    pub work_dir: PathBuf,
    pub manifest: BuildManifest,
    /// Where the log sink listens.
    pub listen: Transport,
    pub mode: WorkerMode,
    /// Path prefix for `.tar`, `.report` and `.txt`.
    #[builder(into)]
    pub output: PathBuf,
    #[builder(into)]
    pub nonce: String,
    /// Attach the enclave console instead of relaying logs.
    #[builder(default)]
    pub debug: bool,
    #[builder(into)]
    pub vendor_image: String,
    #[builder(default)]
    pub boot_policy: BootPolicy,
    pub verifier: Verifier,
    /// How long to wait for the worker to exit on its own after the build.
    #[builder(default = Duration::from_secs(30))]
    pub worker_exit_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn artifact_path(&self) -> PathBuf {
        with_suffix(&self.output, ".tar")
    }

    pub fn report_path(&self) -> PathBuf {
        with_suffix(&self.output, ".report")
    }

    pub fn summary_path(&self) -> PathBuf {
        with_suffix(&self.output, ".txt")
    }
}

/// What a successful build left behind.
#[derive(Debug)]
pub struct BuildSummary {
    pub artifact: PathBuf,
    pub artifact_size: u64,
    /// `None` when the worker ran without attestation.
    pub report_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
    pub verified: Option<VerifiedDocument>,
    pub payload: Option<AttestationPayload>,
    pub boot_attempts: u32,
}

/// Lowercase hex of 16 random bytes.
pub fn generate_nonce() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// A random enclave CID with the high bit set, clear of the reserved range.
pub fn random_cid() -> u32 {
    rand::random::<u32>() | 1 << 31
}

/// `~/ata-build-<language>-latest.eif`
pub fn default_eif_path(home: &Path, language: &str) -> PathBuf {
    home.join(format!("ata-build-{language}-latest.eif"))
}

pub fn default_vendor_image(language: &str) -> String {
    format!("ata-build-{language}")
}

/// Four times the image size, rounded up to whole MiB first.
pub fn default_memory_mib(eif_size: u64) -> u64 {
    eif_size.div_ceil(1024 * 1024) * 4
}

/// Base name of the working directory, `output` if it has none.
pub fn default_output_name(work_dir: &Path) -> String {
    work_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string())
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Launches `nitro-cli run-enclave`, one fresh CID per retry.
pub struct EnclaveLauncher {
    eif: PathBuf,
    memory_mib: u64,
    cpu_count: u32,
    first_cid: Option<u32>,
    debug: bool,
}

impl EnclaveLauncher {
    pub fn new(eif: PathBuf, memory_mib: u64, cpu_count: u32, cid: Option<u32>, debug: bool) -> Self {
        Self {
            eif,
            memory_mib,
            cpu_count,
            first_cid: cid,
            debug,
        }
    }

    pub fn spec(&self, cid: u32) -> ProcessSpec {
        let mut args: Vec<std::ffi::OsString> = vec![
            "run-enclave".into(),
            "--cpu-count".into(),
            self.cpu_count.to_string().into(),
            "--memory".into(),
            self.memory_mib.to_string().into(),
            "--enclave-cid".into(),
            cid.to_string().into(),
            "--eif-path".into(),
            self.eif.clone().into(),
        ];
        if self.debug {
            args.push("--debug-mode".into());
            args.push("--attach-console".into());
        }
        ProcessSpec::builder().program("nitro-cli").args(args).build()
    }
}

#[async_trait]
impl WorkerLauncher for EnclaveLauncher {
    async fn launch(&mut self, attempt: u32) -> Result<LaunchedWorker, SpawnError> {
        let cid = match (attempt, self.first_cid) {
            (1, Some(cid)) => cid,
            _ => random_cid(),
        };
        let spec = self.spec(cid);
        info!(cid, command = %spec.command_line(), "Starting enclave");
        Ok(LaunchedWorker {
            process: SupervisedProcess::start(&spec)?,
            endpoint: Transport::vsock(cid, WORKER_PORT),
            // Without the console attached nitro-cli returns once the enclave runs.
            detaches: !self.debug,
        })
    }
}

/// Runs the worker as a child of this process on a loopback port.
pub struct LocalLauncher {
    program: PathBuf,
    work_dir: Option<TempDir>,
}

impl LocalLauncher {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            work_dir: None,
        }
    }
}

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    async fn launch(&mut self, _attempt: u32) -> Result<LaunchedWorker, SpawnError> {
        let command_line = format!("{} worker", self.program.display());
        let spawn_err = |source| SpawnError::new(command_line.as_str(), source);

        let port = transport::pick_loopback_port().map_err(spawn_err)?;
        let work_dir = tempfile::Builder::new()
            .prefix("attestable-build-worker-")
            .tempdir()
            .map_err(spawn_err)?;
        let endpoint = Transport::Tcp(format!("127.0.0.1:{port}"));

        let spec = ProcessSpec::builder()
            .program(self.program.clone())
            .args(vec![
                "worker".into(),
                "--listen".into(),
                endpoint.to_string().into(),
                "--attestation".into(),
                "none".into(),
                "--dir".into(),
                work_dir.path().into(),
            ])
            .build();
        let process = SupervisedProcess::start(&spec)?;
        // Replacing the previous attempt's directory removes it.
        self.work_dir = Some(work_dir);

        Ok(LaunchedWorker {
            process,
            endpoint,
            detaches: false,
        })
    }
}

/// Probes `/ping`, telling the worker where to send its logs.
pub struct RpcProbe {
    log_host: String,
    relay: bool,
}

impl RpcProbe {
    pub fn new(log_host: String, relay: bool) -> Self {
        Self { log_host, relay }
    }
}

#[async_trait]
impl ReadinessProbe for RpcProbe {
    async fn probe(&self, endpoint: &Transport) -> Result<(), RpcError> {
        RpcClient::new(endpoint.clone())
            .ping(Some(&self.log_host), self.relay)
            .await
    }
}

/// Run one attestable build from start to finish.
#[tracing::instrument(skip_all, fields(work_dir = ?config.work_dir, nonce = %config.nonce))]
pub async fn run_build(config: &OrchestratorConfig) -> Result<BuildSummary, BuildError> {
    if config.nonce.is_empty() {
        return Err(BuildError::Config("nonce must not be empty".to_string()));
    }

    let sink_listener = config.listen.bind().await?;
    let log_host = sink_listener.dial_address()?.to_string();
    let sink_shutdown = CancellationToken::new();
    let sink = serve_log_sink(sink_listener, sink_shutdown.clone());
    info!(%log_host, "Serving worker logs");

    let result = run_session(config, &log_host).await;

    sink_shutdown.cancel();
    match sink.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("log sink stopped with an error: {e}"),
        Err(e) => warn!("log sink task failed: {e}"),
    }
    result
}

async fn run_session(config: &OrchestratorConfig, log_host: &str) -> Result<BuildSummary, BuildError> {
    let vendor_dir = tempfile::Builder::new()
        .prefix("attestable-build-vendor-")
        .tempdir()
        .map_err(BuildError::io("could not create vendor directory"))?;
    let vendored = match &config.manifest.input.vendor {
        Some(_) => vendor_in_container(config, vendor_dir.path()).await?,
        None => VendorIndex::default(),
    };

    let source = tempfile::Builder::new()
        .prefix("attestable-build-source-")
        .suffix(".tar")
        .tempfile()
        .map_err(BuildError::io("could not create source archive"))?
        .into_temp_path();
    let exclude = [config.artifact_path(), config.report_path(), config.summary_path()]
        .iter()
        .filter_map(|path| path.strip_prefix(&config.work_dir).ok().map(Path::to_path_buf))
        .collect();
    archive::pack_dir_async(config.work_dir.clone(), source.to_path_buf(), exclude)
        .await
        .map_err(|e| BuildError::Io {
            context: format!("could not pack {:?}", config.work_dir),
            source: std::io::Error::other(crate::error::render_chain(&e)),
        })?;
    info!(archive = ?source, "Packed source");

    let mut launcher: Box<dyn WorkerLauncher> = match &config.mode {
        WorkerMode::Enclave {
            eif,
            memory_mib,
            cpu_count,
            cid,
        } => Box::new(EnclaveLauncher::new(
            eif.clone(),
            *memory_mib,
            *cpu_count,
            *cid,
            config.debug,
        )),
        WorkerMode::Local { program } => Box::new(LocalLauncher::new(program.clone())),
    };
    let probe = RpcProbe::new(log_host.to_string(), !config.debug);
    let booted = readiness::boot_worker(launcher.as_mut(), &probe, &config.boot_policy).await?;

    let teardown = match (&config.mode, &booted.endpoint) {
        (WorkerMode::Enclave { .. }, Transport::Vsock { cid: Some(cid), .. }) => Some(EnclaveTeardown::find(*cid).await),
        _ => None,
    };
    let result = drive_worker(config, &booted, &vendored, &source).await;
    if let Some(teardown) = teardown {
        teardown.terminate().await;
    }
    let response = result?;
    let artifact = config.artifact_path();

    let mut summary = BuildSummary {
        artifact: artifact.clone(),
        artifact_size: response.archive_size,
        report_path: None,
        summary_path: None,
        verified: None,
        payload: None,
        boot_attempts: booted.attempts,
    };

    let Some(document) = response.report else {
        if matches!(config.mode, WorkerMode::Enclave { .. }) {
            return Err(BuildError::Unverifiable {
                artifact,
                source: AttestationError::Malformed("worker returned no attestation document".to_string()),
            });
        }
        info!("Local worker, no attestation to verify");
        return Ok(summary);
    };

    let report_path = config.report_path();
    tokio::fs::write(&report_path, &document)
        .await
        .map_err(BuildError::io(format!("could not write {report_path:?}")))?;
    summary.report_path = Some(report_path);

    let (verified, payload) = match verify_build_report(&config.verifier, &document, &config.nonce, SystemTime::now())
    {
        Ok(checked) => checked,
        Err(source) => return Err(BuildError::Unverifiable { artifact, source }),
    };

    check_artifact(&artifact, &payload.output_hash).await?;

    let summary_path = config.summary_path();
    tokio::fs::write(&summary_path, report::render_markdown(&verified))
        .await
        .map_err(BuildError::io(format!("could not write {summary_path:?}")))?;
    info!(
        measurement = %hex::encode(verified.measurement()),
        output_hash = %payload.output_hash,
        "Attestation verified"
    );

    summary.summary_path = Some(summary_path);
    summary.verified = Some(verified);
    summary.payload = Some(payload);
    Ok(summary)
}

/// Upload vendor archives, run the build and wait for the worker to finish.
async fn drive_worker(
    config: &OrchestratorConfig,
    booted: &BootedWorker,
    vendored: &VendorIndex,
    source: &Path,
) -> Result<BuildResponse, BuildError> {
    let client = RpcClient::new(booted.endpoint.clone());
    for entry in &vendored.archives {
        info!(archive = ?entry.archive, target = ?entry.target, "Uploading vendor archive");
        client
            .upload_vendor(&entry.archive, &entry.target)
            .await
            .map_err(BuildError::rpc("/vendor"))?;
    }

    let artifact = config.artifact_path();
    let response = client
        .build(source, &config.nonce, &artifact)
        .await
        .map_err(BuildError::rpc("/build"))?;
    info!(?artifact, size = response.archive_size, "Saved build artifact");

    wait_for_worker(&booted.process, config.worker_exit_timeout).await;
    Ok(response)
}

/// Rehash the received artifact and compare it with the attested output hash.
async fn check_artifact(artifact: &Path, attested: &str) -> Result<(), BuildError> {
    let path = artifact.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || archive_fingerprint(&path))
        .await
        .map_err(|e| BuildError::Io {
            context: "artifact check panicked".to_string(),
            source: std::io::Error::other(e),
        })??;

    if actual.root_hex() != attested {
        return Err(BuildError::ArtifactMismatch {
            artifact: artifact.to_path_buf(),
            attested: attested.to_string(),
            actual: actual.root_hex(),
        });
    }
    debug!(output_hash = %attested, "Artifact matches attested output");
    Ok(())
}

/// Fingerprint exactly the entries of a tar archive, as the worker did
/// before packing them.
pub fn archive_fingerprint(archive: &Path) -> Result<FileSetFingerprint, BuildError> {
    let scratch = tempfile::Builder::new()
        .prefix("attestable-build-check-")
        .tempdir()
        .map_err(BuildError::io("could not create scratch directory"))?;
    archive::unpack(archive, scratch.path()).map_err(|e| BuildError::Io {
        context: format!("could not unpack {archive:?}"),
        source: std::io::Error::other(crate::error::render_chain(&e)),
    })?;
    let entries = archive::list_entries(archive).map_err(BuildError::io(format!("could not read {archive:?}")))?;

    fingerprint::fingerprint_paths(scratch.path(), entries, fingerprint::DEFAULT_HASH_WORKERS, None).map_err(
        |source| BuildError::Integrity {
            what: "the received artifact",
            source,
        },
    )
}

#[derive(Debug, serde::Deserialize)]
struct DescribedEnclave {
    #[serde(rename = "EnclaveID")]
    enclave_id: String,
    #[serde(rename = "EnclaveCID")]
    enclave_cid: u64,
}

/// ID of the enclave running with `cid` in `nitro-cli describe-enclaves`
/// output.
fn enclave_id_for_cid(describe: &str, cid: u32) -> Option<String> {
    let enclaves: Vec<DescribedEnclave> = match serde_json::from_str(describe) {
        Ok(enclaves) => enclaves,
        Err(e) => {
            warn!("could not parse nitro-cli describe-enclaves output: {e}");
            return None;
        }
    };
    enclaves
        .into_iter()
        .find(|enclave| enclave.enclave_cid == u64::from(cid))
        .map(|enclave| enclave.enclave_id)
}

fn terminate_args(enclave_id: &str) -> [&str; 3] {
    ["terminate-enclave", "--enclave-id", enclave_id]
}

/// An enclave that outlives `nitro-cli run-enclave`. Terminated explicitly
/// when the session ends, or on drop if the session is abandoned.
struct EnclaveTeardown {
    enclave_id: Option<String>,
}

impl EnclaveTeardown {
    async fn find(cid: u32) -> Self {
        let output = tokio::process::Command::new("nitro-cli")
            .arg("describe-enclaves")
            .stdin(std::process::Stdio::null())
            .output()
            .await;
        let enclave_id = match output {
            Ok(output) if output.status.success() => enclave_id_for_cid(&String::from_utf8_lossy(&output.stdout), cid),
            Ok(output) => {
                warn!(status = %output.status, "nitro-cli describe-enclaves failed");
                None
            }
            Err(e) => {
                warn!("could not run nitro-cli describe-enclaves: {e}");
                None
            }
        };
        match &enclave_id {
            Some(id) => debug!(cid, enclave_id = %id, "Tracking enclave"),
            None => warn!(cid, "No enclave found for CID, it will not be terminated"),
        }
        Self { enclave_id }
    }

    async fn terminate(mut self) {
        let Some(id) = self.enclave_id.take() else {
            return;
        };
        let output = tokio::process::Command::new("nitro-cli")
            .args(terminate_args(&id))
            .stdin(std::process::Stdio::null())
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => info!(enclave_id = %id, "Terminated enclave"),
            // Normal after a successful build: the enclave already shut down.
            Ok(output) => debug!(enclave_id = %id, status = %output.status, "Enclave was not running"),
            Err(e) => warn!(enclave_id = %id, "could not run nitro-cli terminate-enclave: {e}"),
        }
    }
}

impl Drop for EnclaveTeardown {
    fn drop(&mut self) {
        let Some(id) = self.enclave_id.take() else {
            return;
        };
        warn!(enclave_id = %id, "Build session abandoned, terminating enclave");
        let spawned = std::process::Command::new("nitro-cli")
            .args(terminate_args(&id))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            warn!(enclave_id = %id, "could not run nitro-cli terminate-enclave: {e}");
        }
    }
}

/// Run `attestable-build vendor` inside the language's vendor image, with
/// the source tree and `out_dir` mounted, and read back the index it wrote.
#[tracing::instrument(skip_all, fields(image = %config.vendor_image))]
async fn vendor_in_container(config: &OrchestratorConfig, out_dir: &Path) -> Result<VendorIndex, BuildError> {
    let vendor_mount = format!("{}:{VENDOR_CONTAINER_OUT_DIR}", out_dir.display());
    let code_mount = format!("{}:{VENDOR_CONTAINER_CODE_DIR}", config.work_dir.display());
    exec::run(
        "docker",
        [
            "run",
            "--rm",
            "-v",
            vendor_mount.as_str(),
            "-v",
            code_mount.as_str(),
            config.vendor_image.as_str(),
            "attestable-build",
            "vendor",
            "--dir",
            VENDOR_CONTAINER_CODE_DIR,
            "--out",
            VENDOR_CONTAINER_OUT_DIR,
        ],
    )
    .await
    .map_err(|e| BuildError::Vendor(e.into()))?;

    let index = VendorIndex::read(out_dir).await?;
    debug!(archives = index.archives.len(), "Vendoring finished");
    Ok(index)
}

async fn wait_for_worker(process: &SupervisedProcess, timeout: Duration) {
    match tokio::time::timeout(timeout, process.done()).await {
        Ok(exit) => debug!(%exit, "Worker exited"),
        Err(_) => {
            warn!(?timeout, "Worker did not exit after the build, killing it");
            process.kill();
        }
    }
}

/// Verify `document` and check that it was issued for `nonce`.
pub fn verify_build_report(
    verifier: &Verifier,
    document: &[u8],
    nonce: &str,
    now: SystemTime,
) -> Result<(VerifiedDocument, AttestationPayload), AttestationError> {
    let verified = verifier.verify(document, now)?;

    let document_nonce = verified.nonce.as_deref().unwrap_or_default();
    if document_nonce != nonce.as_bytes() {
        return Err(AttestationError::NonceMismatch {
            expected: nonce.to_string(),
            actual: String::from_utf8_lossy(document_nonce).into_owned(),
        });
    }

    let payload = AttestationPayload::from_user_data(&verified.user_data)?;
    if payload.nonce != nonce {
        return Err(AttestationError::NonceMismatch {
            expected: nonce.to_string(),
            actual: payload.nonce,
        });
    }
    Ok((verified, payload))
}

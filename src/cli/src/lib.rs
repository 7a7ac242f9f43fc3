// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attestable_build::attestation::{Attestor, NsmAttestor, Verifier};
use attestable_build::build::BuildEnvironment;
use attestable_build::manifest::BuildManifest;
use attestable_build::orchestrator::{self, OrchestratorConfig, WorkerMode};
use attestable_build::readiness::BootPolicy;
use attestable_build::rpc::{serve_worker, LogRelay, WorkerState};
use attestable_build::transport::Transport;
use attestable_build::vendor::{self, VendorRegistry};
use attestable_build::report;

#[derive(Parser)]
#[command(name = "attestable-build")]
#[command(version)]
#[command(about = "Build source code inside a Nitro enclave and get back an attested artifact")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Build the project in --dir inside a freshly booted worker")]
    Build(BuildArgs),
    #[command(about = "Serve the worker protocol (runs inside the enclave)")]
    Worker(WorkerArgs),
    #[command(about = "Vendor dependencies (runs inside the vendor container)")]
    Vendor(VendorArgs),
    #[command(about = "Verify a saved attestation document and print it")]
    Report {
        #[arg(help = "Path to a .report file")]
        file: PathBuf,
        #[arg(long, help = "PEM root certificate to trust instead of the AWS Nitro root")]
        root_ca: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[arg(long, default_value = ".", env = "ATB_WORKDIR", help = "Project directory containing build.json")]
    dir: PathBuf,
    #[arg(long, env = "ATB_LISTEN", help = "Where to serve worker logs [default: vsock://:0, tcp://127.0.0.1:0 with --local]")]
    listen: Option<String>,
    #[arg(long, env = "ATB_VENDOR_IMAGE", help = "Vendor container image [default: ata-build-<language>]")]
    vendor_image: Option<String>,
    #[arg(long, env = "ATB_EIF", help = "Enclave image [default: ~/ata-build-<language>-latest.eif]")]
    eif: Option<PathBuf>,
    #[arg(long, help = "Enclave memory in MiB [default: 4x the image size]")]
    mem: Option<u64>,
    #[arg(long, default_value_t = 2, help = "Enclave vCPUs")]
    cpu: u32,
    #[arg(long, help = "Enclave CID for the first boot attempt [default: random]")]
    cid: Option<u32>,
    #[arg(long, help = "Output name, written as <name>.tar/.report/.txt in --dir [default: directory name]")]
    output: Option<String>,
    #[arg(long, help = "Hex nonce to bind into the attestation [default: random]")]
    nonce: Option<String>,
    #[arg(long, help = "Boot the enclave in debug mode with its console attached")]
    debug: bool,
    #[arg(long, help = "Run the worker as a local process instead of an enclave (no attestation)")]
    local: bool,
    #[arg(long, help = "Give up after this many transient boot failures [default: never]")]
    max_boot_attempts: Option<u32>,
    #[arg(long, help = "PEM root certificate to trust instead of the AWS Nitro root")]
    root_ca: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(long, default_value = "vsock://:12345", env = "ATB_LISTEN", help = "Address to serve on")]
    listen: String,
    #[arg(long, default_value = ".", env = "ATB_WORKDIR", help = "Directory to build in")]
    dir: PathBuf,
    #[arg(long, value_enum, default_value_t = AttestationSource::Nsm, help = "Where attestation documents come from")]
    attestation: AttestationSource,
    #[arg(long, default_value = "unknown", env = "ATB_IMAGE", help = "Identity of the image this worker runs in")]
    image: String,
    #[arg(long, default_value_t = attestable_build::fingerprint::DEFAULT_HASH_WORKERS, help = "Hashing threads")]
    hash_workers: usize,
}

#[derive(Args, Debug)]
struct VendorArgs {
    #[arg(long, default_value = ".", help = "Project directory containing build.json")]
    dir: PathBuf,
    #[arg(long, default_value = "/tmp/vendor", help = "Where to write vendor archives and vendor.json")]
    out: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AttestationSource {
    /// The Nitro Secure Module.
    Nsm,
    /// No attestation; builds come back without a report.
    None,
}

fn init_tracing<W>(writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "attestable_build=info,cli=info,build=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .init();
}

fn load_verifier(root_ca: Option<&Path>) -> Result<Verifier> {
    let verifier = match root_ca {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read root certificate {}", path.display()))?;
            Verifier::from_pem(&pem)?
        }
        None => Verifier::aws_nitro()?,
    };
    Ok(verifier)
}

async fn build(args: BuildArgs) -> Result<()> {
    let work_dir = std::fs::canonicalize(&args.dir)
        .with_context(|| format!("Project directory {} not found", args.dir.display()))?;
    let manifest = BuildManifest::read_from_dir(&work_dir)
        .await
        .context("Failed to load build configuration")?;

    let nonce = match args.nonce {
        Some(nonce) => {
            if nonce.is_empty() || hex::decode(&nonce).is_err() {
                bail!("--nonce must be a non-empty hex string, got {nonce:?}");
            }
            nonce.to_lowercase()
        }
        None => orchestrator::generate_nonce(),
    };

    let mode = if args.local {
        WorkerMode::Local {
            program: std::env::current_exe().context("Could not locate own executable")?,
        }
    } else {
        let eif = match args.eif {
            Some(eif) => eif,
            None => {
                let home = dirs::home_dir().context("Could not determine home directory for the default --eif")?;
                orchestrator::default_eif_path(&home, &manifest.language)
            }
        };
        let memory_mib = match args.mem {
            Some(mem) => mem,
            None => {
                let size = std::fs::metadata(&eif)
                    .with_context(|| format!("Enclave image {} not found", eif.display()))?
                    .len();
                orchestrator::default_memory_mib(size)
            }
        };
        WorkerMode::Enclave {
            eif,
            memory_mib,
            cpu_count: args.cpu,
            cid: args.cid,
        }
    };

    let listen = args.listen.unwrap_or_else(|| {
        if args.local { "tcp://127.0.0.1:0" } else { "vsock://:0" }.to_string()
    });
    let listen = Transport::parse(&listen).context("Invalid --listen")?;

    let output_name = args
        .output
        .unwrap_or_else(|| orchestrator::default_output_name(&work_dir));
    let vendor_image = args
        .vendor_image
        .unwrap_or_else(|| orchestrator::default_vendor_image(&manifest.language));

    let config = OrchestratorConfig::builder()
        .output(work_dir.join(output_name))
        .work_dir(work_dir)
        .manifest(manifest)
        .listen(listen)
        .mode(mode)
        .nonce(nonce)
        .debug(args.debug)
        .vendor_image(vendor_image)
        .boot_policy(BootPolicy {
            max_attempts: args.max_boot_attempts,
            ..BootPolicy::default()
        })
        .verifier(load_verifier(args.root_ca.as_deref())?)
        .build();

    let summary = orchestrator::run_build(&config).await?;

    println!("Artifact: {}", summary.artifact.display());
    if let Some(report_path) = &summary.report_path {
        println!("Report:   {}", report_path.display());
    }
    if let Some(summary_path) = &summary.summary_path {
        println!("Summary:  {}", summary_path.display());
    }
    if let Some(verified) = &summary.verified {
        println!("PCR0:     0x{}", hex::encode(verified.measurement()));
    }
    if let Some(payload) = &summary.payload {
        println!("Output:   {}", payload.output_hash);
    }
    Ok(())
}

async fn worker(args: WorkerArgs, relay: LogRelay) -> Result<()> {
    tokio::fs::create_dir_all(&args.dir)
        .await
        .with_context(|| format!("Failed to create {}", args.dir.display()))?;
    let work_dir = std::fs::canonicalize(&args.dir)?;

    let attestor: Option<Arc<dyn Attestor>> = match args.attestation {
        AttestationSource::Nsm => Some(Arc::new(NsmAttestor)),
        AttestationSource::None => None,
    };
    let env = BuildEnvironment::builder()
        .work_dir(work_dir)
        .maybe_attestor(attestor)
        .image_identity(args.image)
        .hash_workers(args.hash_workers)
        .build();

    let listener = Transport::parse(&args.listen)
        .context("Invalid --listen")?
        .bind()
        .await
        .context("Failed to start worker listener")?;
    tracing::info!(listen = %args.listen, "Worker listening");

    let state = Arc::new(WorkerState::new(env, Some(relay)));
    serve_worker(listener, state).await.context("Worker server failed")?;
    Ok(())
}

async fn vendor(args: VendorArgs) -> Result<()> {
    let manifest = BuildManifest::read_from_dir(&args.dir)
        .await
        .context("Failed to load build configuration")?;
    tokio::fs::create_dir_all(&args.out)
        .await
        .with_context(|| format!("Failed to create {}", args.out.display()))?;

    let registry = VendorRegistry::builtin();
    let index = vendor::vendor_dependencies(&registry, &manifest, &args.dir, &args.out).await?;
    for entry in &index.archives {
        println!("{} -> {}", entry.archive.display(), entry.target.display());
    }
    Ok(())
}

fn verify_report(file: &Path, root_ca: Option<&Path>) -> Result<()> {
    let document = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let verified = load_verifier(root_ca)?
        .verify(&document, SystemTime::now())
        .with_context(|| format!("{} did not verify", file.display()))?;
    print!("{}", report::render_markdown(&verified));
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Worker(args) => {
            let relay = LogRelay::new();
            init_tracing(relay.clone());
            worker(args, relay).await?;
        }
        Commands::Build(args) => {
            init_tracing(std::io::stdout);
            build(args).await?;
        }
        Commands::Vendor(args) => {
            init_tracing(std::io::stdout);
            vendor(args).await?;
        }
        Commands::Report { file, root_ca } => {
            init_tracing(std::io::stderr);
            verify_report(&file, root_ca.as_deref())?;
        }
    }

    Ok(())
}

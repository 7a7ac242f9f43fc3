// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! The boot loop against real child processes and a real worker endpoint.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use attestable_build::build::BuildEnvironment;
use attestable_build::orchestrator::RpcProbe;
use attestable_build::process::{ExitState, ProcessSpec, SpawnError, SupervisedProcess};
use attestable_build::readiness::{boot_worker, BootError, BootPolicy, LaunchedWorker, WorkerLauncher};
use attestable_build::rpc::{serve_worker, WorkerState};
use attestable_build::transport::Transport;
use tokio_util::sync::CancellationToken;

const IOCTL_FAILURE: &str = "echo '[ E29 ] Ioctl failure. Such error is used as a general ioctl error.' >&2; exit 39";

/// Runs `scripts[attempt - 1]` (the last one repeats). Attempts before
/// `serving_from` point at a port nobody listens on.
struct ScriptedLauncher {
    scripts: Vec<&'static str>,
    serving_from: u32,
    worker: Transport,
    launches: Arc<AtomicU32>,
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(&mut self, attempt: u32) -> Result<LaunchedWorker, SpawnError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts[(attempt as usize - 1).min(self.scripts.len() - 1)];
        let spec = ProcessSpec::builder()
            .program("sh")
            .args(vec!["-c".into(), script.into()])
            .build();
        let endpoint = if attempt >= self.serving_from {
            self.worker.clone()
        } else {
            Transport::Tcp("127.0.0.1:1".to_string())
        };
        Ok(LaunchedWorker {
            process: SupervisedProcess::start(&spec)?,
            endpoint,
            detaches: false,
        })
    }
}

fn fast_policy() -> BootPolicy {
    BootPolicy {
        initial_probe: Duration::from_millis(50),
        probe_interval: Duration::from_millis(50),
        transient_backoff: Duration::from_millis(50),
        max_attempts: None,
    }
}

/// A worker serving `/ping` on a loopback port.
async fn live_worker() -> (Transport, CancellationToken, tempfile::TempDir) {
    let work_dir = tempfile::tempdir().unwrap();
    let env = BuildEnvironment::builder().work_dir(work_dir.path()).build();
    let state = WorkerState::new(env, None);
    let shutdown = state.shutdown_token();

    let listener = Transport::parse("tcp://127.0.0.1:0").unwrap().bind().await.unwrap();
    let endpoint = listener.dial_address().unwrap();
    tokio::spawn(serve_worker(listener, Arc::new(state)));
    (endpoint, shutdown, work_dir)
}

#[tokio::test]
async fn test_two_transient_failures_then_ready() {
    let (endpoint, shutdown, _dir) = live_worker().await;
    let launches = Arc::new(AtomicU32::new(0));
    let mut launcher = ScriptedLauncher {
        scripts: vec![IOCTL_FAILURE, IOCTL_FAILURE, "sleep 30"],
        serving_from: 3,
        worker: endpoint,
        launches: launches.clone(),
    };
    let probe = RpcProbe::new("tcp://127.0.0.1:9".to_string(), false);

    let booted = boot_worker(&mut launcher, &probe, &fast_policy()).await.unwrap();
    assert_eq!(booted.attempts, 3);
    assert_eq!(launches.load(Ordering::SeqCst), 3);

    booted.process.kill();
    assert_eq!(booted.process.done().await, ExitState::Killed);
    shutdown.cancel();
}

#[tokio::test]
async fn test_exit_39_with_other_stderr_is_fatal() {
    let (endpoint, shutdown, _dir) = live_worker().await;
    let launches = Arc::new(AtomicU32::new(0));
    let mut launcher = ScriptedLauncher {
        scripts: vec!["echo '[ E11 ] Mmap failure' >&2; exit 39"],
        serving_from: 2,
        worker: endpoint,
        launches: launches.clone(),
    };
    let probe = RpcProbe::new("tcp://127.0.0.1:9".to_string(), false);

    let err = boot_worker(&mut launcher, &probe, &fast_policy()).await.err().unwrap();
    match err {
        BootError::Exited { exit, stderr, .. } => {
            assert_eq!(exit, ExitState::Exited(39));
            assert!(stderr.contains("Mmap failure"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    shutdown.cancel();
}

#[tokio::test]
async fn test_boot_failure_signature_needs_exit_39() {
    let (endpoint, shutdown, _dir) = live_worker().await;
    let mut launcher = ScriptedLauncher {
        scripts: vec!["echo '[ E36 ] Enclave boot failure' >&2; exit 1"],
        serving_from: 2,
        worker: endpoint,
        launches: Arc::new(AtomicU32::new(0)),
    };
    let probe = RpcProbe::new("tcp://127.0.0.1:9".to_string(), false);

    let err = boot_worker(&mut launcher, &probe, &fast_policy()).await.err().unwrap();
    assert!(matches!(err, BootError::Exited { exit: ExitState::Exited(1), .. }));
    shutdown.cancel();
}

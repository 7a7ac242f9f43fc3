// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Boot the worker and wait until it answers.
//!
//! Each boot attempt launches a fresh [`SupervisedProcess`] and then probes it
//! on a timer, racing the probes against the process exiting. An exit that
//! matches a known transient enclave boot failure sends the loop back to a
//! new attempt after a fixed backoff; any other exit is final.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::process::{classify_exit, ExitClass, ExitState, SpawnError, SupervisedProcess};
use crate::rpc::RpcError;
use crate::transport::Transport;

/// Starts one worker process per boot attempt.
#[async_trait]
pub trait WorkerLauncher: Send {
    /// `attempt` starts at 1.
    async fn launch(&mut self, attempt: u32) -> Result<LaunchedWorker, SpawnError>;
}

/// Checks whether a worker endpoint is serving yet.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, endpoint: &Transport) -> Result<(), RpcError>;
}

pub struct LaunchedWorker {
    pub process: SupervisedProcess,
    pub endpoint: Transport,
    /// The process only launches the worker and exits 0 once it is running
    /// (`nitro-cli run-enclave` without an attached console). A clean exit
    /// then means "launched", not "worker stopped".
    pub detaches: bool,
}

pub struct BootedWorker {
    pub process: SupervisedProcess,
    pub endpoint: Transport,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct BootPolicy {
    /// Delay before the first probe.
    pub initial_probe: Duration,
    /// Delay between probes after the first one failed.
    pub probe_interval: Duration,
    /// Pause before relaunching after a transient boot failure.
    pub transient_backoff: Duration,
    /// `None` retries transient failures forever.
    pub max_attempts: Option<u32>,
}

impl Default for BootPolicy {
    fn default() -> Self {
        Self {
            initial_probe: Duration::from_secs(1),
            probe_interval: Duration::from_secs(5),
            transient_backoff: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("could not launch worker")]
    Launch(#[from] SpawnError),

    #[error("worker `{command_line}` stopped before it became ready ({exit})\n{stderr}")]
    Exited {
        command_line: String,
        exit: ExitState,
        stderr: String,
    },

    #[error("worker kept failing to boot after {attempts} attempts (last failure: {signature})")]
    TransientExhausted { attempts: u32, signature: &'static str },
}

enum AttemptOutcome {
    Ready(LaunchedWorker),
    Retry { signature: &'static str },
}

/// Launch workers until one answers a probe.
#[tracing::instrument(skip_all)]
pub async fn boot_worker(
    launcher: &mut dyn WorkerLauncher,
    probe: &dyn ReadinessProbe,
    policy: &BootPolicy,
) -> Result<BootedWorker, BootError> {
    let mut attempt = 1;
    loop {
        let launched = launcher.launch(attempt).await?;
        info!(attempt, endpoint = %launched.endpoint, "Waiting for worker");

        match await_ready(launched, probe, policy).await? {
            AttemptOutcome::Ready(worker) => {
                info!(attempt, "Worker is ready");
                return Ok(BootedWorker {
                    process: worker.process,
                    endpoint: worker.endpoint,
                    attempts: attempt,
                });
            }
            AttemptOutcome::Retry { signature } => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(BootError::TransientExhausted {
                        attempts: attempt,
                        signature,
                    });
                }
                warn!(
                    attempt,
                    signature,
                    backoff = ?policy.transient_backoff,
                    "Transient enclave boot failure, retrying"
                );
                tokio::time::sleep(policy.transient_backoff).await;
                attempt += 1;
            }
        }
    }
}

async fn await_ready(
    worker: LaunchedWorker,
    probe: &dyn ReadinessProbe,
    policy: &BootPolicy,
) -> Result<AttemptOutcome, BootError> {
    let mut interval = policy.initial_probe;
    let mut launched = false;
    loop {
        let exit = if launched {
            tokio::time::sleep(interval).await;
            None
        } else {
            tokio::select! {
                exit = worker.process.done() => Some(exit),
                () = tokio::time::sleep(interval) => None,
            }
        };

        if exit == Some(ExitState::Exited(0)) && worker.detaches {
            debug!(endpoint = %worker.endpoint, "Launcher detached, probing the worker");
            launched = true;
            continue;
        }

        if let Some(exit) = exit {
            let stderr = worker.process.error_msg();
            return match classify_exit(exit, &stderr) {
                ExitClass::Transient { signature } => Ok(AttemptOutcome::Retry { signature }),
                ExitClass::Fatal => Err(BootError::Exited {
                    command_line: worker.process.command_line().to_string(),
                    exit,
                    stderr,
                }),
            };
        }

        // A probe never outlives one interval, and an exit cuts it short.
        let probed = tokio::select! {
            biased;
            probed = tokio::time::timeout(policy.probe_interval, probe.probe(&worker.endpoint)) => probed,
            _ = worker.process.done(), if !launched => continue,
        };
        match probed {
            Ok(Ok(())) => return Ok(AttemptOutcome::Ready(worker)),
            Ok(Err(e)) => debug!(endpoint = %worker.endpoint, "Worker not ready yet: {e}"),
            Err(_) => debug!(endpoint = %worker.endpoint, "Worker probe timed out"),
        }
        interval = policy.probe_interval;
    }
}

// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Supervision of the worker process for a single boot attempt.
//!
//! A [`SupervisedProcess`] owns one child. Its stderr is forwarded live and
//! also kept in a bounded ring so a failed boot can be classified and
//! reported after the fact. Completion is published on a watch channel, so
//! any number of callers can select on [`SupervisedProcess::done`].

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit code the enclave runtime uses for its own errors.
pub const ENCLAVE_RUNTIME_ERROR_CODE: i32 = 39;

/// Stderr signatures of boot failures that go away on retry.
pub const TRANSIENT_BOOT_SIGNATURES: &[&str] = &["[ E36 ] Enclave boot failure", "[ E29 ] Ioctl failure"];

/// Bytes of stderr kept per process.
pub const STDERR_CAPACITY: usize = 4096;

#[derive(Debug, Clone, bon::Builder)]
pub struct ProcessSpec {
    #[builder(into)]
    pub program: PathBuf,
    #[builder(default)]
    pub args: Vec<OsString>,
    #[builder(into)]
    pub current_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Killed,
}

impl ExitState {
    pub fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Killed => None,
        }
    }
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Killed => f.write_str("killed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Finished(ExitState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClass {
    /// A known boot flake; restarting the whole boot sequence is expected to
    /// succeed.
    Transient { signature: &'static str },
    Fatal,
}

/// Classify a finished process from its exit state and captured stderr.
pub fn classify_exit(exit: ExitState, stderr: &str) -> ExitClass {
    if exit != ExitState::Exited(ENCLAVE_RUNTIME_ERROR_CODE) {
        return ExitClass::Fatal;
    }
    TRANSIENT_BOOT_SIGNATURES
        .iter()
        .find(|signature| stderr.contains(*signature))
        .map_or(ExitClass::Fatal, |signature| ExitClass::Transient { signature })
}

#[derive(Debug, thiserror::Error)]
#[error("could not start `{command_line}`")]
pub struct SpawnError {
    command_line: String,
    #[source]
    source: io::Error,
}

impl SpawnError {
    pub fn new(command_line: impl Into<String>, source: io::Error) -> Self {
        Self {
            command_line: command_line.into(),
            source,
        }
    }
}

/// Bounded byte buffer that drops the oldest bytes first.
#[derive(Debug)]
pub struct StderrRing {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl StderrRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(bytes);
    }

    pub fn contents(&self) -> String {
        let (a, b) = self.buf.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// A running (or finished) child process.
pub struct SupervisedProcess {
    command_line: String,
    state: watch::Receiver<ProcessState>,
    stderr: Arc<Mutex<StderrRing>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl SupervisedProcess {
    /// Launch `spec` and start supervising it.
    ///
    /// Dropping the returned handle kills the child.
    pub fn start(spec: &ProcessSpec) -> Result<Self, SpawnError> {
        let command_line = spec.command_line();
        info!(%command_line, "Starting process");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| SpawnError {
            command_line: command_line.clone(),
            source,
        })?;

        let stderr = Arc::new(Mutex::new(StderrRing::new(STDERR_CAPACITY)));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(tee_stderr(pipe, Arc::clone(&stderr))));

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let label = command_line.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code().map_or(ExitState::Killed, ExitState::Exited),
                    Err(e) => {
                        warn!(command_line = %label, "could not wait for process: {e}");
                        ExitState::Killed
                    }
                },
                // Fires on an explicit kill and when the handle is dropped.
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(command_line = %label, "could not kill process: {e}");
                    }
                    ExitState::Killed
                }
            };
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            debug!(command_line = %label, %exit, "Process finished");
            let _ = state_tx.send(ProcessState::Finished(exit));
        });

        Ok(Self {
            command_line,
            state: state_rx,
            stderr,
            kill: Mutex::new(Some(kill_tx)),
        })
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Resolves once the process has finished. Cancel-safe.
    pub async fn done(&self) -> ExitState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if let ProcessState::Finished(exit) = current {
                return exit;
            }
            if state.changed().await.is_err() {
                // Supervisor task is gone without reporting; treat as killed.
                return ExitState::Killed;
            }
        }
    }

    /// Wait for completion, or return `None` if `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Option<ExitState> {
        tokio::select! {
            exit = self.done() => Some(exit),
            () = cancel.cancelled() => None,
        }
    }

    /// `None` while the process is still running.
    pub fn exit_state(&self) -> Option<ExitState> {
        match *self.state.borrow() {
            ProcessState::Running => None,
            ProcessState::Finished(exit) => Some(exit),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_state().and_then(ExitState::code)
    }

    /// Captured tail of stderr.
    pub fn error_msg(&self) -> String {
        self.stderr
            .lock()
            .map(|ring| ring.contents())
            .unwrap_or_default()
    }

    pub fn classify(&self) -> Option<ExitClass> {
        self.exit_state().map(|exit| classify_exit(exit, &self.error_msg()))
    }

    /// Ask the supervisor to kill the process. Idempotent.
    pub fn kill(&self) {
        let sender = self.kill.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

async fn tee_stderr(mut pipe: ChildStderr, ring: Arc<Mutex<StderrRing>>) {
    let mut live = tokio::io::stderr();
    let mut buf = [0u8; 4096];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("could not read process stderr: {e}");
                break;
            }
        };
        if let Ok(mut ring) = ring.lock() {
            ring.push(&buf[..n]);
        }
        let _ = live.write_all(&buf[..n]).await;
    }
    let _ = live.flush().await;
}

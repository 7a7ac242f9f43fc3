// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Running external commands with their output routed through `tracing`.
//!
//! Every stdout/stderr line becomes an event with target `build`, so command
//! output follows the same path as the rest of the logs (including the relay
//! back to the orchestrator).

use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("could not start `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed with {status}")]
    Failed { command: String, status: ExitStatus },
}

/// Run `cmd` through `sh -c` in `workdir` with extra environment variables.
#[tracing::instrument(skip_all, fields(workdir = ?workdir))]
pub async fn run_shell(cmd: &str, workdir: &Path, env: &[(String, String)]) -> Result<(), ExecError> {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd).current_dir(workdir);
    for (key, value) in env {
        command.env(key, value);
    }
    run_command(command, cmd.to_string()).await
}

/// Run `program` with `args`, no shell involved.
pub async fn run<I, S>(program: &str, args: I) -> Result<(), ExecError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    let command_line = format!("{:?}", command.as_std());
    run_command(command, command_line).await
}

async fn run_command(mut command: Command, command_line: String) -> Result<(), ExecError> {
    info!(command = %command_line, "exec");
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        command: command_line.clone(),
        source,
    })?;

    let stdout = child.stdout.take().map(|out| tokio::spawn(forward_lines(out, false)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(forward_lines(err, true)));

    let status = child.wait().await.map_err(|source| ExecError::Spawn {
        command: command_line.clone(),
        source,
    })?;
    for task in [stdout, stderr].into_iter().flatten() {
        let _ = task.await;
    }

    if status.success() {
        Ok(())
    } else {
        Err(ExecError::Failed {
            command: command_line,
            status,
        })
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => warn!(target: "build", "{line}"),
            Ok(Some(line)) => info!(target: "build", "{line}"),
            Ok(None) => break,
            Err(e) => {
                warn!("could not read command output: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_in_workdir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        run_shell(
            "printf '%s' \"$GREETING\" > greeting.txt",
            dir.path(),
            &[("GREETING".to_string(), "hello".to_string())],
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("greeting.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_shell("echo oops >&2; exit 7", dir.path(), &[]).await.unwrap_err();
        match err {
            ExecError::Failed { status, .. } => assert_eq!(status.code(), Some(7)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = run("/nonexistent/docker", ["run"]).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}

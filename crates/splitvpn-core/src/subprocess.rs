//! Deadline-bounded subprocess runner.
//!
//! Ported from `gnosis_vpn-lib::shell_command_ext::ShellCommandExt` (a trait
//! over `tokio::process::Command` with `run`/`run_stdout`/`spawn_no_capture`),
//! generalized here to take an explicit [`Duration`] deadline per call since
//! every caller in this crate (conntrack, ipset, ping, systemctl) has its own
//! timeout from spec §5.

use std::process::Output;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use splitvpn_types::{Categorized, ErrorCategory};

#[derive(Debug, Error)]
pub enum SubprocessError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("command failed: {0}")]
    Failed(String),
    #[error("failed to spawn command: {0}")]
    Io(#[from] std::io::Error),
}

impl Categorized for SubprocessError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Dependency
    }
}

/// Whether to log non-fatal stderr output.
#[derive(Debug, Clone, Copy)]
pub enum Logs {
    Print,
    Suppress,
}

/// Run `cmd`, capture stdout, and return it trimmed. Fails on non-zero exit
/// or on exceeding `deadline`.
pub async fn run_stdout(
    cmd: &mut Command,
    deadline: Duration,
    logs: Logs,
) -> Result<String, SubprocessError> {
    let cmd_debug = format!("{cmd:?}");
    let output = tokio::time::timeout(deadline, cmd.output())
        .await
        .map_err(|_| SubprocessError::Timeout(deadline))??;
    stdout_from_output(&cmd_debug, output, logs)
}

/// Run `cmd` for its side effects only, discarding stdout/stderr.
pub async fn run_silent(cmd: &mut Command, deadline: Duration) -> Result<(), SubprocessError> {
    let cmd_debug = format!("{cmd:?}");
    let status = tokio::time::timeout(deadline, async {
        cmd.stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
    })
    .await
    .map_err(|_| SubprocessError::Timeout(deadline))??;

    if status.success() {
        Ok(())
    } else {
        Err(SubprocessError::Failed(format!(
            "{cmd_debug} exited with {status}"
        )))
    }
}

fn stdout_from_output(
    cmd_debug: &str,
    output: Output,
    logs: Logs,
) -> Result<String, SubprocessError> {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr_empty = output.stderr.is_empty();

    match (stderr_empty, output.status.success()) {
        (true, true) => Ok(stdout),
        (false, true) => {
            if matches!(logs, Logs::Print) {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(cmd = cmd_debug, %stderr, "non-empty stderr on successful command");
            }
            Ok(stdout)
        }
        (_, false) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if matches!(logs, Logs::Print) {
                tracing::error!(cmd = cmd_debug, status = ?output.status.code(), %stderr, "command failed");
            }
            Err(SubprocessError::Failed(format!(
                "{cmd_debug}: {stderr}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_stdout_captures_and_trims_output() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let out = run_stdout(&mut cmd, Duration::from_secs(2), Logs::Suppress)
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn run_stdout_fails_on_nonzero_exit() {
        let mut cmd = Command::new("false");
        let err = run_stdout(&mut cmd, Duration::from_secs(2), Logs::Suppress)
            .await
            .unwrap_err();
        assert!(matches!(err, SubprocessError::Failed(_)));
    }

    #[tokio::test]
    async fn run_stdout_times_out_before_deadline() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_stdout(&mut cmd, Duration::from_millis(50), Logs::Suppress)
            .await
            .unwrap_err();
        assert!(matches!(err, SubprocessError::Timeout(_)));
    }
}

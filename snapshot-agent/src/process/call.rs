//! Run a short-lived tool to completion and capture its output.

use super::split_argv;
use crate::utils::errors::OperationError;
use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Captured result of a finished tool invocation
#[derive(Debug, Clone)]
pub struct CallOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CallOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Number of stdout lines, counting a trailing unterminated line.
    pub fn line_count(&self) -> u64 {
        self.stdout.lines().count() as u64
    }
}

/// Run `argv` and wait for it to exit.
///
/// The child is killed if `cancel` fires first.
pub async fn call<I, S>(argv: I, cancel: &CancellationToken) -> Result<CallOutput, OperationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let (program, args) = split_argv(argv)?;
    let program_name = program.to_string_lossy().into_owned();

    let child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| OperationError::Spawn {
            program: program_name.clone(),
            source,
        })?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Cancelled {}", program_name);
            return Err(OperationError::Cancelled);
        }
        output = child.wait_with_output() => output,
    };

    let output = output.map_err(|source| OperationError::Io {
        program: program_name.clone(),
        source,
    })?;

    debug!("{} exited with {}", program_name, output.status);

    Ok(CallOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

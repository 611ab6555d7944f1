//! Custom error types for the snapshot agent.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage a failure or cancellation is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Subvolume bootstrap and dry-run estimate
    Prepare,
    /// Real rsync pass into `latest`
    Sync,
    /// Snapshot of `latest`
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Prepare => "prepare",
            Stage::Sync => "sync",
            Stage::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by a backup session or snapshot retirement.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Failed to prepare backup: {0}")]
    Prepare(String),

    #[error("Failed to execute backup: {0}")]
    Sync(String),

    #[error("Failed to finalize backup: {0}")]
    Finalize(String),

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Backup target {0} is locked by another session")]
    TargetBusy(PathBuf),

    #[error("Backup cancelled during {0} stage")]
    Cancelled(Stage),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Attribute a tool-level error to a pipeline stage.
    pub fn from_operation(stage: Stage, err: OperationError) -> Self {
        match err {
            OperationError::Spawn { program, source } => BackupError::Spawn { program, source },
            OperationError::Cancelled => BackupError::Cancelled(stage),
            OperationError::Io { .. } => {
                let message = err.to_string();
                match stage {
                    Stage::Prepare => BackupError::Prepare(message),
                    Stage::Sync => BackupError::Sync(message),
                    Stage::Finalize => BackupError::Finalize(message),
                }
            }
        }
    }
}

/// Errors raised while running an external tool.
///
/// A tool that runs and exits non-zero is not an error at this layer; the
/// operation reports it through its return value.
#[derive(Error, Debug)]
pub enum OperationError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BackupError>;

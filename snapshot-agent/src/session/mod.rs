//! Backup session - Orchestrates one backup attempt.
//!
//! A session takes the target lock, then walks the pipeline:
//!
//! ```text
//! Idle -> DryRun -> Syncing -> Snapshotting -> Done
//!    \________\_________\___________\-> Failed(stage) | Cancelled(stage)
//! ```
//!
//! Nothing is retried. A failed sync leaves `latest` partially updated; the
//! next attempt re-converges it before snapshotting.

use crate::operations::SyncOperations;
use crate::progress::{ProgressTracker, SyncProgress};
use crate::target::{BackupTarget, SnapshotRecord, TargetLock};
use crate::utils::errors::{BackupError, Result, Stage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Position of a session in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    DryRun,
    Syncing,
    Snapshotting,
    Done,
    Failed(Stage),
    Cancelled(Stage),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Failed(_) | SessionState::Cancelled(_)
        )
    }
}

/// One backup attempt against a locked target
pub struct BackupSession {
    id: Uuid,
    source: PathBuf,
    target: BackupTarget,
    ops: SyncOperations,
    state: watch::Sender<SessionState>,
    _lock: TargetLock,
}

impl BackupSession {
    /// Prepare a session backing up `source` into `target`.
    ///
    /// Fails with [`BackupError::TargetBusy`] if another session or a
    /// snapshot deletion holds the target.
    pub fn new(source: impl Into<PathBuf>, target: BackupTarget, ops: SyncOperations) -> Result<Self> {
        let source = source.into();
        if !source.is_absolute() {
            return Err(BackupError::Precondition(format!(
                "Backup source must be an absolute path: {}",
                source.display()
            )));
        }
        if !source.is_dir() {
            return Err(BackupError::Precondition(format!(
                "Backup source directory does not exist: {}",
                source.display()
            )));
        }

        let lock = target.lock()?;
        let (state, _) = watch::channel(SessionState::Idle);

        Ok(Self {
            id: Uuid::new_v4(),
            source,
            target,
            ops,
            state,
            _lock: lock,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &BackupTarget {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions. The final state stays readable after the
    /// session is consumed.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run the pipeline to completion and release the target.
    pub async fn run<F>(self, on_progress: F, cancel: &CancellationToken) -> Result<SnapshotRecord>
    where
        F: FnMut(&SyncProgress) + Send,
    {
        let span = tracing::info_span!("backup", session = %self.id);
        async move {
            info!(
                "Starting backup of {} into {}",
                self.source.display(),
                self.target.root().display()
            );
            let result = self.execute(on_progress, cancel).await;
            match &result {
                Ok(record) => info!("Backup complete: {}", record.path.display()),
                Err(BackupError::Cancelled(stage)) => warn!("Backup cancelled during {} stage", stage),
                Err(e) => error!("Backup failed: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute<F>(&self, mut on_progress: F, cancel: &CancellationToken) -> Result<SnapshotRecord>
    where
        F: FnMut(&SyncProgress) + Send,
    {
        let latest = self.target.latest_dir();

        // Idle -> DryRun
        self.transition(SessionState::DryRun);
        info!("* dryrun");
        self.ensure_latest(&latest, cancel).await?;
        let estimate = self
            .ops
            .estimate_work(&self.source, &latest, cancel)
            .await
            .map_err(|e| self.fail(Stage::Prepare, BackupError::from_operation(Stage::Prepare, e)))?
            .ok_or_else(|| {
                self.fail(
                    Stage::Prepare,
                    BackupError::Prepare("rsync dry-run exited with an error".to_string()),
                )
            })?;
        info!("Dry-run estimates {} units", estimate.units);

        // DryRun -> Syncing
        self.transition(SessionState::Syncing);
        info!("* sync");
        let mut tracker = ProgressTracker::new(estimate.units);
        let outcome = self
            .ops
            .execute_sync(
                &self.source,
                &latest,
                |completed| on_progress(tracker.update(completed)),
                cancel,
            )
            .await
            .map_err(|e| self.fail(Stage::Sync, BackupError::from_operation(Stage::Sync, e)))?;
        if !outcome.success() {
            return Err(self.fail(
                Stage::Sync,
                BackupError::Sync(format!(
                    "rsync exited with {} after {} lines",
                    describe_exit(outcome.exit_code),
                    outcome.lines
                )),
            ));
        }

        // Syncing -> Snapshotting
        self.transition(SessionState::Snapshotting);
        info!("* snapshot");
        let record = SnapshotRecord::new(self.target.root(), chrono::Utc::now().timestamp());
        if record.path.exists() {
            return Err(self.fail(
                Stage::Finalize,
                BackupError::Finalize(format!(
                    "snapshot {} already exists, refusing to overwrite",
                    record.name()
                )),
            ));
        }
        let created = self
            .ops
            .create_snapshot(&latest, &record.path, cancel)
            .await
            .map_err(|e| self.fail(Stage::Finalize, BackupError::from_operation(Stage::Finalize, e)))?;
        if !created {
            return Err(self.fail(
                Stage::Finalize,
                BackupError::Finalize(format!("btrfs did not create {}", record.name())),
            ));
        }

        // Snapshotting -> Done
        self.transition(SessionState::Done);
        Ok(record)
    }

    /// Create `latest` as a subvolume on first use; snapshots need one.
    async fn ensure_latest(&self, latest: &Path, cancel: &CancellationToken) -> Result<()> {
        if latest.is_dir() {
            return Ok(());
        }
        info!("Creating working subvolume {}", latest.display());
        let created = self
            .ops
            .create_subvolume(latest, cancel)
            .await
            .map_err(|e| self.fail(Stage::Prepare, BackupError::from_operation(Stage::Prepare, e)))?;
        if !created {
            return Err(self.fail(
                Stage::Prepare,
                BackupError::Prepare(format!("could not create subvolume {}", latest.display())),
            ));
        }
        Ok(())
    }

    fn transition(&self, next: SessionState) {
        self.state.send_replace(next);
    }

    /// Record the terminal state matching `err` and hand the error back.
    fn fail(&self, stage: Stage, err: BackupError) -> BackupError {
        let state = match err {
            BackupError::Cancelled(cancelled_at) => SessionState::Cancelled(cancelled_at),
            _ => SessionState::Failed(stage),
        };
        self.transition(state);
        err
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

/// Delete the snapshot taken at `timestamp`.
///
/// Retirement is best-effort cleanup: btrfs refusing is reported as
/// `Ok(false)`. Errors are limited to lock contention, a missing btrfs
/// binary, and cancellation.
pub async fn delete_backup(
    target: &BackupTarget,
    ops: &SyncOperations,
    timestamp: i64,
    cancel: &CancellationToken,
) -> Result<bool> {
    let _lock = target.lock()?;
    let dir = target.snapshot_dir(timestamp);
    info!("* deleting snapshot {}", SnapshotRecord::dir_name(timestamp));

    let deleted = ops
        .delete_snapshot(&dir, cancel)
        .await
        .map_err(|e| BackupError::from_operation(Stage::Finalize, e))?;
    if !deleted {
        warn!("Snapshot {} was not deleted", dir.display());
    }
    Ok(deleted)
}

/// Snapshots on `target`, oldest first.
pub fn list_backups(target: &BackupTarget) -> Result<Vec<SnapshotRecord>> {
    target.snapshots()
}

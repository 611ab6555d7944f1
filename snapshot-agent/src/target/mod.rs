//! Backup destination layout.
//!
//! A target root on the backup volume holds the `latest` working copy that
//! rsync converges, and one read-only snapshot per completed backup:
//!
//! ```text
//! <mount_path>/<sub_dir>/
//!     latest/
//!     backup_1700000000/
//!     backup_1700086400/
//!     .snapshot-agent.lock
//! ```

pub mod lock;
pub mod snapshot;

pub use lock::TargetLock;
pub use snapshot::{list_snapshots, SnapshotRecord};

use crate::disks::DiskInfo;
use crate::utils::errors::{BackupError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the working copy rsync writes into
pub const LATEST_DIR: &str = "latest";

const REQUIRED_FS_TYPE: &str = "btrfs";

/// A validated destination root on a mounted backup volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    root: PathBuf,
}

impl BackupTarget {
    /// Use `root` directly. It must be an absolute path to an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(BackupError::Precondition(format!(
                "Backup target must be an absolute path: {}",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(BackupError::Precondition(format!(
                "Backup target directory does not exist: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Resolve the target on a volume reported by the disk collaborator.
    ///
    /// Fails fast when the volume is not mounted, its mount path is unknown,
    /// or it is known not to be btrfs.
    pub fn resolve(disk: &dyn DiskInfo, sub_dir: &Path) -> Result<Self> {
        if !disk.is_mounted() {
            return Err(BackupError::Precondition(format!(
                "Drive {} is not mounted",
                disk.dev_file().display()
            )));
        }
        let mount_path = disk.mount_path().ok_or_else(|| {
            BackupError::Precondition(format!(
                "Could not determine mount path of backup drive {}",
                disk.dev_file().display()
            ))
        })?;
        if let Some(fs_type) = disk.fs_type() {
            if fs_type != REQUIRED_FS_TYPE {
                return Err(BackupError::Precondition(format!(
                    "Backup drive {} is formatted as {}, snapshots need {}",
                    disk.dev_file().display(),
                    fs_type,
                    REQUIRED_FS_TYPE
                )));
            }
        }

        debug!("Backup drive {} mounted at {}", disk.dev_file().display(), mount_path.display());
        Self::new(mount_path.join(sub_dir))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `latest` working copy
    pub fn latest_dir(&self) -> PathBuf {
        self.root.join(LATEST_DIR)
    }

    /// Location of the snapshot taken at `timestamp`
    pub fn snapshot_dir(&self, timestamp: i64) -> PathBuf {
        self.root.join(SnapshotRecord::dir_name(timestamp))
    }

    /// Existing snapshots, oldest first
    pub fn snapshots(&self) -> Result<Vec<SnapshotRecord>> {
        Ok(list_snapshots(&self.root)?)
    }

    /// Take the advisory lock on this target
    pub fn lock(&self) -> Result<TargetLock> {
        TargetLock::acquire(&self.root)
    }
}

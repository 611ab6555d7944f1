//! Advisory single-owner lock on a backup target.

use crate::utils::errors::{BackupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock file kept in the target root
pub const LOCK_FILE: &str = ".snapshot-agent.lock";

/// Exclusive `flock` on `<target_root>/.snapshot-agent.lock`.
///
/// Released when dropped. The file records `host:pid` of the owner.
pub struct TargetLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl TargetLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                return Err(BackupError::TargetBusy(root.to_path_buf()));
            }
            Err((_, errno)) => return Err(BackupError::Io(errno.into())),
        };

        let mut owner: &File = &file;
        owner.set_len(0)?;
        writeln!(owner, "{}:{}", owner_host(), std::process::id())?;

        debug!("Acquired lock {}", path.display());
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        debug!("Released lock {}", self.path.display());
    }
}

fn owner_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

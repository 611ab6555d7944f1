//! Snapshot Agent Library
//!
//! Point-in-time backups onto a removable btrfs volume: rsync converges a
//! `latest` working copy, then a read-only subvolume snapshot freezes it.

pub mod config;
pub mod disks;
pub mod operations;
pub mod process;
pub mod progress;
pub mod session;
pub mod shutdown;
pub mod target;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use operations::SyncOperations;
pub use session::{BackupSession, SessionState};
pub use target::{BackupTarget, SnapshotRecord};
pub use utils::errors::{BackupError, OperationError, Stage};
pub type Result<T> = std::result::Result<T, BackupError>;

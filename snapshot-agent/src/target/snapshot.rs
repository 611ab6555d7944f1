//! Snapshot naming and discovery.
//!
//! Snapshots are addressed by the Unix second at which the snapshot stage
//! began. Two backups finalized within the same second map to the same name;
//! the session refuses the second one instead of overwriting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

const SNAPSHOT_PREFIX: &str = "backup_";

/// An immutable snapshot under the target root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    pub timestamp: i64,
    pub path: PathBuf,
}

impl SnapshotRecord {
    pub fn new(root: &Path, timestamp: i64) -> Self {
        Self {
            timestamp,
            path: root.join(Self::dir_name(timestamp)),
        }
    }

    /// Directory name for a snapshot taken at `timestamp`
    pub fn dir_name(timestamp: i64) -> String {
        format!("{}{}", SNAPSHOT_PREFIX, timestamp)
    }

    /// Timestamp encoded in a snapshot directory name
    pub fn parse_dir_name(name: &str) -> Option<i64> {
        let digits = name.strip_prefix(SNAPSHOT_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub fn name(&self) -> String {
        Self::dir_name(self.timestamp)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

/// Snapshots directly under `root`, oldest first
pub fn list_snapshots(root: &Path) -> std::io::Result<Vec<SnapshotRecord>> {
    let mut snapshots: Vec<SnapshotRecord> = std::fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let timestamp = SnapshotRecord::parse_dir_name(&e.file_name().to_string_lossy())?;
            Some(SnapshotRecord {
                timestamp,
                path: e.path(),
            })
        })
        .collect();

    snapshots.sort_by_key(|s| s.timestamp);
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_dir_name_round_trip() {
        assert_eq!(SnapshotRecord::dir_name(1700000000), "backup_1700000000");
        assert_eq!(SnapshotRecord::parse_dir_name("backup_1700000000"), Some(1700000000));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(SnapshotRecord::parse_dir_name("latest"), None);
        assert_eq!(SnapshotRecord::parse_dir_name("backup_"), None);
        assert_eq!(SnapshotRecord::parse_dir_name("backup_12ab"), None);
        assert_eq!(SnapshotRecord::parse_dir_name("backup_-5"), None);
        assert_eq!(SnapshotRecord::parse_dir_name(".snapshot-agent.lock"), None);
    }

    #[test]
    fn test_created_at() {
        let record = SnapshotRecord::new(Path::new("/media/backup"), 0);
        assert_eq!(record.path, PathBuf::from("/media/backup/backup_0"));
        assert_eq!(record.created_at().unwrap().to_rfc3339(), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_list_snapshots_sorted_and_filtered() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("backup_300"))?;
        fs::create_dir(dir.path().join("backup_20"))?;
        fs::create_dir(dir.path().join("latest"))?;
        fs::write(dir.path().join("backup_999"), b"not a directory")?;

        let snapshots = list_snapshots(dir.path())?;
        let timestamps: Vec<i64> = snapshots.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![20, 300]);
        assert_eq!(snapshots[0].path, dir.path().join("backup_20"));
        Ok(())
    }
}

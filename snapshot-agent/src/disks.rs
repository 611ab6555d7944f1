//! Backup volume discovery.
//!
//! The pipeline only needs to know whether the backup device is mounted and
//! where. [`DiskInfo`] is that boundary; [`MountedDevice`] answers it from the
//! kernel mount table and [`FixedMount`] from a configured directory.

use std::path::{Path, PathBuf};

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Mount state of a backup volume
pub trait DiskInfo {
    /// Device file (or configured path) identifying the volume
    fn dev_file(&self) -> &Path;

    fn is_mounted(&self) -> bool;

    /// First mount point of the volume, if mounted
    fn mount_path(&self) -> Option<PathBuf>;

    /// Filesystem type, when known
    fn fs_type(&self) -> Option<String>;
}

/// One line of the kernel mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Parse `/proc/self/mounts` content. Malformed lines are skipped.
pub fn parse_mount_table(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                source: unescape_mount_field(source),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// Decode the octal escapes (`\040` for space etc.) the kernel uses.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A block device looked up in the mount table
#[derive(Debug, Clone)]
pub struct MountedDevice {
    dev_file: PathBuf,
    mounts: Vec<MountEntry>,
}

impl MountedDevice {
    /// Read the current mount table and collect the entries for `dev_file`.
    pub fn probe(dev_file: &Path) -> std::io::Result<Self> {
        let table = std::fs::read_to_string(MOUNT_TABLE)?;
        Ok(Self::from_table(dev_file, &table))
    }

    /// Match `dev_file` against already-read mount table content.
    ///
    /// Device symlinks such as `/dev/disk/by-uuid/...` are resolved on both
    /// sides before comparing.
    pub fn from_table(dev_file: &Path, table: &str) -> Self {
        let wanted = canonical_device(dev_file);
        let mounts = parse_mount_table(table)
            .into_iter()
            .filter(|entry| {
                let source = Path::new(&entry.source);
                source == dev_file || (source.is_absolute() && canonical_device(source) == wanted)
            })
            .collect();
        Self {
            dev_file: dev_file.to_path_buf(),
            mounts,
        }
    }

    pub fn mounts(&self) -> &[MountEntry] {
        &self.mounts
    }
}

fn canonical_device(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl DiskInfo for MountedDevice {
    fn dev_file(&self) -> &Path {
        &self.dev_file
    }

    fn is_mounted(&self) -> bool {
        !self.mounts.is_empty()
    }

    fn mount_path(&self) -> Option<PathBuf> {
        self.mounts
            .first()
            .map(|entry| entry.mount_point.clone())
            .filter(|path| !path.as_os_str().is_empty())
    }

    fn fs_type(&self) -> Option<String> {
        self.mounts.first().map(|entry| entry.fs_type.clone())
    }
}

/// A volume given directly by its mount point
#[derive(Debug, Clone)]
pub struct FixedMount {
    path: PathBuf,
}

impl FixedMount {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiskInfo for FixedMount {
    fn dev_file(&self) -> &Path {
        &self.path
    }

    fn is_mounted(&self) -> bool {
        self.path.is_dir()
    }

    fn mount_path(&self) -> Option<PathBuf> {
        Some(self.path.clone()).filter(|path| !path.as_os_str().is_empty())
    }

    fn fs_type(&self) -> Option<String> {
        None
    }
}

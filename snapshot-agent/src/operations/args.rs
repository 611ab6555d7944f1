//! Command lines for rsync and `btrfs subvolume`.
//!
//! The rsync flag set is a compatibility contract with existing backup
//! volumes. The dry-run and the real pass deliberately differ in their
//! trailing excludes: the dry-run appends `foo` and `bar`, the real pass
//! appends `backup` and `bar`.

use std::ffi::OsString;
use std::path::Path;

/// Flags shared by the dry-run and the real pass
const RSYNC_FLAGS: &[&str] = &[
    "-avzpHAX",
    "--skip-compress=jpg:mpg:avi:mp3",
    "--one-file-system",
    "--inplace",
    "--delete",
    "--delete-excluded",
    "--exclude=backup",
];

const DRY_RUN_FLAG: &str = "--dry-run";

const DRY_RUN_EXCLUDES: &[&str] = &["foo", "bar"];

const SYNC_EXCLUDES: &[&str] = &["backup", "bar"];

/// First word of btrfs' snapshot confirmation ("Create a snapshot of ...")
pub const SNAPSHOT_CONFIRMATION: &str = "Create";

fn with_prefix(prefix: &[String]) -> Vec<OsString> {
    prefix.iter().map(OsString::from).collect()
}

fn excludes(paths: &'static [&'static str]) -> impl Iterator<Item = OsString> {
    paths.iter().map(|p| OsString::from(format!("--exclude={}", p)))
}

/// Simulate-only rsync pass used for the work estimate
pub fn dry_run(rsync: &[String], source: &Path, dest: &Path) -> Vec<OsString> {
    let mut argv = with_prefix(rsync);
    argv.extend(RSYNC_FLAGS.iter().map(OsString::from));
    argv.push(DRY_RUN_FLAG.into());
    argv.push(source.into());
    argv.push(dest.into());
    argv.extend(excludes(DRY_RUN_EXCLUDES));
    argv
}

/// Mutating rsync pass into the working copy
pub fn sync(rsync: &[String], source: &Path, dest: &Path) -> Vec<OsString> {
    let mut argv = with_prefix(rsync);
    argv.extend(RSYNC_FLAGS.iter().map(OsString::from));
    argv.push(source.into());
    argv.push(dest.into());
    argv.extend(excludes(SYNC_EXCLUDES));
    argv
}

fn subvolume(btrfs: &[String], command: &str, paths: &[&Path]) -> Vec<OsString> {
    let mut argv = with_prefix(btrfs);
    argv.push("subvolume".into());
    argv.push(command.into());
    argv.extend(paths.iter().map(|p| OsString::from(*p)));
    argv
}

pub fn create_subvolume(btrfs: &[String], dir: &Path) -> Vec<OsString> {
    subvolume(btrfs, "create", &[dir])
}

pub fn snapshot(btrfs: &[String], source: &Path, dest: &Path) -> Vec<OsString> {
    subvolume(btrfs, "snapshot", &[source, dest])
}

pub fn delete_subvolume(btrfs: &[String], dir: &Path) -> Vec<OsString> {
    subvolume(btrfs, "delete", &[dir])
}

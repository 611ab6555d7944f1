//! Backup intents translated into rsync and btrfs invocations.
//!
//! Short-lived tools (dry-run, subvolume create/snapshot/delete) run to
//! completion; the real rsync pass is watched through a [`ProcessMonitor`]
//! and reported line by line.

pub mod args;

use crate::config::ToolsConfig;
use crate::process::{call, CallOutput, ProcessMonitor};
use crate::utils::errors::OperationError;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use args::SNAPSHOT_CONFIRMATION;

/// Work estimate from a dry-run, in rsync output lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEstimate {
    pub units: u64,
}

/// Result of a real rsync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Lines observed on stdout
    pub lines: u64,
    /// Exit code; `None` if rsync died from a signal or its exit was not seen
    pub exit_code: Option<i32>,
}

impl SyncOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the external tools of the backup pipeline
#[derive(Debug, Clone)]
pub struct SyncOperations {
    tools: ToolsConfig,
}

impl SyncOperations {
    pub fn new(tools: ToolsConfig) -> Self {
        Self { tools }
    }

    /// Dry-run rsync to estimate how many progress units the real pass emits.
    ///
    /// Returns `None` when rsync exits non-zero; its output is not trusted then.
    pub async fn estimate_work(
        &self,
        source: &Path,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<ProgressEstimate>, OperationError> {
        let argv = args::dry_run(&self.tools.rsync, source, dest);
        let output = call(argv, cancel).await?;

        if !output.success() {
            log_failure("rsync dry-run", &output);
            return Ok(None);
        }

        let units = output.line_count();
        debug!("Dry-run of {} reported {} lines", source.display(), units);
        Ok(Some(ProgressEstimate { units }))
    }

    /// Real rsync pass, calling `on_progress` as output arrives.
    ///
    /// `on_progress` receives the number of lines completed before each line
    /// (0 for the first), then once more with the total after the output ends.
    /// On cancellation rsync gets SIGTERM and the drain worker is stopped.
    pub async fn execute_sync<F>(
        &self,
        source: &Path,
        dest: &Path,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, OperationError>
    where
        F: FnMut(u64),
    {
        let argv = args::sync(&self.tools.rsync, source, dest);
        let mut monitor = ProcessMonitor::with_capacity(argv, self.tools.line_buffer)?;
        let mut completed = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                line = monitor.next_line() => Some(line),
            };

            match next {
                None => return Err(abort(&mut monitor, completed).await),
                Some(Some(_line)) => {
                    on_progress(completed);
                    completed += 1;
                }
                Some(None) => break,
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = monitor.wait() => Some(status),
        };
        let Some(status) = status else {
            return Err(abort(&mut monitor, completed).await);
        };
        on_progress(completed);

        let outcome = SyncOutcome {
            lines: completed,
            exit_code: status.and_then(|s| s.code()),
        };
        if !outcome.success() {
            warn!("rsync exited with {:?} after {} lines", outcome.exit_code, completed);
        }
        Ok(outcome)
    }

    /// Create a btrfs subvolume at `dir`.
    pub async fn create_subvolume(&self, dir: &Path, cancel: &CancellationToken) -> Result<bool, OperationError> {
        let output = call(args::create_subvolume(&self.tools.btrfs, dir), cancel).await?;
        if !output.success() {
            log_failure("btrfs subvolume create", &output);
        }
        Ok(output.success())
    }

    /// Snapshot `source_dir` to `dest_dir`.
    ///
    /// btrfs can exit 0 without creating anything, so success also requires
    /// its confirmation on stdout.
    pub async fn create_snapshot(
        &self,
        source_dir: &Path,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool, OperationError> {
        let output = call(args::snapshot(&self.tools.btrfs, source_dir, dest_dir), cancel).await?;
        let created = output.success() && output.stdout.starts_with(SNAPSHOT_CONFIRMATION);
        if !created {
            log_failure("btrfs subvolume snapshot", &output);
        }
        Ok(created)
    }

    /// Delete the snapshot at `dir`.
    pub async fn delete_snapshot(&self, dir: &Path, cancel: &CancellationToken) -> Result<bool, OperationError> {
        info!("Deleting snapshot {}", dir.display());
        let output = call(args::delete_subvolume(&self.tools.btrfs, dir), cancel).await?;
        if !output.success() {
            log_failure("btrfs subvolume delete", &output);
        }
        Ok(output.success())
    }
}

async fn abort(monitor: &mut ProcessMonitor, completed: u64) -> OperationError {
    info!("Cancelling {} after {} lines", monitor.program(), completed);
    if let Err(e) = monitor.terminate() {
        warn!("Failed to signal {}: {}", monitor.program(), e);
    }
    monitor.stop().await;
    OperationError::Cancelled
}

fn log_failure(what: &str, output: &CallOutput) {
    warn!(
        "{} failed ({}): {}{}",
        what,
        output.status,
        output.stdout.trim_end(),
        if output.stderr.trim().is_empty() {
            String::new()
        } else {
            format!(" / {}", output.stderr.trim_end())
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Command prefix running `script` as a fake tool; tool arguments land in `$@`.
    fn fake(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into(), "fake-tool".into()]
    }

    fn ops(rsync: &str, btrfs: &str) -> SyncOperations {
        SyncOperations::new(ToolsConfig {
            rsync: fake(rsync),
            btrfs: fake(btrfs),
            line_buffer: 16,
        })
    }

    fn paths() -> (PathBuf, PathBuf) {
        (PathBuf::from("/src/"), PathBuf::from("/dst/latest"))
    }

    #[tokio::test]
    async fn test_estimate_counts_dry_run_lines() {
        let ops = ops(
            r#"case "$*" in *--dry-run*) printf 'one\ntwo\nthree\n' ;; *) exit 9 ;; esac"#,
            "exit 0",
        );
        let (src, dst) = paths();
        let estimate = ops.estimate_work(&src, &dst, &CancellationToken::new()).await.unwrap();
        assert_eq!(estimate, Some(ProgressEstimate { units: 3 }));
    }

    #[tokio::test]
    async fn test_estimate_fails_on_non_zero_exit_despite_output() {
        let ops = ops("printf 'a\\nb\\n'; exit 23", "exit 0");
        let (src, dst) = paths();
        let estimate = ops.estimate_work(&src, &dst, &CancellationToken::new()).await.unwrap();
        assert_eq!(estimate, None);
    }

    #[tokio::test]
    async fn test_estimate_of_empty_tree_is_zero() {
        let ops = ops("exit 0", "exit 0");
        let (src, dst) = paths();
        let estimate = ops.estimate_work(&src, &dst, &CancellationToken::new()).await.unwrap();
        assert_eq!(estimate, Some(ProgressEstimate { units: 0 }));
    }

    #[tokio::test]
    async fn test_execute_sync_progress_sequence() {
        let ops = ops(
            r#"case "$*" in *--dry-run*) exit 7 ;; *) printf 'f1\nf2\nf3\n' ;; esac"#,
            "exit 0",
        );
        let (src, dst) = paths();
        let mut seen = Vec::new();
        let outcome = ops
            .execute_sync(&src, &dst, |n| seen.push(n), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.lines, 3);
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_execute_sync_many_lines_is_monotonic() {
        let ops = ops("i=0; while [ $i -lt 500 ]; do echo line$i; i=$((i+1)); done", "exit 0");
        let (src, dst) = paths();
        let mut seen = Vec::new();
        let outcome = ops
            .execute_sync(&src, &dst, |n| seen.push(n), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.lines, 500);
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&500));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_execute_sync_reports_failure() {
        let ops = ops("echo partial; exit 12", "exit 0");
        let (src, dst) = paths();
        let mut seen = Vec::new();
        let outcome = ops
            .execute_sync(&src, &dst, |n| seen.push(n), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, Some(12));
        assert_eq!(seen, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_execute_sync_receives_real_arguments() {
        let ops = ops(
            r#"for a in "$@"; do echo "$a"; done"#,
            "exit 0",
        );
        let (src, dst) = paths();
        let outcome = ops
            .execute_sync(&src, &dst, |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        let expected = args::sync(&["rsync".to_string()], &src, &dst).len() as u64 - 1;
        assert_eq!(outcome.lines, expected);
    }

    #[tokio::test]
    async fn test_execute_sync_cancellation() {
        let ops = ops("echo started; exec sleep 30", "exit 0");
        let (src, dst) = paths();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            ops.execute_sync(&src, &dst, |_| {}, &cancel),
        )
        .await
        .expect("cancelled sync should return promptly");
        assert!(matches!(result, Err(OperationError::Cancelled)));
    }

    #[tokio::test]
    async fn test_execute_sync_missing_rsync() {
        let ops = SyncOperations::new(ToolsConfig {
            rsync: vec!["/nonexistent/rsync".to_string()],
            ..ToolsConfig::default()
        });
        let (src, dst) = paths();
        let result = ops.execute_sync(&src, &dst, |_| {}, &CancellationToken::new()).await;
        assert!(matches!(result, Err(OperationError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_create_snapshot_requires_confirmation() {
        let (src, dst) = paths();
        let cancel = CancellationToken::new();

        let ok = ops("exit 0", r#"echo "Create a snapshot of '$3' in '$4'""#);
        assert!(ok.create_snapshot(&src, &dst, &cancel).await.unwrap());

        let nothing = ops("exit 0", "echo 'Nothing to do'");
        assert!(!nothing.create_snapshot(&src, &dst, &cancel).await.unwrap());

        let failed = ops("exit 0", "echo 'Create a snapshot of x'; exit 1");
        assert!(!failed.create_snapshot(&src, &dst, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_snapshot_passes_paths() {
        let (src, dst) = paths();
        let ops = ops(
            "exit 0",
            r#"[ "$1 $2" = "subvolume snapshot" ] && [ "$3" = /src/ ] && [ "$4" = /dst/latest ] && echo "Create a snapshot""#,
        );
        assert!(ops.create_snapshot(&src, &dst, &CancellationToken::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_snapshot_uses_exit_code_only() {
        let dir = PathBuf::from("/dst/backup_1");
        let cancel = CancellationToken::new();

        let ok = ops("exit 0", r#"[ "$2" = delete ] && echo whatever"#);
        assert!(ok.delete_snapshot(&dir, &cancel).await.unwrap());

        let failed = ops("exit 0", "echo 'Delete subvolume'; exit 1");
        assert!(!failed.delete_snapshot(&dir, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_subvolume() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join("latest");
        let ops = ops("exit 0", r#"[ "$2" = create ] && mkdir "$3""#);
        assert!(ops.create_subvolume(&latest, &CancellationToken::new()).await.unwrap());
        assert!(latest.is_dir());
    }

    #[tokio::test]
    async fn test_short_lived_tools_honour_cancellation() {
        let ops = ops("exec sleep 30", "exec sleep 30");
        let (src, dst) = paths();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let limit = Duration::from_secs(5);
        let estimate = tokio::time::timeout(limit, ops.estimate_work(&src, &dst, &cancel)).await.unwrap();
        assert!(matches!(estimate, Err(OperationError::Cancelled)));

        let snapshot = tokio::time::timeout(limit, ops.create_snapshot(&dst, &src, &cancel)).await.unwrap();
        assert!(matches!(snapshot, Err(OperationError::Cancelled)));

        let deleted = tokio::time::timeout(limit, ops.delete_snapshot(&dst, &cancel)).await.unwrap();
        assert!(matches!(deleted, Err(OperationError::Cancelled)));
    }
}

//! Snapshot Agent - Main entry point
//!
//! Backs up a directory tree onto a removable btrfs volume.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snapshot_agent::config::Config;
use snapshot_agent::disks::{DiskInfo, FixedMount, MountedDevice};
use snapshot_agent::progress::{format_duration, ProgressThrottle};
use snapshot_agent::session::{self, BackupSession};
use snapshot_agent::shutdown::ShutdownCoordinator;
use snapshot_agent::{utils, BackupTarget, SyncOperations};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync the source into `latest` and snapshot it
    Run {
        /// Source directory (overrides config)
        #[arg(short, long)]
        source: Option<PathBuf>,
    },

    /// Dry-run only: report how much work a backup would do
    Estimate {
        /// Source directory (overrides config)
        #[arg(short, long)]
        source: Option<PathBuf>,
    },

    /// List snapshots on the backup volume
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Delete the snapshot taken at TIMESTAMP
    Delete {
        /// Unix timestamp from the snapshot name (backup_<TIMESTAMP>)
        timestamp: i64,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let shutdown = ShutdownCoordinator::new();
    let cancel = shutdown.token();
    let signals = tokio::spawn(async move { shutdown.wait_for_signal().await });

    let result = dispatch(args.command, &config, &cancel).await;
    signals.abort();
    result
}

async fn dispatch(command: Command, config: &Config, cancel: &CancellationToken) -> Result<()> {
    let target = || resolve_target(config);
    let ops = SyncOperations::new(config.tools.clone());

    match command {
        Command::Run { source } => {
            let source = source.unwrap_or_else(|| config.backup.source_dir.clone());
            let session = BackupSession::new(source, target()?, ops)?;

            let mut throttle = ProgressThrottle::default();
            let record = session
                .run(
                    |p| {
                        if throttle.ready() || p.is_complete() {
                            tracing::info!(
                                "{:>5.1}% ({}/{} units, {}/s, eta {})",
                                p.percent_complete,
                                p.completed_units,
                                p.total_units,
                                p.units_per_second,
                                format_duration(p.eta_seconds)
                            );
                        }
                    },
                    cancel,
                )
                .await?;
            println!("{}", record.name());
        }
        Command::Estimate { source } => {
            let source = source.unwrap_or_else(|| config.backup.source_dir.clone());
            let estimate = ops
                .estimate_work(&source, &target()?.latest_dir(), cancel)
                .await?
                .context("rsync dry-run failed")?;
            println!("{}", estimate.units);
        }
        Command::List { json } => {
            let snapshots = session::list_backups(&target()?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else {
                for snapshot in snapshots {
                    let created = snapshot
                        .created_at()
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:>12}  {}  {}", snapshot.timestamp, created, snapshot.path.display());
                }
            }
        }
        Command::Delete { timestamp } => {
            if !session::delete_backup(&target()?, &ops, timestamp, cancel).await? {
                anyhow::bail!("snapshot backup_{} could not be deleted", timestamp);
            }
        }
        Command::ShowConfig => print!("{}", config.to_toml()?),
    }

    Ok(())
}

fn resolve_target(config: &Config) -> Result<BackupTarget> {
    let disk: Box<dyn DiskInfo> = match (&config.backup.device, &config.backup.mount_path) {
        (Some(device), _) => Box::new(
            MountedDevice::probe(device).context("failed to read the mount table")?,
        ),
        (None, Some(mount_path)) => Box::new(FixedMount::new(mount_path)),
        (None, None) => anyhow::bail!("no backup volume configured"),
    };
    Ok(BackupTarget::resolve(disk.as_ref(), &config.backup.sub_dir)?)
}

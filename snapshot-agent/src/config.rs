//! Configuration management for the snapshot agent.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`SNAPSHOT_AGENT_<SECTION>__<KEY>`, e.g. `SNAPSHOT_AGENT_LOG__LEVEL=debug`).

use crate::utils::errors::BackupError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "SNAPSHOT_AGENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory tree to back up
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Block device of the backup volume, resolved through the mount table
    #[serde(default)]
    pub device: Option<PathBuf>,

    /// Mount point of the backup volume, used as-is
    #[serde(default)]
    pub mount_path: Option<PathBuf>,

    /// Subdirectory of the volume holding `latest` and the snapshots
    #[serde(default)]
    pub sub_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// rsync command prefix; sync arguments are appended
    #[serde(default = "default_rsync")]
    pub rsync: Vec<String>,

    /// btrfs command prefix; `subvolume ...` arguments are appended
    #[serde(default = "default_btrfs")]
    pub btrfs: Vec<String>,

    /// Maximum number of unread rsync output lines held in memory
    #[serde(default = "default_line_buffer")]
    pub line_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_source_dir() -> PathBuf {
    PathBuf::from("/")
}

fn default_rsync() -> Vec<String> {
    vec!["rsync".to_string()]
}

fn default_btrfs() -> Vec<String> {
    vec!["/sbin/btrfs".to_string()]
}

fn default_line_buffer() -> usize {
    crate::process::DEFAULT_LINE_BUFFER
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            device: None,
            mount_path: None,
            sub_dir: PathBuf::new(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            rsync: default_rsync(),
            btrfs: default_btrfs(),
            line_buffer: default_line_buffer(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("tools.rsync")
                    .with_list_parse_key("tools.btrfs")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), BackupError> {
        if !self.backup.source_dir.is_absolute() {
            return Err(BackupError::Config(format!(
                "source_dir must be absolute: {}",
                self.backup.source_dir.display()
            )));
        }
        match (&self.backup.device, &self.backup.mount_path) {
            (Some(_), Some(_)) => {
                return Err(BackupError::Config(
                    "set either device or mount_path, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(BackupError::Config(
                    "no backup volume configured (device or mount_path)".to_string(),
                ))
            }
            _ => {}
        }
        if self.backup.sub_dir.is_absolute() {
            return Err(BackupError::Config(format!(
                "sub_dir must be relative to the volume: {}",
                self.backup.sub_dir.display()
            )));
        }
        if self.tools.rsync.is_empty() || self.tools.btrfs.is_empty() {
            return Err(BackupError::Config("tool commands must not be empty".to_string()));
        }
        if self.tools.line_buffer == 0 {
            return Err(BackupError::Config("line_buffer must be at least 1".to_string()));
        }
        Ok(())
    }
}

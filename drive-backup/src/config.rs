//! Configuration management for drive-backup.
//!
//! Loaded once from a TOML file at startup; never reloaded while running.

use crate::retention::RetentionPolicy;
use crate::utils::errors::{BackupError, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Daily trigger time, `HH:MM` local time
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Whether the scheduler loop fires at all
    #[serde(default = "default_true")]
    pub schedule_enabled: bool,

    #[serde(default = "default_max_keep")]
    pub max_keep_daily_backups: usize,

    #[serde(default = "default_max_keep")]
    pub max_keep_generational_backups: usize,

    /// Notification webhook; none means notifications are skipped
    #[serde(default)]
    pub webhook: Option<String>,

    /// Display name used in notification titles
    #[serde(default = "default_name")]
    pub name: String,

    /// Drive folder id receiving the archives
    #[serde(alias = "google_drvie_folder")]
    pub google_drive_folder: String,

    /// Source paths archived on every run
    #[serde(default = "default_items")]
    pub items: Vec<PathBuf>,

    /// Staging directory for local archives
    #[serde(default = "std::env::temp_dir")]
    pub archive_dir: PathBuf,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Scheduler settings derived from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub time_of_day: NaiveTime,
    pub enabled: bool,
}

// Default values
fn default_schedule() -> String {
    "00:00".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_keep() -> usize {
    10
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "drive-backup".to_string())
}

fn default_items() -> Vec<PathBuf> {
    vec![PathBuf::from("/backup")]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse `HH:MM` (24h).
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| BackupError::Config(format!("Invalid schedule '{}', expected HH:MM: {}", value, e)))
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        parse_time_of_day(&self.schedule)?;
        if self.google_drive_folder.trim().is_empty() {
            return Err(BackupError::Config("google_drive_folder must not be empty".into()));
        }
        Ok(())
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_keep_daily: self.max_keep_daily_backups,
            max_keep_generational: self.max_keep_generational_backups,
        }
    }

    pub fn schedule_config(&self) -> Result<ScheduleConfig> {
        Ok(ScheduleConfig {
            time_of_day: parse_time_of_day(&self.schedule)?,
            enabled: self.schedule_enabled,
        })
    }
}

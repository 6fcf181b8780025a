//! Backup tiers and the archive naming convention that carries them.
//!
//! An archive's tier is decided once, from the trigger timestamp, and then
//! written into its file name. Retention later reads the tier back from the
//! remote object's name, so [`archive_file_name`] and [`BackupTier::of_name`]
//! must always agree on [`GENERATIONAL_MARKER`].

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker embedded in generational archive names (matched case-insensitively).
pub const GENERATIONAL_MARKER: &str = "generational";

/// Leading part of every archive name.
pub const ARCHIVE_PREFIX: &str = "backup_";

/// File extension of every archive bundle.
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Timestamp layout used in archive names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTier {
    Daily,
    Generational,
}

impl BackupTier {
    /// A run is generational iff it falls on the first day of the month.
    pub fn for_timestamp(timestamp: NaiveDateTime) -> Self {
        if timestamp.day() == 1 {
            BackupTier::Generational
        } else {
            BackupTier::Daily
        }
    }

    /// Classify a remote object by its name.
    pub fn of_name(name: &str) -> Self {
        if name.to_lowercase().contains(GENERATIONAL_MARKER) {
            BackupTier::Generational
        } else {
            BackupTier::Daily
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupTier::Daily => "daily",
            BackupTier::Generational => "generational",
        }
    }
}

impl fmt::Display for BackupTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `backup_<YYYYMMDD-HHMMSS>[_generational].zip`
pub fn archive_file_name(timestamp: NaiveDateTime, tier: BackupTier) -> String {
    let suffix = match tier {
        BackupTier::Generational => format!("_{}", GENERATIONAL_MARKER),
        BackupTier::Daily => String::new(),
    };
    format!(
        "{}{}{}.{}",
        ARCHIVE_PREFIX,
        timestamp.format(TIMESTAMP_FORMAT),
        suffix,
        ARCHIVE_EXTENSION
    )
}

/// True for names this tool produces; anything else in the folder is
/// never a retention candidate.
pub fn is_archive_name(name: &str) -> bool {
    let extension = format!(".{}", ARCHIVE_EXTENSION);
    name.starts_with(ARCHIVE_PREFIX)
        && name.len() > extension.len()
        && name
            .get(name.len() - extension.len()..)
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&extension))
}

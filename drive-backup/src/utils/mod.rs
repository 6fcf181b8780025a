//! Utility modules for drive-backup.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{BackupError, Result};

//! drive-backup library
//!
//! Archives a set of directories on a daily schedule, uploads the bundle to
//! a Google Drive folder and keeps the folder bounded with a two-tier
//! (daily / generational) retention policy.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod notify;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod tier;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;

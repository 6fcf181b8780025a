//! Custom error types for drive-backup.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Archive write error: {0}")]
    ArchiveWrite(String),

    #[error("Remote list error: {0}")]
    RemoteList(String),

    #[error("Remote upload error: {0}")]
    RemoteUpload(String),

    #[error("Remote delete error: {0}")]
    RemoteDelete(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;

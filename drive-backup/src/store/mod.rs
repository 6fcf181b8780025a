//! Remote object store capability.
//!
//! The orchestrator only needs three primitives against one container:
//! list everything, upload a file as a new object, delete an object by id.

pub mod google_drive;
pub mod memory;

use crate::tier::BackupTier;
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One archive as reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    /// Absent for objects the store has not finalized yet
    pub size_bytes: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl RemoteObject {
    pub fn tier(&self) -> BackupTier {
        BackupTier::of_name(&self.name)
    }
}

/// Result of a delete that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The object was already removed by someone else.
    AlreadyGone,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Complete listing of `container_id`; never a partial page.
    async fn list(&self, container_id: &str) -> Result<Vec<RemoteObject>>;

    /// Upload `local_path` as `remote_name`, returning the new object id.
    async fn upload(&self, local_path: &Path, remote_name: &str, container_id: &str) -> Result<String>;

    async fn delete(&self, remote_id: &str) -> Result<DeleteOutcome>;
}

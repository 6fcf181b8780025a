//! In-memory remote store.
//!
//! Keeps objects per container and stamps uploads with a strictly
//! increasing modification time. Failures can be injected per primitive,
//! which makes it the store of choice for exercising the orchestrator.

use super::{DeleteOutcome, RemoteObject, RemoteStore};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct StoreState {
    /// container id -> object id -> object
    containers: BTreeMap<String, BTreeMap<String, RemoteObject>>,
    next_id: u64,
    clock: Option<DateTime<Utc>>,
    fail_list: bool,
    fail_upload: bool,
    fail_delete: HashSet<String>,
    list_calls: usize,
    upload_calls: usize,
    delete_calls: Vec<String>,
}

/// Remote store kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing object into `container_id`.
    pub async fn insert(&self, container_id: &str, object: RemoteObject) {
        let mut state = self.state.write().await;
        state
            .containers
            .entry(container_id.to_string())
            .or_default()
            .insert(object.id.clone(), object);
    }

    pub async fn objects(&self, container_id: &str) -> Vec<RemoteObject> {
        let state = self.state.read().await;
        state
            .containers
            .get(container_id)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn set_fail_list(&self, fail: bool) {
        self.state.write().await.fail_list = fail;
    }

    pub async fn set_fail_upload(&self, fail: bool) {
        self.state.write().await.fail_upload = fail;
    }

    /// Make every delete of `remote_id` fail.
    pub async fn fail_delete_of(&self, remote_id: &str) {
        self.state.write().await.fail_delete.insert(remote_id.to_string());
    }

    pub async fn list_calls(&self) -> usize {
        self.state.read().await.list_calls
    }

    pub async fn upload_calls(&self) -> usize {
        self.state.read().await.upload_calls
    }

    /// Ids passed to `delete`, in call order.
    pub async fn delete_calls(&self) -> Vec<String> {
        self.state.read().await.delete_calls.clone()
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn list(&self, container_id: &str) -> Result<Vec<RemoteObject>> {
        let mut state = self.state.write().await;
        state.list_calls += 1;
        if state.fail_list {
            return Err(BackupError::RemoteList(format!(
                "listing {} failed (injected)",
                container_id
            )));
        }
        Ok(state
            .containers
            .get(container_id)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upload(&self, local_path: &Path, remote_name: &str, container_id: &str) -> Result<String> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| BackupError::RemoteUpload(format!("{}: {}", local_path.display(), e)))?
            .len();

        let mut state = self.state.write().await;
        state.upload_calls += 1;
        if state.fail_upload {
            return Err(BackupError::RemoteUpload(format!(
                "upload of {} failed (injected)",
                remote_name
            )));
        }

        // Strictly after everything uploaded so far, and never in the past.
        let now = Utc::now();
        let modified_at = match state.clock {
            Some(last) if last >= now => last + Duration::milliseconds(1),
            _ => now,
        };
        state.clock = Some(modified_at);
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);

        state
            .containers
            .entry(container_id.to_string())
            .or_default()
            .insert(
                id.clone(),
                RemoteObject {
                    id: id.clone(),
                    name: remote_name.to_string(),
                    size_bytes: Some(size),
                    modified_at: Some(modified_at),
                },
            );

        Ok(id)
    }

    async fn delete(&self, remote_id: &str) -> Result<DeleteOutcome> {
        let mut state = self.state.write().await;
        state.delete_calls.push(remote_id.to_string());
        if state.fail_delete.contains(remote_id) {
            return Err(BackupError::RemoteDelete(format!(
                "delete of {} failed (injected)",
                remote_id
            )));
        }

        let removed = state
            .containers
            .values_mut()
            .any(|objects| objects.remove(remote_id).is_some());

        Ok(if removed {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::AlreadyGone
        })
    }
}

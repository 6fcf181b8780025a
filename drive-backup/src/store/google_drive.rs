//! Google Drive v3 implementation of [`RemoteStore`].
//!
//! A container is a Drive folder id. Listing follows `nextPageToken` until
//! the folder is exhausted, uploads use a resumable session with the body
//! streamed from disk, and a 404 on delete counts as already gone.

use super::{DeleteOutcome, RemoteObject, RemoteStore};
use crate::tier::is_archive_name;
use crate::transfer::progress_stream::{ProgressCallback, ProgressStream};
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::format_bytes;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_cloud_token::{TokenSource, TokenSourceProvider};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Full Drive access; needed to delete files the service account created.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com";

const ARCHIVE_MIME_TYPE: &str = "application/zip";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const LIST_PAGE_SIZE: u32 = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces the `Authorization` header value for Drive requests.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn authorization(&self) -> Result<String>;
}

/// Bearer tokens for a service account, refreshed by `google-cloud-auth`.
pub struct ServiceAccountAuth {
    source: Arc<dyn TokenSource>,
}

impl ServiceAccountAuth {
    /// Load a service account key file.
    pub async fn from_file(key_path: &Path) -> Result<Self> {
        let key_json = tokio::fs::read_to_string(key_path).await.map_err(|e| {
            BackupError::Auth(format!(
                "Failed to read service account key file '{}': {}",
                key_path.display(),
                e
            ))
        })?;

        Self::from_json(&key_json).await
    }

    pub async fn from_json(json: &str) -> Result<Self> {
        use google_cloud_auth::credentials::CredentialsFile;

        let creds: CredentialsFile = serde_json::from_str(json)
            .map_err(|e| BackupError::Auth(format!("Failed to parse service account JSON: {}", e)))?;

        let config = google_cloud_auth::project::Config::default().with_scopes(&[DRIVE_SCOPE]);

        let provider = google_cloud_auth::token::DefaultTokenSourceProvider::new_with_credentials(
            config,
            Box::new(creds),
        )
        .await
        .map_err(|e| {
            BackupError::Auth(format!(
                "Failed to create token source from service account: {}",
                e
            ))
        })?;

        Ok(Self {
            source: provider.token_source(),
        })
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountAuth {
    async fn authorization(&self) -> Result<String> {
        let token = self
            .source
            .token()
            .await
            .map_err(|e| BackupError::Auth(format!("Failed to get token: {}", e)))?;
        Ok(bearer(&token))
    }
}

/// A fixed token, for tests and pre-issued credentials.
pub struct StaticToken(pub String);

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn authorization(&self) -> Result<String> {
        Ok(bearer(&self.0))
    }
}

fn bearer(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {}", token)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    mime_type: Option<String>,
    /// Decimal string; absent for folders and shortcuts
    size: Option<String>,
    modified_time: Option<String>,
}

impl DriveFile {
    /// Only archives cross into [`RemoteObject`]. Deleting a folder on
    /// Drive removes its whole subtree.
    fn is_backup_archive(&self) -> bool {
        self.mime_type.as_deref() != Some(FOLDER_MIME_TYPE) && is_archive_name(&self.name)
    }
}

impl From<DriveFile> for RemoteObject {
    fn from(file: DriveFile) -> Self {
        RemoteObject {
            size_bytes: file.size.and_then(|s| s.parse().ok()),
            modified_at: file
                .modified_time
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc)),
            id: file.id,
            name: file.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

pub struct GoogleDriveStore {
    client: reqwest::Client,
    api_base: String,
    auth: Arc<dyn AccessTokenSource>,
}

impl GoogleDriveStore {
    pub fn new(client: reqwest::Client, auth: Arc<dyn AccessTokenSource>) -> Self {
        Self::with_api_base(client, auth, DEFAULT_API_BASE)
    }

    pub fn with_api_base(
        client: reqwest::Client,
        auth: Arc<dyn AccessTokenSource>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    async fn list_page(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<FileList> {
        let authorization = self
            .auth
            .authorization()
            .await
            .map_err(|e| BackupError::RemoteList(e.to_string()))?;

        let page_size = LIST_PAGE_SIZE.to_string();
        let mut params = vec![
            ("q", query),
            ("fields", "nextPageToken,files(id,name,mimeType,size,modifiedTime)"),
            ("pageSize", page_size.as_str()),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let resp = self
            .client
            .get(format!("{}/drive/v3/files", self.api_base))
            .header(header::AUTHORIZATION, authorization)
            .query(&params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| BackupError::RemoteList(format!("List request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackupError::RemoteList(format!(
                "List failed with status {}: {}",
                status, body
            )));
        }

        resp.json::<FileList>()
            .await
            .map_err(|e| BackupError::RemoteList(format!("Invalid list response: {}", e)))
    }

    /// Open a resumable upload session and return its URL.
    async fn start_upload_session(
        &self,
        remote_name: &str,
        container_id: &str,
        size: u64,
    ) -> Result<String> {
        let authorization = self
            .auth
            .authorization()
            .await
            .map_err(|e| BackupError::RemoteUpload(e.to_string()))?;

        let resp = self
            .client
            .post(format!("{}/upload/drive/v3/files", self.api_base))
            .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")])
            .header(header::AUTHORIZATION, authorization)
            .header("X-Upload-Content-Type", ARCHIVE_MIME_TYPE)
            .header("X-Upload-Content-Length", size.to_string())
            .timeout(REQUEST_TIMEOUT)
            .json(&serde_json::json!({
                "name": remote_name,
                "parents": [container_id],
                "mimeType": ARCHIVE_MIME_TYPE,
            }))
            .send()
            .await
            .map_err(|e| BackupError::RemoteUpload(format!("Upload session request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackupError::RemoteUpload(format!(
                "Upload session failed with status {}: {}",
                status, body
            )));
        }

        resp.headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BackupError::RemoteUpload("Upload session has no Location header".into()))
    }
}

/// Drive query string literal: backslash and single quote are escaped.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[async_trait]
impl RemoteStore for GoogleDriveStore {
    async fn list(&self, container_id: &str) -> Result<Vec<RemoteObject>> {
        let query = format!(
            "{} in parents and trashed = false and mimeType != {}",
            quote(container_id),
            quote(FOLDER_MIME_TYPE)
        );
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;
        let mut ignored = 0usize;

        loop {
            let page = self.list_page(&query, page_token.as_deref()).await?;
            pages += 1;
            for file in page.files {
                if file.is_backup_archive() {
                    objects.push(RemoteObject::from(file));
                } else {
                    ignored += 1;
                    debug!(id = %file.id, name = %file.name, "Ignoring non-archive entry");
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(container = %container_id, objects = objects.len(), ignored, pages, "Listed remote folder");
        Ok(objects)
    }

    async fn upload(&self, local_path: &Path, remote_name: &str, container_id: &str) -> Result<String> {
        let file = tokio::fs::File::open(local_path).await.map_err(|e| {
            BackupError::RemoteUpload(format!("Cannot open {}: {}", local_path.display(), e))
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|e| BackupError::RemoteUpload(format!("Cannot stat {}: {}", local_path.display(), e)))?
            .len();

        info!(name = %remote_name, size = %format_bytes(size), "Starting upload");
        let session_url = self.start_upload_session(remote_name, container_id, size).await?;

        let name = remote_name.to_string();
        let progress_callback: ProgressCallback = Arc::new(move |sent: u64| {
            let percent = if size > 0 { sent * 100 / size } else { 100 };
            debug!(name = %name, sent = %format_bytes(sent), percent, "Upload progress");
        });
        let body = reqwest::Body::wrap_stream(ProgressStream::new(ReaderStream::new(file), progress_callback));

        // The session URL is pre-authorized; no bearer token needed.
        let resp = self
            .client
            .put(session_url)
            .header(header::CONTENT_LENGTH, size.to_string())
            .header(header::CONTENT_TYPE, ARCHIVE_MIME_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| BackupError::RemoteUpload(format!("Upload request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackupError::RemoteUpload(format!(
                "Upload failed with status {}: {}",
                status, body
            )));
        }

        let created = resp
            .json::<CreatedFile>()
            .await
            .map_err(|e| BackupError::RemoteUpload(format!("Invalid upload response: {}", e)))?;

        info!(name = %remote_name, id = %created.id, "Upload complete");
        Ok(created.id)
    }

    async fn delete(&self, remote_id: &str) -> Result<DeleteOutcome> {
        let authorization = self
            .auth
            .authorization()
            .await
            .map_err(|e| BackupError::RemoteDelete(e.to_string()))?;

        let resp = self
            .client
            .delete(format!("{}/drive/v3/files/{}", self.api_base, remote_id))
            .query(&[("supportsAllDrives", "true")])
            .header(header::AUTHORIZATION, authorization)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| BackupError::RemoteDelete(format!("Delete request for {} failed: {}", remote_id, e)))?;

        match resp.status() {
            status if status.is_success() => Ok(DeleteOutcome::Deleted),
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::AlreadyGone),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(BackupError::RemoteDelete(format!(
                    "Delete of {} failed with status {}: {}",
                    remote_id, status, body
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use wiremock::matchers::{body_bytes, header as header_is, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> GoogleDriveStore {
        GoogleDriveStore::with_api_base(
            reqwest::Client::new(),
            Arc::new(StaticToken("test-token".into())),
            server.uri(),
        )
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("abc"), "'abc'");
        assert_eq!(quote("it's"), "'it\\'s'");
        assert_eq!(quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_bearer_prefix_added_once() {
        assert_eq!(bearer("abc"), "Bearer abc");
        assert_eq!(bearer("Bearer abc"), "Bearer abc");
    }

    #[test]
    fn test_drive_file_conversion() {
        let object = RemoteObject::from(DriveFile {
            id: "1".into(),
            name: "backup_20240101-000000_generational.zip".into(),
            mime_type: Some("application/zip".into()),
            size: Some("2048".into()),
            modified_time: Some("2024-01-01T00:05:00.123Z".into()),
        });
        assert_eq!(object.size_bytes, Some(2048));
        assert_eq!(
            object.modified_at.map(|t| t.to_rfc3339()),
            Some("2024-01-01T00:05:00.123+00:00".to_string())
        );

        let pending = RemoteObject::from(DriveFile {
            id: "2".into(),
            name: "x".into(),
            mime_type: None,
            size: Some("not-a-number".into()),
            modified_time: Some("yesterday".into()),
        });
        assert_eq!(pending.size_bytes, None);
        assert_eq!(pending.modified_at, None);
    }

    #[tokio::test]
    async fn test_list_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param(
                "q",
                "'folder-1' in parents and trashed = false and mimeType != 'application/vnd.google-apps.folder'",
            ))
            .and(query_param_is_missing("pageToken"))
            .and(header_is("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nextPageToken": "page-2",
                "files": [
                    {"id": "a", "name": "backup_20240102-000000.zip", "size": "10", "modifiedTime": "2024-01-02T00:00:10Z"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("pageToken", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [
                    {"id": "b", "name": "backup_20240201-000000_generational.zip", "modifiedTime": "2024-02-01T00:00:10Z"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let objects = store(&server).list("folder-1").await.unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].id, "a");
        assert_eq!(objects[0].size_bytes, Some(10));
        assert_eq!(objects[1].id, "b");
        assert_eq!(objects[1].size_bytes, None);
    }

    #[tokio::test]
    async fn test_list_skips_folders_and_foreign_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [
                    {"id": "subfolder", "name": "old", "mimeType": "application/vnd.google-apps.folder", "modifiedTime": "2020-01-01T00:00:00Z"},
                    {"id": "named-folder", "name": "backup_archive.zip", "mimeType": "application/vnd.google-apps.folder"},
                    {"id": "notes", "name": "README.txt", "mimeType": "text/plain", "size": "5", "modifiedTime": "2020-01-01T00:00:00Z"},
                    {"id": "d1", "name": "backup_20240102-000000.zip", "mimeType": "application/zip", "size": "10", "modifiedTime": "2024-01-02T00:00:10Z"}
                ]
            })))
            .mount(&server)
            .await;

        let objects = store(&server).list("folder-1").await.unwrap();
        let ids: Vec<&str> = objects.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["d1"]);
    }

    #[tokio::test]
    async fn test_list_fails_whole_call_on_bad_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param_is_missing("pageToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nextPageToken": "page-2",
                "files": [{"id": "a", "name": "backup_a.zip"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("pageToken", "page-2"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = store(&server).list("folder-1").await.unwrap_err();
        assert!(matches!(err, BackupError::RemoteList(msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn test_resumable_upload() {
        let server = MockServer::start().await;
        let session = format!("{}/upload-session/xyz", server.uri());
        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .and(query_param("uploadType", "resumable"))
            .and(header_is("x-upload-content-length", "7"))
            .respond_with(ResponseTemplate::new(200).insert_header("Location", session.as_str()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload-session/xyz"))
            .and(body_bytes(b"zipdata".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "new-file-id",
                "name": "backup_20240512-030405.zip"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"zipdata").unwrap();

        let id = store(&server)
            .upload(file.path(), "backup_20240512-030405.zip", "folder-1")
            .await
            .unwrap();
        assert_eq!(id, "new-file-id");
    }

    #[tokio::test]
    async fn test_upload_session_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("insufficient permissions"))
            .mount(&server)
            .await;

        let file = NamedTempFile::new().unwrap();
        let err = store(&server)
            .upload(file.path(), "backup.zip", "folder-1")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::RemoteUpload(msg) if msg.contains("403")));
    }

    #[tokio::test]
    async fn test_delete_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/drive/v3/files/present"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/drive/v3/files/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/drive/v3/files/locked"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let store = store(&server);
        assert_eq!(store.delete("present").await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete("gone").await.unwrap(), DeleteOutcome::AlreadyGone);
        assert!(matches!(store.delete("locked").await, Err(BackupError::RemoteDelete(_))));
    }
}

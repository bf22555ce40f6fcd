//! File storage: blob metadata plus resumable content transfer
//!
//! Files move in two steps. A metadata exchange against the blob service
//! yields a short-lived `_uploadURL` or `_downloadURL` pointing at backing
//! storage; the content then moves through the resumable transfer engine
//! against that URL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::instrument;
use uuid::Uuid;

use crate::client::Kinvey;
use crate::error::{Error, Result};
use crate::request::RequestBuilder;
use crate::transfer::{
    load_checkpoint, CancellationToken, ResumableDownload, ResumableUpload, TransferContext,
    TransferState, UploadSource,
};

/// System metadata the backend maintains on a file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileSystemMetadata {
    /// Last modification time
    #[serde(rename = "lmt", default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Creation time
    #[serde(rename = "ect", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Metadata describing a stored file
///
/// The same shape travels both ways: clients send what they know when
/// creating a file, the backend fills in the rest and, depending on the
/// exchange, a transfer URL for the content.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_filename", default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Whether the file is readable without authentication
    #[serde(rename = "_public", default)]
    pub public: bool,
    #[serde(rename = "_acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Value>,
    #[serde(rename = "_kmd", default, skip_serializing_if = "Option::is_none")]
    pub kmd: Option<FileSystemMetadata>,
    /// Short-lived content upload URL, present on upload exchanges only
    #[serde(rename = "_uploadURL", default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    /// Short-lived content download URL, present on download exchanges only
    #[serde(rename = "_downloadURL", default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Headers backing storage requires on every content request
    #[serde(
        rename = "_requiredHeaders",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub required_headers: HashMap<String, String>,
}

#[derive(Deserialize)]
struct CountResponse {
    count: u64,
}

/// Handle over the blob service
///
/// Cheap to clone. Transfers started from a handle observe its cancellation
/// token, so one handle per transfer gives per-transfer cancellation.
#[derive(Clone)]
pub struct FileStore {
    client: Kinvey,
    cancel: CancellationToken,
}

impl FileStore {
    pub(crate) fn new(client: Kinvey) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a cancellation token observed by transfers from this handle
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Upload a local file, resuming a matching partial upload when one is
    /// checkpointed
    #[instrument(skip(self, metadata))]
    pub async fn upload_file(&self, path: &Path, metadata: FileMetadata) -> Result<FileMetadata> {
        let file = fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        let mut metadata = metadata;
        if metadata.filename.is_none() {
            metadata.filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
        }
        if metadata.mime_type.is_none() {
            metadata.mime_type =
                Some(mime_guess::from_path(path).first_or_octet_stream().to_string());
        }
        self.upload_source(UploadSource::File(file), size, metadata)
            .await
    }

    /// Upload an in-memory payload
    #[instrument(skip(self, data, metadata))]
    pub async fn upload_bytes(
        &self,
        data: bytes::Bytes,
        metadata: FileMetadata,
    ) -> Result<FileMetadata> {
        let size = data.len() as u64;
        let mut metadata = metadata;
        if metadata.mime_type.is_none() {
            metadata.mime_type = Some("application/octet-stream".to_string());
        }
        self.upload_source(UploadSource::Memory(data), size, metadata)
            .await
    }

    /// Fetch file metadata, including a fresh download URL
    #[instrument(skip(self))]
    pub async fn find_by_id(&self, file_id: &str) -> Result<FileMetadata> {
        let descriptor = RequestBuilder::new(
            self.client.config(),
            Method::GET,
            "blob/{appKey}/{id}",
        )
        .param("id", file_id)
        .build()?;
        self.client.execute_json(descriptor).await
    }

    /// Download a file into the configured storage directory, named after
    /// its stored filename
    #[instrument(skip(self))]
    pub async fn download(&self, file_id: &str) -> Result<(FileMetadata, PathBuf)> {
        let metadata = self.find_by_id(file_id).await?;
        let filename = metadata
            .filename
            .as_deref()
            .map(sanitize_filename)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| file_id.to_string());
        let destination = self.client.config().file_storage_path().join(filename);
        self.download_content(&metadata, file_id, &destination).await?;
        Ok((metadata, destination))
    }

    /// Download a file to an explicit path, resuming a matching partial
    /// download when one is checkpointed
    #[instrument(skip(self))]
    pub async fn download_to_path(&self, file_id: &str, destination: &Path) -> Result<FileMetadata> {
        let metadata = self.find_by_id(file_id).await?;
        self.download_content(&metadata, file_id, destination).await?;
        Ok(metadata)
    }

    /// Remove a file and its content, returning how many records were removed
    #[instrument(skip(self))]
    pub async fn delete(&self, file_id: &str) -> Result<u64> {
        let descriptor = RequestBuilder::new(
            self.client.config(),
            Method::DELETE,
            "blob/{appKey}/{id}",
        )
        .param("id", file_id)
        .build()?;
        let outcome: CountResponse = self.client.execute_json(descriptor).await?;
        Ok(outcome.count)
    }

    async fn upload_source(
        &self,
        source: UploadSource,
        size: u64,
        mut metadata: FileMetadata,
    ) -> Result<FileMetadata> {
        // A client-assigned id keeps re-runs of the same logical upload
        // under one resumable checkpoint
        if metadata.id.is_none() {
            metadata.id = Some(Uuid::new_v4().to_string());
        }
        metadata.size = Some(size);

        let saved = self.save_metadata(&metadata).await?;
        let id = saved
            .id
            .clone()
            .or_else(|| metadata.id.clone())
            .ok_or_else(|| Error::InvalidResponse("file metadata response missing _id".to_string()))?;
        let upload_url = saved.upload_url.clone().ok_or_else(|| {
            Error::InvalidResponse("file metadata response missing _uploadURL".to_string())
        })?;

        let state = match load_checkpoint(self.client.offline_store().as_ref(), &id).await {
            Some(state) if state.total_size == Some(size) => state,
            _ => TransferState::new(id.clone(), Some(size)),
        };

        ResumableUpload::new(
            self.transfer_context(),
            upload_url,
            saved.required_headers.clone(),
            source,
            state,
            size,
        )
        .run()
        .await?;

        let mut stored = saved;
        stored.upload_url = None;
        Ok(stored)
    }

    async fn download_content(
        &self,
        metadata: &FileMetadata,
        file_id: &str,
        destination: &Path,
    ) -> Result<TransferState> {
        let download_url = metadata.download_url.clone().ok_or_else(|| {
            Error::InvalidResponse("file metadata response missing _downloadURL".to_string())
        })?;

        let state = match load_checkpoint(self.client.offline_store().as_ref(), file_id).await {
            Some(state) if metadata.size.is_none() || state.total_size == metadata.size => state,
            _ => TransferState::new(file_id, metadata.size),
        };

        ResumableDownload::new(
            self.transfer_context(),
            download_url,
            destination.to_path_buf(),
            state,
        )
        .run()
        .await
    }

    /// Create or update the metadata record, obtaining a content URL
    async fn save_metadata(&self, metadata: &FileMetadata) -> Result<FileMetadata> {
        let body = metadata_body(metadata)?;
        let descriptor = match &metadata.id {
            Some(id) => RequestBuilder::new(
                self.client.config(),
                Method::PUT,
                "blob/{appKey}/{id}",
            )
            .param("id", id),
            None => RequestBuilder::new(self.client.config(), Method::POST, "blob/{appKey}"),
        }
        .json(&body)?
        .build()?;
        self.client.execute_json(descriptor).await
    }

    fn transfer_context(&self) -> TransferContext {
        let config = self.client.config();
        TransferContext {
            http: self.client.transfer_http().clone(),
            offline: self.client.offline_store().clone(),
            chunk_size: config.chunk_size(),
            max_attempts: config.max_attempts(),
            retry_backoff: config.retry_backoff(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Serialize metadata for a save exchange, dropping server-managed transfer
/// fields a client must never send back
fn metadata_body(metadata: &FileMetadata) -> Result<Value> {
    let mut body = serde_json::to_value(metadata)?;
    if let Some(object) = body.as_object_mut() {
        object.remove("_uploadURL");
        object.remove("_downloadURL");
        object.remove("_requiredHeaders");
        object.remove("_kmd");
    }
    Ok(body)
}

/// Strip any directory components a stored filename smuggles in
fn sanitize_filename(filename: &str) -> String {
    filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_string()
}

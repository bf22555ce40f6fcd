//! JSON-file-backed stores that survive process restarts

use crate::{Credential, CredentialStore, OfflineStore, Result, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Credential store persisting the session to a single JSON file
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Create a store backed by the given file path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The file this store reads and writes
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self) -> Result<Option<Credential>> {
        let _guard = self.lock.lock().await;
        match fs::read_to_string(&self.path).await {
            Ok(content) => {
                let cred = serde_json::from_str(&content)
                    .map_err(|e| StoreError::Corrupt(format!("credential file: {}", e)))?;
                Ok(Some(cred))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, credential: Credential) -> Result<()> {
        let _guard = self.lock.lock().await;
        let content = serde_json::to_string_pretty(&credential)?;
        tracing::debug!(path = %self.path.display(), "Persisting credential");
        write_atomic(&self.path, content.as_bytes()).await
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One record as stored on disk
///
/// The key is encoded into the file name and repeated inside the file;
/// reads verify the embedded key.
#[derive(Serialize, Deserialize)]
struct RecordFile {
    collection: String,
    id: String,
    record: Value,
}

/// Offline record store persisting each record as a JSON file under a root directory
pub struct FileOfflineStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileOfflineStore {
    /// Create a store rooted at the given directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn record_path(&self, collection: &str, id: &str) -> PathBuf {
        self.root.join(format!(
            "{}.{}.json",
            escape_file_component(collection),
            escape_file_component(id)
        ))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<RecordFile>> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let file = serde_json::from_str(&content)
                    .map_err(|e| StoreError::Corrupt(format!("record file: {}", e)))?;
                Ok(Some(file))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl OfflineStore for FileOfflineStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        let path = self.record_path(collection, id);
        match self.read_record(&path).await? {
            Some(file) if file.collection == collection && file.id == id => Ok(Some(file.record)),
            _ => Ok(None),
        }
    }

    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let file = RecordFile {
            collection: collection.to_string(),
            id: id.to_string(),
            record,
        };
        let content = serde_json::to_string_pretty(&file)?;
        tracing::debug!(collection = %collection, id = %id, "Storing offline record");
        write_atomic(&self.record_path(collection, id), content.as_bytes()).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        tracing::debug!(collection = %collection, id = %id, "Deleting offline record");
        match fs::remove_file(self.record_path(collection, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Escape a key component for use in a file name
///
/// Alphanumerics, `-` and `_` pass through; everything else, including `.`,
/// `%` and path separators, is percent-encoded. Escaped components can be
/// joined with `.` without ambiguity, and the same key always yields the
/// same file name.
fn escape_file_component(component: &str) -> String {
    use std::fmt::Write;

    let mut escaped = String::with_capacity(component.len());
    for &byte in component.as_bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            escaped.push(byte as char);
        } else {
            let _ = write!(escaped, "%{byte:02X}");
        }
    }
    escaped
}

/// Write to a temporary sibling first, then rename into place
async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
    }
    fs::rename(&temp_path, path).await?;
    Ok(())
}

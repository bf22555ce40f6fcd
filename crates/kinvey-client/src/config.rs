//! Client configuration and builder

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use url::Url;

use kinvey_store::{CredentialStore, MemoryCredentialStore, MemoryOfflineStore, OfflineStore};

use crate::error::{Error, Result};

/// Default production endpoint
pub const DEFAULT_BASE_URL: &str = "https://baas.kinvey.com/";

/// Default chunk size for resumable transfers (4 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Immutable client configuration
///
/// Built once through [`ClientBuilder`] and shared behind an `Arc` for the
/// life of the client; nothing mutates it after construction.
pub struct ClientConfig {
    app_key: String,
    app_secret: String,
    base_url: Url,
    platform_id: String,
    file_storage_path: PathBuf,
    timeout: Duration,
    max_attempts: u32,
    retry_backoff: Duration,
    chunk_size: usize,
    credential_store: Arc<dyn CredentialStore>,
    offline_store: Arc<dyn OfflineStore>,
}

impl ClientConfig {
    /// Application key identifying the backend app
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Base URL, absolute and normalized to end with a slash
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Platform identifier reported with every request
    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    /// Root directory for downloaded files
    pub fn file_storage_path(&self) -> &Path {
        &self.file_storage_path
    }

    /// Per-exchange timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Maximum attempts per exchange, the first try included
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Initial retry backoff, doubled after each failed attempt
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Fixed chunk size for resumable transfers
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn credential_store(&self) -> &Arc<dyn CredentialStore> {
        &self.credential_store
    }

    pub(crate) fn offline_store(&self) -> &Arc<dyn OfflineStore> {
        &self.offline_store
    }

    /// Platform and SDK build reported in the device info header
    pub(crate) fn device_info(&self) -> String {
        format!("{}/kinvey-client {}", self.platform_id, env!("CARGO_PKG_VERSION"))
    }

    /// Basic authorization value for app-level requests
    pub(crate) fn app_auth_header(&self) -> String {
        let token = BASE64.encode(format!("{}:{}", self.app_key, self.app_secret));
        format!("Basic {token}")
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("app_key", &self.app_key)
            .field("app_secret", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .field("platform_id", &self.platform_id)
            .field("file_storage_path", &self.file_storage_path)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff", &self.retry_backoff)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// Builder for a [`crate::Kinvey`] client
///
/// Obtained through [`crate::Kinvey::builder`]. Everything except the app key
/// and secret has a production default.
pub struct ClientBuilder {
    app_key: String,
    app_secret: String,
    base_url: String,
    platform_id: String,
    file_storage_path: Option<PathBuf>,
    timeout: Duration,
    max_attempts: u32,
    retry_backoff: Duration,
    chunk_size: usize,
    credential_store: Option<Arc<dyn CredentialStore>>,
    offline_store: Option<Arc<dyn OfflineStore>>,
}

impl ClientBuilder {
    pub(crate) fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            platform_id: "rust".to_string(),
            file_storage_path: None,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            chunk_size: DEFAULT_CHUNK_SIZE,
            credential_store: None,
            offline_store: None,
        }
    }

    /// Point the client at a different instance, for example a dedicated
    /// cluster or a local emulator
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the platform identifier reported with every request
    pub fn platform_id(mut self, platform_id: impl Into<String>) -> Self {
        self.platform_id = platform_id.into();
        self
    }

    /// Set the directory downloaded files land in
    pub fn file_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_storage_path = Some(path.into());
        self
    }

    /// Set the per-exchange timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry budget: attempts per exchange and the initial backoff,
    /// which doubles after each failed attempt
    pub fn retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    /// Set the chunk size for resumable transfers
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Install a credential store, replacing the in-memory default
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    /// Install an offline record store, replacing the in-memory default
    pub fn offline_store(mut self, store: Arc<dyn OfflineStore>) -> Self {
        self.offline_store = Some(store);
        self
    }

    /// Validate the configuration and build the client
    ///
    /// The base URL is checked here, not at request time: it must parse as an
    /// absolute http or https URL or the build fails with
    /// [`Error::InvalidBaseUrl`].
    pub fn build(self) -> Result<crate::Kinvey> {
        let config = self.into_config()?;
        crate::Kinvey::from_config(config)
    }

    pub(crate) fn into_config(self) -> Result<ClientConfig> {
        let base_url = normalize_base_url(&self.base_url)?;
        let file_storage_path = self
            .file_storage_path
            .unwrap_or_else(|| std::env::temp_dir().join("kinvey"));

        Ok(ClientConfig {
            app_key: self.app_key,
            app_secret: self.app_secret,
            base_url,
            platform_id: self.platform_id,
            file_storage_path,
            timeout: self.timeout,
            max_attempts: self.max_attempts,
            retry_backoff: self.retry_backoff,
            chunk_size: self.chunk_size,
            credential_store: self
                .credential_store
                .unwrap_or_else(|| Arc::new(MemoryCredentialStore::new())),
            offline_store: self
                .offline_store
                .unwrap_or_else(|| Arc::new(MemoryOfflineStore::new())),
        })
    }
}

/// Parse and normalize a base URL, rejecting anything that is not absolute
/// http or https
fn normalize_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|_| Error::InvalidBaseUrl(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidBaseUrl(raw.to_string()));
    }
    if url.host_str().is_none() {
        return Err(Error::InvalidBaseUrl(raw.to_string()));
    }
    // A trailing slash makes the whole path act as the join base
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Delay before retrying a failed attempt, doubling per attempt
///
/// The exponent is capped and the multiplication saturates, so any
/// configured attempt count yields a finite delay instead of overflowing.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

#[cfg(test)]
pub(crate) fn test_config(app_key: &str, app_secret: &str) -> ClientConfig {
    ClientBuilder::new(app_key, app_secret)
        .into_config()
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_absolute_https_url_verbatim() {
        let url = normalize_base_url("https://www.test.com/").unwrap();
        assert_eq!(url.as_str(), "https://www.test.com/");
    }

    #[test]
    fn test_appends_missing_trailing_slash() {
        let url = normalize_base_url("https://baas.kinvey.com/v5").unwrap();
        assert_eq!(url.as_str(), "https://baas.kinvey.com/v5/");
    }

    #[test]
    fn test_rejects_url_without_scheme() {
        assert!(matches!(
            normalize_base_url("www.test.com"),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        assert!(matches!(
            normalize_base_url("ftp://files.test.com"),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn test_builder_defaults() {
        let config = test_config("kid", "secret");
        assert_eq!(config.base_url().as_str(), DEFAULT_BASE_URL);
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_app_auth_header_is_basic() {
        let config = test_config("kid", "secret");
        // base64("kid:secret")
        assert_eq!(config.app_auth_header(), "Basic a2lkOnNlY3JldA==");
    }

    #[test]
    fn test_debug_redacts_the_secret() {
        let config = test_config("kid", "hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_backoff_delay_doubles_per_attempt() {
        let base = Duration::from_millis(10);
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 2), base * 2);
        assert_eq!(backoff_delay(base, 4), base * 8);
    }

    #[test]
    fn test_backoff_delay_caps_instead_of_overflowing() {
        let base = Duration::from_millis(10);
        // Shift exponents past the cap all land on the same ceiling
        assert_eq!(backoff_delay(base, 34), base * 65536);
        assert_eq!(backoff_delay(base, u32::MAX), base * 65536);
        assert_eq!(backoff_delay(Duration::MAX, 20), Duration::MAX);
    }
}

//! # Kinvey Store
//!
//! Storage capability interfaces for the Kinvey Rust SDK.
//!
//! This crate provides:
//! - **Credential storage**: the active user's access/refresh token pair
//! - **Offline records**: an opaque JSON record store keyed by collection and
//!   id, consumed by the SDK for transfer checkpoints
//! - **Reference implementations**: in-memory stores for tests and short-lived
//!   processes, JSON-file stores that survive process restarts
//!
//! Platform integrations (keychain, SQLite, browser storage, ...) implement
//! the same traits and are injected when the client is built:
//!
//! ```rust,ignore
//! use kinvey_store::FileCredentialStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(FileCredentialStore::new("/var/lib/app/credential.json"));
//! let client = Kinvey::builder("app-key", "app-secret")
//!     .credential_store(store)
//!     .build()?;
//! ```

pub mod credential;
pub mod error;
pub mod file;
pub mod memory;

pub use credential::Credential;
pub use error::{Result, StoreError};
pub use file::{FileCredentialStore, FileOfflineStore};
pub use memory::{MemoryCredentialStore, MemoryOfflineStore};

use async_trait::async_trait;
use serde_json::Value;

/// Trait for credential storage backends
///
/// A store holds at most one credential: the active user session. All methods
/// may be called concurrently; implementations serialize access internally.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the active credential, if any
    async fn get(&self) -> Result<Option<Credential>>;

    /// Replace the active credential
    async fn set(&self, credential: Credential) -> Result<()>;

    /// Remove the active credential
    async fn delete(&self) -> Result<()>;
}

/// Trait for offline record storage backends
///
/// Records are opaque JSON values. The SDK only ever reads back what it wrote;
/// interpretation of record contents stays with the writer.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Fetch a record
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Insert or replace a record
    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<()>;

    /// Delete a record
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
}

//! # Kinvey Client SDK
//!
//! A client SDK for the Kinvey backend-as-a-service.
//!
//! ## Features
//!
//! - **Sessions**: Signup, login, and transparent token refresh with
//!   concurrent refreshes coalesced into a single exchange
//! - **App Data**: Typed CRUD and queries over backend collections
//! - **Files**: Resumable chunked uploads and ranged downloads that survive
//!   interruptions and process restarts
//! - **Resilience**: Bounded retries with exponential backoff, idempotency
//!   aware, with structured backend errors surfaced as typed values
//!
//! ## Example
//!
//! ```rust,ignore
//! use kinvey_client::{Kinvey, Query};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Book {
//!     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
//!     id: Option<String>,
//!     title: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Create client
//!     let client = Kinvey::builder("app-key", "app-secret").build()?;
//!
//!     // Open a session
//!     client.login("alice", "hunter2").await?;
//!
//!     // Work with a collection
//!     let books = client.data_store::<Book>("books");
//!     let saved = books.save(&Book { id: None, title: "Dune".into() }).await?;
//!     let found = books.find(&Query::new().limit(10)).await?;
//!     println!("{} books", found.len());
//!
//!     // Upload a file, resumable across interruptions
//!     let files = client.file_store();
//!     files.upload_file("cover.png".as_ref(), Default::default()).await?;
//!
//!     Ok(())
//! }
//! ```

mod auth;
mod client;
mod config;
mod data;
mod error;
mod files;
mod request;
mod template;
mod transfer;

pub use auth::User;
pub use client::{Kinvey, PingResponse};
pub use config::{ClientBuilder, ClientConfig, DEFAULT_BASE_URL, DEFAULT_CHUNK_SIZE};
pub use data::{DataStore, Query};
pub use error::{Error, KinveyError, Result, REQUEST_ID_HEADER, UNKNOWN_ERROR_CODE};
pub use files::{FileMetadata, FileStore, FileSystemMetadata};
pub use request::{AuthContext, RequestBuilder, RequestDescriptor, API_VERSION};
pub use template::{encode_path_value, resolve_template};
pub use transfer::{resume_offset_from_range, CancellationToken, TransferPhase, TransferState};

// Re-export the store interfaces so hosts can plug in their own persistence
pub use kinvey_store::{Credential, CredentialStore, OfflineStore};

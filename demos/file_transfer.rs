//! Resumable file transfer example for the Kinvey Rust SDK
//!
//! This example demonstrates:
//! - Persisting sessions and transfer checkpoints across process restarts
//! - Uploading a local file in resumable chunks
//! - Cancelling a transfer cooperatively
//! - Downloading content back and verifying it
//!
//! Interrupt the upload (Ctrl-C) and run the example again: the transfer
//! picks up from the last confirmed byte instead of starting over.
//!
//! Run with: cargo run --example file_transfer

use std::sync::Arc;

use kinvey_client::{CancellationToken, FileMetadata, Kinvey};
use kinvey_store::{FileCredentialStore, FileOfflineStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 Kinvey SDK - Resumable File Transfer Example\n");

    // File-backed stores keep the session and transfer checkpoints on disk,
    // so a restarted process resumes where the last one stopped
    let state_dir = std::env::temp_dir().join("kinvey-file-transfer-demo");
    std::fs::create_dir_all(&state_dir)?;

    let client = Kinvey::builder("your-app-key", "your-app-secret")
        .credential_store(Arc::new(FileCredentialStore::new(
            state_dir.join("credential.json"),
        )))
        .offline_store(Arc::new(FileOfflineStore::new(state_dir.join("records"))))
        .file_storage_path(state_dir.join("downloads"))
        .chunk_size(1024 * 1024)
        .build()?;

    // ==================== Session ====================

    println!("👤 Opening a session...");
    if client.active_user_id().await?.is_none() {
        client.login("demo-user", "demo-password").await?;
    }
    println!("   ✅ Session ready");

    // ==================== Upload ====================

    // A fixed file id keeps every run of this example on one checkpoint
    let source = state_dir.join("payload.bin");
    tokio::fs::write(&source, vec![42u8; 8 * 1024 * 1024]).await?;

    let metadata = FileMetadata {
        id: Some("file-transfer-demo".to_string()),
        filename: Some("payload.bin".to_string()),
        ..Default::default()
    };

    // Ctrl-C asks the engine to stop at the next chunk boundary; the
    // checkpoint survives for the next run
    let cancel = CancellationToken::new();
    let cancel_handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n🛑 Cancelling at the next chunk boundary...");
            cancel_handle.cancel();
        }
    });

    println!("\n📤 Uploading 'payload.bin' (8 MiB, 1 MiB chunks)...");
    let stored = client
        .file_store()
        .with_cancellation(cancel)
        .upload_file(&source, metadata)
        .await?;
    let file_id = stored.id.clone().unwrap_or_default();
    println!(
        "   ✅ Uploaded as {} ({} bytes)",
        file_id,
        stored.size.unwrap_or_default()
    );

    // ==================== Download ====================

    println!("\n📥 Downloading it back...");
    let (fetched, local_path) = client.file_store().download(&file_id).await?;
    println!(
        "   ✅ Saved '{}' to {}",
        fetched.filename.unwrap_or_default(),
        local_path.display()
    );

    let original = tokio::fs::read(&source).await?;
    let downloaded = tokio::fs::read(&local_path).await?;
    println!(
        "   Content matches: {}",
        if original == downloaded { "yes" } else { "NO" }
    );

    // ==================== Cleanup ====================

    println!("\n🧹 Cleaning up...");
    let removed = client.file_store().delete(&file_id).await?;
    println!("   Deleted {removed} file record");

    client.logout().await?;
    println!("   ✅ Session closed");

    println!("\n✨ Example completed successfully!");

    Ok(())
}

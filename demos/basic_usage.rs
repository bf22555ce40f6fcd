//! Basic usage example for the Kinvey Rust SDK
//!
//! This example demonstrates:
//! - Building a client
//! - Signing up and logging in
//! - Saving, querying, and deleting collection entities
//! - Checking backend connectivity
//!
//! Run with: cargo run --example basic_usage

use serde::{Deserialize, Serialize};

use kinvey_client::{Kinvey, Query};

#[derive(Debug, Serialize, Deserialize)]
struct Book {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    title: String,
    author: String,
    year: i32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 Kinvey SDK - Basic Usage Example\n");

    // Build the client with your app credentials
    let client = Kinvey::builder("your-app-key", "your-app-secret").build()?;

    // ==================== Connectivity ====================

    println!("🌐 Pinging the backend...");
    let ping = client.ping().await?;
    println!(
        "   ✅ Reached {} (version {})",
        ping.kinvey.as_deref().unwrap_or("unknown"),
        ping.version.as_deref().unwrap_or("unknown")
    );

    // ==================== Session ====================

    println!("\n👤 Opening a session...");
    let user = match client.login("demo-user", "demo-password").await {
        Ok(user) => user,
        Err(error) => {
            println!("   Login failed ({error}), signing up instead");
            client.signup("demo-user", "demo-password").await?
        }
    };
    println!("   ✅ Session open for '{}' (id {})", user.username, user.id);

    // ==================== Data Operations ====================

    let books = client.data_store::<Book>("books");

    println!("\n📤 Saving entities...");
    let dune = books
        .save(&Book {
            id: None,
            title: "Dune".to_string(),
            author: "Frank Herbert".to_string(),
            year: 1965,
        })
        .await?;
    let dune_id = dune.id.clone().unwrap_or_default();
    println!("   ✅ Saved '{}' with id {}", dune.title, dune_id);

    books
        .save(&Book {
            id: None,
            title: "Hyperion".to_string(),
            author: "Dan Simmons".to_string(),
            year: 1989,
        })
        .await?;
    println!("   ✅ Saved 'Hyperion'");

    // Updating reuses the id the backend assigned
    let updated = books
        .save(&Book {
            id: Some(dune_id.clone()),
            title: "Dune".to_string(),
            author: "Frank Herbert".to_string(),
            year: 1966,
        })
        .await?;
    println!("   ✅ Updated '{}' (year {})", updated.title, updated.year);

    println!("\n🔍 Fetching one entity by id...");
    let fetched = books.find_by_id(&dune_id).await?;
    println!("   Found '{}' by {}", fetched.title, fetched.author);

    println!("\n📋 Querying for books after 1980...");
    let query = Query::new()
        .filter(serde_json::json!({"year": {"$gt": 1980}}))
        .sort(serde_json::json!({"year": 1}))
        .limit(10);
    for book in books.find(&query).await? {
        println!("   - {} ({})", book.title, book.year);
    }

    let total = books.count(&Query::new()).await?;
    println!("\n🔢 Collection holds {total} books");

    // ==================== Cleanup ====================

    println!("\n🧹 Cleaning up...");
    let removed = books.delete_by_id(&dune_id).await?;
    println!("   Deleted {removed} entity");

    client.logout().await?;
    println!("   ✅ Session closed");

    println!("\n✨ Example completed successfully!");

    Ok(())
}

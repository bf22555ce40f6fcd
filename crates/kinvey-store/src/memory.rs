//! In-memory stores for tests and short-lived processes

use crate::{Credential, CredentialStore, OfflineStore, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// Credential store holding the session in process memory
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    slot: Arc<RwLock<Option<Credential>>>,
}

impl MemoryCredentialStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with a credential
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(credential))),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self) -> Result<Option<Credential>> {
        Ok(self.slot.read().clone())
    }

    async fn set(&self, credential: Credential) -> Result<()> {
        *self.slot.write() = Some(credential);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.slot.write() = None;
        Ok(())
    }
}

/// Offline record store backed by a concurrent map
#[derive(Clone, Default)]
pub struct MemoryOfflineStore {
    records: Arc<DashMap<(String, String), Value>>,
}

impl MemoryOfflineStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of records stored
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove all records
    pub fn clear(&self) {
        self.records.clear();
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .records
            .get(&(collection.to_string(), id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<()> {
        self.records
            .insert((collection.to_string(), id.to_string()), record);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.records
            .remove(&(collection.to_string(), id.to_string()));
        Ok(())
    }
}

//! Typed access to app data collections

use std::marker::PhantomData;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::client::Kinvey;
use crate::error::Result;
use crate::request::RequestBuilder;

/// Query over a collection: a filter document plus paging and ordering
/// modifiers
///
/// The filter uses the backend's MongoDB-style operator syntax, for example
/// `{"age": {"$gte": 21}}`.
#[derive(Clone, Debug, Default)]
pub struct Query {
    filter: Option<Value>,
    sort: Option<Value>,
    limit: Option<u64>,
    skip: Option<u64>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict results to entities matching a filter document
    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Order results, for example `{"_id": 1}` or `{"age": -1}`
    pub fn sort(mut self, sort: Value) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Cap the number of returned entities
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip over the first matching entities
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub(crate) fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(filter) = &self.filter {
            pairs.push(("query".to_string(), filter.to_string()));
        }
        if let Some(sort) = &self.sort {
            pairs.push(("sort".to_string(), sort.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(skip) = self.skip {
            pairs.push(("skip".to_string(), skip.to_string()));
        }
        pairs
    }
}

#[derive(Deserialize)]
struct CountResponse {
    count: u64,
}

/// Typed handle over one app data collection
///
/// Entities are plain serde types. An entity with an `_id` field is updated
/// in place on save; one without is created and comes back with the
/// server-assigned id.
pub struct DataStore<T> {
    client: Kinvey,
    collection: String,
    _entity: PhantomData<T>,
}

impl<T> DataStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(client: Kinvey, collection: String) -> Self {
        Self {
            client,
            collection,
            _entity: PhantomData,
        }
    }

    /// The collection this store reads and writes
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Fetch one entity by id
    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: &str) -> Result<T> {
        let descriptor = RequestBuilder::new(
            self.client.config(),
            Method::GET,
            "appdata/{appKey}/{collection}/{id}",
        )
        .param("collection", &self.collection)
        .param("id", id)
        .build()?;
        self.client.execute_json(descriptor).await
    }

    /// Fetch every entity matching a query
    #[instrument(skip(self, query))]
    pub async fn find(&self, query: &Query) -> Result<Vec<T>> {
        let descriptor = RequestBuilder::new(
            self.client.config(),
            Method::GET,
            "appdata/{appKey}/{collection}",
        )
        .param("collection", &self.collection)
        .query_pairs(query.to_query_pairs())
        .build()?;
        self.client.execute_json(descriptor).await
    }

    /// Create or update an entity, returning the stored version
    #[instrument(skip(self, entity))]
    pub async fn save(&self, entity: &T) -> Result<T> {
        let value = serde_json::to_value(entity)?;
        let descriptor = match entity_id(&value) {
            Some(id) => RequestBuilder::new(
                self.client.config(),
                Method::PUT,
                "appdata/{appKey}/{collection}/{id}",
            )
            .param("collection", &self.collection)
            .param("id", id),
            None => RequestBuilder::new(
                self.client.config(),
                Method::POST,
                "appdata/{appKey}/{collection}",
            )
            .param("collection", &self.collection),
        }
        .json(&value)?
        .build()?;
        self.client.execute_json(descriptor).await
    }

    /// Delete one entity by id, returning how many records were removed
    #[instrument(skip(self))]
    pub async fn delete_by_id(&self, id: &str) -> Result<u64> {
        let descriptor = RequestBuilder::new(
            self.client.config(),
            Method::DELETE,
            "appdata/{appKey}/{collection}/{id}",
        )
        .param("collection", &self.collection)
        .param("id", id)
        .build()?;
        let outcome: CountResponse = self.client.execute_json(descriptor).await?;
        Ok(outcome.count)
    }

    /// Count entities matching a query without fetching them
    #[instrument(skip(self, query))]
    pub async fn count(&self, query: &Query) -> Result<u64> {
        let descriptor = RequestBuilder::new(
            self.client.config(),
            Method::GET,
            "appdata/{appKey}/{collection}/_count",
        )
        .param("collection", &self.collection)
        .query_pairs(query.to_query_pairs())
        .build()?;
        let outcome: CountResponse = self.client.execute_json(descriptor).await?;
        Ok(outcome.count)
    }
}

/// The `_id` of a serialized entity, when it carries a non-empty one
fn entity_id(value: &Value) -> Option<&str> {
    value
        .get("_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

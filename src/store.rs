//! Document store collaborators
//!
//! [`DocumentStore`] is the read surface of one MongoDB collection: count,
//! multi-document fetch, single-document fetch. [`MongoStore`] implements it
//! over a typed `mongodb::Collection`; tests substitute instrumented fakes.

use async_trait::async_trait;
use bson::Document;
use futures_util::StreamExt;
use mongodb::Collection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{DataSourceError, Result};

/// Driver options that change the shape of a result set.
///
/// Serialized into the cache key, so every field here must keep a
/// deterministic serde representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindSpec {
    /// Server-side field projection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Document>,
}

impl FindSpec {
    pub fn projection(projection: Document) -> Self {
        Self {
            projection: Some(projection),
        }
    }
}

/// Read operations of the underlying document store.
///
/// `find` must fully materialize its results before returning; cached values
/// are serialized whole, never as live cursors.
#[async_trait]
pub trait DocumentStore<T>: Send + Sync {
    async fn count_documents(&self, filter: &Document) -> Result<u64>;

    async fn find(
        &self,
        filter: &Document,
        options: Option<&FindSpec>,
        sort: Option<&Document>,
        skip: Option<u64>,
        limit: Option<i64>,
    ) -> Result<Vec<T>>;

    async fn find_one(&self, filter: &Document, options: Option<&FindSpec>) -> Result<Option<T>>;
}

/// [`DocumentStore`] backed by a typed MongoDB collection.
#[derive(Debug, Clone)]
pub struct MongoStore<T>
where
    T: Send + Sync,
{
    collection: Collection<T>,
}

impl<T> MongoStore<T>
where
    T: Send + Sync,
{
    pub fn new(collection: Collection<T>) -> Self {
        Self { collection }
    }

    /// Get the underlying collection for advanced operations
    pub fn inner(&self) -> &Collection<T> {
        &self.collection
    }
}

#[async_trait]
impl<T> DocumentStore<T> for MongoStore<T>
where
    T: DeserializeOwned + Unpin + Send + Sync,
{
    async fn count_documents(&self, filter: &Document) -> Result<u64> {
        self.collection
            .count_documents(filter.clone())
            .await
            .map_err(|e| DataSourceError::Database(format!("Count failed: {}", e)))
    }

    async fn find(
        &self,
        filter: &Document,
        options: Option<&FindSpec>,
        sort: Option<&Document>,
        skip: Option<u64>,
        limit: Option<i64>,
    ) -> Result<Vec<T>> {
        let mut find = self.collection.find(filter.clone());
        if let Some(projection) = options.and_then(|o| o.projection.clone()) {
            find = find.projection(projection);
        }
        if let Some(sort) = sort {
            find = find.sort(sort.clone());
        }
        if let Some(skip) = skip {
            find = find.skip(skip);
        }
        if let Some(limit) = limit {
            find = find.limit(limit);
        }

        let cursor = find
            .await
            .map_err(|e| DataSourceError::Database(format!("Find failed: {}", e)))?;

        let results: Vec<T> = cursor
            .filter_map(|doc| async {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading document: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }

    async fn find_one(&self, filter: &Document, options: Option<&FindSpec>) -> Result<Option<T>> {
        let mut find_one = self.collection.find_one(filter.clone());
        if let Some(projection) = options.and_then(|o| o.projection.clone()) {
            find_one = find_one.projection(projection);
        }

        find_one
            .await
            .map_err(|e| DataSourceError::Database(format!("Find failed: {}", e)))
    }
}

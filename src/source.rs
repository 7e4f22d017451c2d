//! Read-through data source
//!
//! Composes key derivation, in-flight coalescing, and the two collaborators
//! into the public read surface: `count`, `find`, `find_one`, plus point
//! invalidation via `delete`.
//!
//! Control flow per read: derive key → cache get → hit: decode and return →
//! miss: coalesce one store call, write the result back under the TTL, return
//! it. A missing or degraded cache demotes every read to a plain store call;
//! it is never fatal.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bson::Document;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::inflight::InflightMap;
use crate::keys::{derive_key, Operation};
use crate::kv::KeyValueCache;
use crate::store::{DocumentStore, FindSpec};

/// TTL applied when neither the call nor the config supplies one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Construction-time configuration. Immutable after construction.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    db_name: String,
    collection_name: String,
    cache_prefix: Option<String>,
    default_ttl: Duration,
}

impl SourceConfig {
    /// Configuration for one collection, identified by database and
    /// collection name.
    pub fn new(db_name: impl Into<String>, collection_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            collection_name: collection_name.into(),
            cache_prefix: None,
            default_ttl: DEFAULT_TTL,
        }
    }

    /// Override the derived key prefix entirely.
    pub fn cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = Some(prefix.into());
        self
    }

    /// TTL used when a read does not supply one.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Key prefix namespacing this collection's entries.
    fn key_prefix(&self) -> String {
        match &self.cache_prefix {
            Some(prefix) => prefix.clone(),
            None => format!("mongodb-{}-{}-", self.db_name, self.collection_name),
        }
    }
}

/// Per-read options.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// TTL for the produced cache entry; the configured default when `None`.
    pub ttl: Option<Duration>,
    /// Driver options; forwarded to the store and folded into the cache key.
    pub find_options: Option<FindSpec>,
}

impl ReadOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn find_options(spec: FindSpec) -> Self {
        Self {
            find_options: Some(spec),
            ..Default::default()
        }
    }
}

/// Read-through cached view of one MongoDB collection.
///
/// The cache collaborator may be supplied at construction or late-bound via
/// [`initialize`](Self::initialize), e.g. when the source is attached to a
/// per-request execution context. Each instance owns its in-flight registry;
/// coalescing never crosses instances.
pub struct MongoDataSource<T> {
    store: Arc<dyn DocumentStore<T>>,
    cache: RwLock<Option<Arc<dyn KeyValueCache>>>,
    context: RwLock<Option<Value>>,
    key_prefix: String,
    default_ttl: Duration,
    inflight_counts: InflightMap<u64>,
    inflight_finds: InflightMap<Vec<T>>,
    inflight_find_ones: InflightMap<Option<T>>,
}

impl<T> MongoDataSource<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Source without a cache; reads pass through to the store until
    /// [`initialize`](Self::initialize) attaches one.
    pub fn new(store: Arc<dyn DocumentStore<T>>, config: SourceConfig) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
            context: RwLock::new(None),
            key_prefix: config.key_prefix(),
            default_ttl: config.default_ttl,
            inflight_counts: InflightMap::default(),
            inflight_finds: InflightMap::default(),
            inflight_find_ones: InflightMap::default(),
        }
    }

    /// Source with the cache bound up front.
    pub fn with_cache(
        store: Arc<dyn DocumentStore<T>>,
        cache: Arc<dyn KeyValueCache>,
        config: SourceConfig,
    ) -> Self {
        let source = Self::new(store, config);
        *source
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(cache);
        source
    }

    /// Late-bind the cache collaborator and optional request-scoped context.
    ///
    /// The context is stored but never interpreted here.
    pub fn initialize(&self, cache: Arc<dyn KeyValueCache>, context: Option<Value>) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(cache);
        if let Some(context) = context {
            *self
                .context
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(context);
        }
    }

    /// Request-scoped context supplied at [`initialize`](Self::initialize).
    pub fn context(&self) -> Option<Value> {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Count documents matching `filter`, serving from cache when fresh.
    pub async fn count(&self, filter: Document, ttl: Option<Duration>) -> Result<u64> {
        let key = derive_key(
            &self.key_prefix,
            Operation::Count,
            &filter,
            None,
            None,
            None,
            None,
        );

        if let Some(raw) = self.cache_get(&key).await {
            if let Some(count) = decode(&key, &raw) {
                return Ok(count);
            }
        }

        let ttl = ttl.unwrap_or(self.default_ttl);
        debug!(key = %key, "Cache miss, counting documents");
        self.inflight_counts
            .coalesce(&key, || async {
                let count = self.store.count_documents(&filter).await?;
                self.encode_and_set(&key, &count, ttl).await;
                Ok(count)
            })
            .await
    }

    /// Fetch all documents matching `filter`, serving from cache when fresh.
    ///
    /// Sort, skip, and limit are applied by the store and fold into the cache
    /// key, so differently sorted or paged queries never share an entry. The
    /// result is fully materialized.
    pub async fn find(
        &self,
        filter: Document,
        options: ReadOptions,
        sort: Option<Document>,
        skip: Option<u64>,
        limit: Option<i64>,
    ) -> Result<Vec<T>> {
        let key = derive_key(
            &self.key_prefix,
            Operation::Find,
            &filter,
            options.find_options.as_ref(),
            sort.as_ref(),
            skip,
            limit,
        );

        if let Some(raw) = self.cache_get(&key).await {
            if let Some(docs) = decode(&key, &raw) {
                return Ok(docs);
            }
        }

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        debug!(key = %key, "Cache miss, querying collection");
        self.inflight_finds
            .coalesce(&key, || async {
                let docs = self
                    .store
                    .find(
                        &filter,
                        options.find_options.as_ref(),
                        sort.as_ref(),
                        skip,
                        limit,
                    )
                    .await?;
                self.encode_and_set(&key, &docs, ttl).await;
                Ok(docs)
            })
            .await
    }

    /// Fetch one document matching `filter`, serving from cache when fresh.
    ///
    /// "No match" is itself a cacheable result: a cached `null` decodes to
    /// `Ok(None)` without touching the store, distinct from "no cache entry".
    pub async fn find_one(&self, filter: Document, options: ReadOptions) -> Result<Option<T>> {
        let key = derive_key(
            &self.key_prefix,
            Operation::FindOne,
            &filter,
            options.find_options.as_ref(),
            None,
            None,
            None,
        );

        if let Some(raw) = self.cache_get(&key).await {
            if let Some(doc) = decode(&key, &raw) {
                return Ok(doc);
            }
        }

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        debug!(key = %key, "Cache miss, querying collection");
        self.inflight_find_ones
            .coalesce(&key, || async {
                let doc = self
                    .store
                    .find_one(&filter, options.find_options.as_ref())
                    .await?;
                self.encode_and_set(&key, &doc, ttl).await;
                Ok(doc)
            })
            .await
    }

    /// Point invalidation: remove the single cache entry an equivalent read
    /// with these parameters would have hit.
    ///
    /// Unrelated keys are untouched, and an in-flight production for the key,
    /// if any, completes unaffected. Returns whether an entry was removed;
    /// `false` when no cache is bound.
    pub async fn delete(
        &self,
        op: Operation,
        filter: Document,
        find_options: Option<FindSpec>,
        sort: Option<Document>,
        skip: Option<u64>,
        limit: Option<i64>,
    ) -> Result<bool> {
        let key = derive_key(
            &self.key_prefix,
            op,
            &filter,
            find_options.as_ref(),
            sort.as_ref(),
            skip,
            limit,
        );

        let Some(cache) = self.cache() else {
            return Ok(false);
        };
        match cache.delete(&key).await {
            Ok(removed) => {
                debug!(key = %key, removed = removed, "Cache entry invalidated");
                Ok(removed)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache delete failed, skipping");
                Ok(false)
            }
        }
    }

    fn cache(&self) -> Option<Arc<dyn KeyValueCache>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cache read with degraded-cache semantics: no cache bound or a failed
    /// read is a miss.
    async fn cache_get(&self, key: &str) -> Option<String> {
        let cache = self.cache()?;
        match cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Cache write with degraded-cache semantics: no cache bound or a failed
    /// write is skipped.
    async fn encode_and_set<V: Serialize>(&self, key: &str, value: &V, ttl: Duration) {
        let Some(cache) = self.cache() else {
            return;
        };
        match serde_json::to_string(value) {
            Ok(raw) => {
                if let Err(e) = cache.set(key, raw, ttl).await {
                    warn!(key = key, error = %e, "Cache write failed, skipping");
                }
            }
            Err(e) => warn!(key = key, error = %e, "Failed to serialize result for cache"),
        }
    }
}

/// An undecodable cached value is a miss; the next write overwrites it.
fn decode<V: DeserializeOwned>(key: &str, raw: &str) -> Option<V> {
    match serde_json::from_str(raw) {
        Ok(value) => {
            debug!(key = key, "Cache hit");
            Some(value)
        }
        Err(e) => {
            debug!(key = key, error = %e, "Cached value failed to decode, treating as miss");
            None
        }
    }
}

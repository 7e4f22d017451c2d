//! mongo-datasource - read-through caching for MongoDB collections
//!
//! Sits between an application and a MongoDB collection: reads consult a
//! key/value cache first, fall back to a single coalesced collection query on
//! miss, and populate the cache for subsequent reads. Concurrent identical
//! requests share one in-flight query instead of hammering the collection.
//!
//! ## Components
//!
//! - **Keys**: deterministic, collection-namespaced cache-key derivation
//! - **Inflight**: in-flight request coalescing with guaranteed cleanup
//! - **Source**: the read-through orchestrator, [`MongoDataSource`]
//! - **Kv**: the cache collaborator trait plus an in-memory TTL backend
//! - **Store**: the document store collaborator trait and its MongoDB impl
//!
//! ## Example
//!
//! ```rust,ignore
//! let store = Arc::new(MongoStore::new(client.database("app").collection::<User>("users")));
//! let source = MongoDataSource::with_cache(
//!     store,
//!     Arc::new(MemoryCache::new()),
//!     SourceConfig::new("app", "users").default_ttl(Duration::from_secs(30)),
//! );
//!
//! let user = source.find_one(doc! { "email": "ada@example.com" }, ReadOptions::default()).await?;
//! ```

pub mod error;
pub mod inflight;
pub mod keys;
pub mod kv;
pub mod source;
pub mod store;

pub use error::{DataSourceError, Result};
pub use inflight::InflightMap;
pub use keys::{derive_key, Operation};
pub use kv::{CacheStats, KeyValueCache, MemoryCache};
pub use source::{MongoDataSource, ReadOptions, SourceConfig, DEFAULT_TTL};
pub use store::{DocumentStore, FindSpec, MongoStore};

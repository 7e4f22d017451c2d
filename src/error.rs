//! Error types for the data source.
//!
//! Variants carry formatted messages rather than source errors so results can
//! be cloned out to every waiter of a coalesced in-flight query.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DataSourceError>;

/// Errors surfaced by the data source and its collaborators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataSourceError {
    /// The underlying collection query failed. Propagated unchanged to every
    /// caller awaiting the query; never retried here.
    #[error("database error: {0}")]
    Database(String),

    /// The cache backend failed on an operation that cannot be degraded to a
    /// miss (backends are free to report transient read/write failures, which
    /// the data source absorbs instead).
    #[error("cache error: {0}")]
    Cache(String),

    /// The producer of an in-flight query was dropped before settling. The
    /// registry entry has already been cleared, so retrying is safe.
    #[error("in-flight query abandoned before completion")]
    InflightAbandoned,
}

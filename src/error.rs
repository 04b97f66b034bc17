//! Error types shared by the storage ports and the fetch modules.

use thiserror::Error;

/// Failure reported by a storage port.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Duplicate(String),
}

/// Failure reported by a fetch module while retrieving a feed.
///
/// Every variant is treated by the scheduler as a transient, per-feed failure:
/// the feed's error count goes up and the cycle moves on.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed endpoint is offline: {0}")]
    Offline(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to parse feed: {0}")]
    Parse(String),

    #[error("invalid feed descriptor: {0}")]
    InvalidFeed(String),
}

/// Failure of a retrieval operation invoked directly, outside the tick loop.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("no fetch module handles feed kind {0}")]
    NoModule(String),

    #[error("secure random source unavailable")]
    Random,
}

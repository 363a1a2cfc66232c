//! Error types for cache operations
//!
//! Every variant here is absorbed inside the cache before it reaches a caller
//! of the `get`/`set`/`delete` contract. They surface only through the
//! lower-level tier APIs, `CacheCoordinator::try_set`, and configuration
//! loading.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Disk read/write failure
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Value too large for the tier(s) asked to hold it
    #[error("Value of {size_bytes} bytes exceeds capacity of {limit_bytes} bytes")]
    CapacityRejection { size_bytes: u64, limit_bytes: u64 },

    /// Persisted index could not be parsed
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

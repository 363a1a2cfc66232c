//! Cache entry management with TTL support

use crate::cache::types::{CacheKey, DEFAULT_CLASS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached value with its bookkeeping metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cache key
    pub key: CacheKey,

    /// The cached payload
    pub value: Vec<u8>,

    /// Entry metadata
    pub metadata: CacheMetadata,
}

impl CacheEntry {
    /// Create a new entry; `ttl = None` means no TTL expiry
    pub fn new(key: CacheKey, value: Vec<u8>, ttl: Option<Duration>, class: Option<&str>) -> Self {
        let now = Utc::now();
        let size_bytes = value.len();

        Self {
            key,
            value,
            metadata: CacheMetadata {
                created_at: now,
                last_accessed: now,
                expires_at: ttl.and_then(|ttl| expiry_after(now, ttl)),
                access_count: 0,
                size_bytes,
                class: class.unwrap_or(DEFAULT_CLASS).to_string(),
                version: 0,
            },
        }
    }

    /// Rebuild an entry from persisted metadata and a decoded payload
    pub fn from_parts(key: CacheKey, value: Vec<u8>, metadata: CacheMetadata) -> Self {
        Self { key, value, metadata }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.metadata.is_expired_at(Utc::now())
    }

    /// Mark the entry as accessed (updates access time and count)
    pub fn mark_accessed(&mut self) {
        self.metadata.mark_accessed();
    }

    /// Size accounted against tier capacity
    pub fn size_bytes(&self) -> usize {
        self.metadata.size_bytes
    }

    /// Get time until expiration, `None` if expired or never expiring
    pub fn time_until_expiration(&self) -> Option<Duration> {
        let expires_at = self.metadata.expires_at?;
        (expires_at - Utc::now()).to_std().ok()
    }
}

/// Metadata associated with a cache entry
///
/// This is also the per-key record kept in the disk tier's index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the entry was created
    pub created_at: DateTime<Utc>,

    /// Last access time (for LRU tracking)
    pub last_accessed: DateTime<Utc>,

    /// When the entry expires; `None` never expires by TTL
    pub expires_at: Option<DateTime<Utc>>,

    /// Number of times this entry has been read
    pub access_count: u64,

    /// Payload size in bytes
    pub size_bytes: usize,

    /// Class tag, e.g. "ai_response" or "general"
    pub class: String,

    /// Write sequence number; a higher version is a newer write of the key
    #[serde(default)]
    pub version: u64,
}

impl CacheMetadata {
    /// Expiry check against an explicit clock reading
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    pub fn mark_accessed(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }

    /// Get the age of the entry
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }
}

/// `now + ttl`, or `None` when the sum is not representable
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Cache key type - opaque, derived by the caller
pub type CacheKey = String;

/// Class tag used when the caller does not supply one
pub const DEFAULT_CLASS: &str = "general";

/// Storage level holding an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Bounded in-memory LRU tier
    Memory,

    /// Persistent overflow tier
    Disk,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Memory => write!(f, "memory"),
            Tier::Disk => write!(f, "disk"),
        }
    }
}

/// Why an entry left a tier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemovalReason {
    /// Explicit delete by a caller
    Explicit,

    /// `expires_at` passed (lazy read or sweeper)
    Expired,

    /// Evicted for capacity and dropped
    Evicted,

    /// Evicted from memory and written back to disk
    WrittenBack,

    /// Moved from disk into memory
    Promoted,

    /// Replaced by a newer value stored in the other tier
    Superseded,

    /// Removed by class invalidation
    ClassInvalidated { class: String },

    /// Blob unreadable or undecodable
    Unreadable,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Explicit => write!(f, "explicit delete"),
            RemovalReason::Expired => write!(f, "TTL expired"),
            RemovalReason::Evicted => write!(f, "capacity eviction"),
            RemovalReason::WrittenBack => write!(f, "write-back to disk"),
            RemovalReason::Promoted => write!(f, "promoted to memory"),
            RemovalReason::Superseded => write!(f, "superseded by newer value"),
            RemovalReason::ClassInvalidated { class } => write!(f, "class invalidated: {}", class),
            RemovalReason::Unreadable => write!(f, "unreadable blob"),
        }
    }
}

/// Which operation a latency sample measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Get,
    Set,
    Delete,
}

/// One timed coordinator call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySample {
    pub operation: Operation,

    /// Tier that served the call, `None` for a miss or rejection
    pub tier: Option<Tier>,

    pub duration: Duration,
}

/// Point-in-time view of cache counters and residency
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatsSnapshot {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses
    pub misses: u64,

    /// Hits served by the memory tier
    pub memory_hits: u64,

    /// Hits served by the disk tier
    pub disk_hits: u64,

    /// Entries pushed out of either tier for capacity, including those
    /// written back to disk
    pub evictions: u64,

    /// Memory evictions persisted to disk; a subset of `evictions`
    pub write_backs: u64,

    /// Disk entries moved into memory
    pub promotions: u64,

    /// Entries removed because their TTL passed
    pub expirations: u64,

    /// `set` calls that were not cached
    pub rejections: u64,

    /// Absorbed disk failures
    pub io_failures: u64,

    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub disk_entries: usize,
    pub disk_bytes: u64,

    /// Most recent latency samples, oldest first
    pub recent_latencies: Vec<LatencySample>,
}

impl StatsSnapshot {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }

    /// Mean latency over the retained samples
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.recent_latencies.is_empty() {
            return None;
        }
        let total: Duration = self.recent_latencies.iter().map(|s| s.duration).sum();
        Some(total / self.recent_latencies.len() as u32)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, \
             memory: {} entries / {} bytes, disk: {} entries / {} bytes, \
             evictions: {}, promotions: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.memory_entries,
            self.memory_bytes,
            self.disk_entries,
            self.disk_bytes,
            self.evictions,
            self.promotions
        )
    }
}

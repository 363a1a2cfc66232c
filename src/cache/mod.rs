//! # Tiered Caching Engine
//!
//! A two-level cache for expensive AI responses and document-processing
//! results: a bounded in-memory LRU tier in front of a persistent disk tier.
//!
//! ## Features
//!
//! - **LRU Eviction**: arena-backed doubly-linked list with O(1) move-to-front
//! - **Write-Back**: frequently read entries evicted from memory are persisted
//!   to disk instead of dropped
//! - **Promotion**: disk entries read often enough move back into memory
//! - **Versioned Writes**: a write-back or promotion never overwrites a newer
//!   set or revives a deleted key
//! - **TTL Expiration**: checked on every read and reaped by a background sweeper
//! - **Adaptive TTL**: cost-proportional TTLs and request-derived keys
//!
//! ## Example
//!
//! ```no_run
//! use lexcache::cache::{CacheConfig, CacheCoordinator};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CacheConfig::builder()
//!     .data_dir("./data/cache")
//!     .memory_capacity_bytes(64 * 1024 * 1024) // 64 MB
//!     .build();
//!
//! let cache = CacheCoordinator::open(config).await?;
//!
//! cache
//!     .set("query:123", b"cached response".to_vec(), Some(Duration::from_secs(3600)), None)
//!     .await;
//!
//! if let Some(value) = cache.get("query:123").await {
//!     println!("Cache hit: {} bytes", value.len());
//! }
//!
//! cache.close().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod disk;
pub mod entry;
pub mod fence;
pub mod memory;
pub mod policy;
pub mod stats;
pub mod sweeper;
pub mod types;

pub use codec::{BlobCodec, EnvelopeCodec};
pub use config::{CacheConfig, CacheConfigBuilder};
pub use coordinator::CacheCoordinator;
pub use disk::{DiskLookup, DiskTier, IndexRecord};
pub use entry::{CacheEntry, CacheMetadata};
pub use fence::{FenceGuard, WriteFence};
pub use memory::{Eviction, MemoryLookup, MemoryTier};
pub use policy::{
    derive_key, AdaptiveCache, AdaptiveTtlPolicy, RequestKeyBuilder, AI_RESPONSE_CLASS,
};
pub use stats::StatsTracker;
pub use sweeper::{ExpirySweeper, SweepReport, SweeperHandle};
pub use types::{
    CacheKey, LatencySample, Operation, RemovalReason, StatsSnapshot, Tier, DEFAULT_CLASS,
};

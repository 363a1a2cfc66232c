//! # lexcache
//!
//! Tiered cache for a legal-research AI backend whose provider calls and
//! document processing are slow and billed per use.
//!
//! ## Features
//!
//! - Bounded in-memory LRU tier backed by a persistent disk tier
//! - Write-back of hot entries on eviction, promotion of hot disk entries
//! - TTL expiry on every read path plus a cancellable background sweeper
//! - Hit/miss, eviction and latency statistics
//! - Cost-proportional TTLs for cached AI responses
//!
//! ## Usage
//!
//! Callers talk to the cache through a narrow contract:
//!
//! ```no_run
//! use lexcache::{CacheConfig, CacheCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheCoordinator::open(CacheConfig::from_env()?).await?;
//!
//!     cache.set("doc:17:ocr", b"extracted text".to_vec(), None, Some("ocr")).await;
//!     let hit = cache.get("doc:17:ocr").await;
//!     println!("hit: {}", hit.is_some());
//!
//!     cache.delete("doc:17:ocr").await;
//!     println!("{}", cache.stats().await);
//!
//!     cache.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Adaptive TTL
//!
//! ```no_run
//! use lexcache::{AdaptiveCache, CacheConfig, CacheCoordinator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = Arc::new(CacheCoordinator::open(CacheConfig::default()).await?);
//!     let responses = AdaptiveCache::new(cache);
//!
//!     let request = serde_json::json!({"model": "m1", "prompt": "Summarize the holding"});
//!     let answer: Result<String, std::io::Error> = responses
//!         .get_or_compute(&request, || async { Ok("Affirmed.".to_string()) })
//!         .await;
//!     println!("{}", answer?);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;

// Re-export main types for convenience
pub use cache::{
    AdaptiveCache, AdaptiveTtlPolicy, CacheConfig, CacheConfigBuilder, CacheCoordinator,
    CacheEntry, CacheKey, CacheMetadata, RequestKeyBuilder, StatsSnapshot, SweepReport, Tier,
};
pub use error::{CacheError, Result};

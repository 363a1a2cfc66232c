//! Public cache contract over the memory and disk tiers
//!
//! [`CacheCoordinator`] owns both tiers, the stats tracker and the sweeper
//! task. Reads consult memory first and fall back to disk; writes go to
//! memory unless the value is above the admission limit. Moves between tiers
//! take each tier's lock only for its half of the move, so a memory hit never
//! waits on disk I/O. Every write carries a version from a [`WriteFence`];
//! a move only lands if no newer set, delete or invalidation of the key has
//! been issued, and never replaces a newer copy.

use crate::cache::codec::{BlobCodec, EnvelopeCodec};
use crate::cache::config::CacheConfig;
use crate::cache::disk::{DiskLookup, DiskTier, IndexRecord};
use crate::cache::entry::CacheEntry;
use crate::cache::fence::WriteFence;
use crate::cache::memory::{Eviction, MemoryLookup, MemoryTier};
use crate::cache::stats::StatsTracker;
use crate::cache::sweeper::{ExpirySweeper, SweepReport, SweeperHandle};
use crate::cache::types::{Operation, RemovalReason, StatsSnapshot, Tier};
use crate::error::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Two-tier cache with LRU eviction, write-back and promotion
///
/// Construct with [`CacheCoordinator::open`] and share behind an `Arc`.
/// `get`, `set` and `delete` never fail: errors are logged and turn into a
/// miss or a `false` return.
pub struct CacheCoordinator {
    config: CacheConfig,
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    stats: Arc<StatsTracker>,
    fence: WriteFence,
    sweeper: Mutex<Option<SweeperHandle>>,
}

/// Identity of a write, kept while the entry itself moves into a tier
struct Stamp {
    key: String,
    class: String,
    version: u64,
}

impl Stamp {
    fn of(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            class: entry.metadata.class.clone(),
            version: entry.metadata.version,
        }
    }
}

impl CacheCoordinator {
    /// Open the cache with the default blob codec
    pub async fn open(config: CacheConfig) -> Result<Self> {
        Self::open_with_codec(config, Arc::new(EnvelopeCodec)).await
    }

    /// Open the cache with a custom disk blob format
    pub async fn open_with_codec(config: CacheConfig, codec: Arc<dyn BlobCodec>) -> Result<Self> {
        config.validate()?;
        info!("Opening tiered cache with config: {:?}", config);

        let memory = Arc::new(MemoryTier::new(
            config.memory_capacity_bytes,
            config.write_back_threshold,
        ));
        let disk = Arc::new(
            DiskTier::open(
                &config.data_dir,
                config.disk_capacity_bytes,
                config.promotion_threshold,
                config.memory_admission_limit(),
                codec,
            )
            .await?,
        );
        let stats = Arc::new(StatsTracker::new(config.latency_sample_capacity));

        // New writes must outrank everything already on disk
        let fence = WriteFence::new();
        fence.observe(disk.max_version().await);

        if config.purge_orphans_on_open {
            if let Err(e) = disk.purge_orphans().await {
                warn!("Orphan purge at open failed: {}", e);
            }
        }

        let coordinator = Self {
            config,
            memory,
            disk,
            stats,
            fence,
            sweeper: Mutex::new(None),
        };

        if coordinator.config.enable_sweeper {
            let handle = coordinator.expiry_sweeper().spawn();
            *coordinator.sweeper.lock().await = Some(handle);
        }

        Ok(coordinator)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Direct access to the memory tier, for inspection
    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    /// Direct access to the disk tier, for inspection and maintenance
    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    /// Look up a value, memory first, then disk
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let _op = self.fence.begin();
        let started = Instant::now();
        let (value, tier) = self.lookup(key).await;
        self.stats
            .record_latency(Operation::Get, tier, started.elapsed())
            .await;
        value
    }

    async fn lookup(&self, key: &str) -> (Option<Vec<u8>>, Option<Tier>) {
        match self.memory.get(key).await {
            MemoryLookup::Hit(value) => {
                debug!("Cache hit (memory): {}", key);
                self.stats.record_hit(Tier::Memory);
                return (Some(value), Some(Tier::Memory));
            }
            MemoryLookup::Expired => {
                // A key lives in one tier only, so disk is not consulted
                self.stats.record_removal(&RemovalReason::Expired);
                self.stats.record_miss();
                return (None, Some(Tier::Memory));
            }
            MemoryLookup::Absent => {}
        }

        match self.disk.get(key).await {
            DiskLookup::Hit(value) => {
                debug!("Cache hit (disk): {}", key);
                self.stats.record_hit(Tier::Disk);
                (Some(value), Some(Tier::Disk))
            }
            DiskLookup::Promote(entry) => {
                debug!("Cache hit (disk, promoting): {}", key);
                self.stats.record_hit(Tier::Disk);
                let value = entry.value.clone();
                self.promote(entry).await;
                (Some(value), Some(Tier::Disk))
            }
            DiskLookup::Expired => {
                self.stats.record_removal(&RemovalReason::Expired);
                self.stats.record_miss();
                (None, Some(Tier::Disk))
            }
            DiskLookup::Failed => {
                self.stats.record_removal(&RemovalReason::Unreadable);
                self.stats.record_miss();
                (None, Some(Tier::Disk))
            }
            DiskLookup::Absent => {
                debug!("Cache miss: {}", key);
                self.stats.record_miss();
                (None, None)
            }
        }
    }

    /// Whether a write stamped `stamp` may replace a copy at `resident`
    fn is_current(&self, stamp: &Stamp, resident: Option<u64>) -> bool {
        resident.map_or(true, |version| version <= stamp.version)
            && self.fence.admits(&stamp.key, &stamp.class, stamp.version)
    }

    async fn promote(&self, entry: CacheEntry) {
        let stamp = Stamp::of(&entry);
        self.stats.record_removal(&RemovalReason::Promoted);

        // Any resident copy was written after this one left memory
        let accepted = self
            .memory
            .put_if(entry, |resident| resident.is_none() && self.is_current(&stamp, None))
            .await;
        match accepted {
            Ok(Some(evictions)) => self.handle_evictions(evictions).await,
            Ok(None) => debug!(
                "Dropped promotion of {}: {}",
                stamp.key,
                RemovalReason::Superseded
            ),
            Err(e) => warn!("Failed to promote {}: {}", stamp.key, e),
        }
    }

    /// Store a value; returns `false` if it was not cached
    pub async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        class: Option<&str>,
    ) -> bool {
        let started = Instant::now();
        let result = self.try_set(key, value, ttl, class).await;
        let tier = result.as_ref().ok().copied();
        self.stats
            .record_latency(Operation::Set, tier, started.elapsed())
            .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                match &e {
                    CacheError::CapacityRejection { .. } => self.stats.record_rejection(),
                    CacheError::Io { .. } => self.stats.record_io_failure(),
                    _ => {}
                }
                warn!("Not caching {}: {}", key, e);
                false
            }
        }
    }

    /// Store a value, returning the tier it landed in or why it was refused
    ///
    /// `ttl = None` falls back to the configured default TTL. Values above the
    /// memory admission limit go straight to disk; if the disk write fails and
    /// the value fits memory, it is kept in memory instead. A set overtaken by
    /// a concurrent set or delete of the same key is dropped and reports the
    /// tier it was headed for.
    pub async fn try_set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        class: Option<&str>,
    ) -> Result<Tier> {
        let _op = self.fence.begin();
        let mut entry =
            CacheEntry::new(key.to_string(), value, ttl.or(self.config.default_ttl), class);
        let size = entry.size_bytes();
        let memory_capacity = self.memory.capacity_bytes();

        if size > memory_capacity && size as u64 > self.disk.capacity_bytes() {
            return Err(CacheError::CapacityRejection {
                size_bytes: size as u64,
                limit_bytes: (memory_capacity as u64).max(self.disk.capacity_bytes()),
            });
        }

        entry.metadata.version = self.fence.issue(key);

        if size <= self.config.memory_admission_limit() {
            self.store_in_memory(entry).await?;
            return Ok(Tier::Memory);
        }

        let stamp = Stamp::of(&entry);
        if self
            .memory
            .remove_if(key, |resident| resident.metadata.version < stamp.version)
            .await
            .is_some()
        {
            debug!("Removed memory copy of {}: {}", key, RemovalReason::Superseded);
        }

        let fallback = (size <= memory_capacity).then(|| entry.clone());
        let stored = self
            .disk
            .put_if(entry, |existing| {
                self.is_current(&stamp, existing.map(|r| r.metadata.version))
            })
            .await;
        match stored {
            Ok(Some(dropped)) => {
                self.record_disk_drops(&dropped);
                debug!("Stored {} ({} bytes) on disk", key, size);
                Ok(Tier::Disk)
            }
            Ok(None) => {
                debug!("Dropped set of {}: {}", key, RemovalReason::Superseded);
                Ok(Tier::Disk)
            }
            Err(e) => {
                let Some(entry) = fallback else {
                    return Err(e);
                };
                warn!("Disk write for {} failed, keeping it in memory: {}", key, e);
                if matches!(e, CacheError::Io { .. }) {
                    self.stats.record_io_failure();
                }
                self.store_in_memory(entry).await?;
                Ok(Tier::Memory)
            }
        }
    }

    async fn store_in_memory(&self, entry: CacheEntry) -> Result<()> {
        let stamp = Stamp::of(&entry);
        let size = entry.size_bytes();
        let accepted = self
            .memory
            .put_if(entry, |resident| {
                self.is_current(&stamp, resident.map(|r| r.metadata.version))
            })
            .await?;
        let Some(evictions) = accepted else {
            debug!("Dropped set of {}: {}", stamp.key, RemovalReason::Superseded);
            return Ok(());
        };

        if self
            .disk
            .remove_if(&stamp.key, |record| record.metadata.version < stamp.version)
            .await
            .is_some()
        {
            debug!("Removed disk copy of {}: {}", stamp.key, RemovalReason::Superseded);
        }
        debug!("Stored {} ({} bytes) in memory", stamp.key, size);

        self.handle_evictions(evictions).await;
        Ok(())
    }

    /// Write back or drop entries pushed out of memory
    async fn handle_evictions(&self, evictions: Vec<Eviction>) {
        for Eviction { entry, write_back } in evictions {
            if entry.is_expired() {
                self.stats.record_removal(&RemovalReason::Expired);
                continue;
            }
            if !write_back {
                self.stats.record_removal(&RemovalReason::Evicted);
                continue;
            }

            let stamp = Stamp::of(&entry);
            let stored = self
                .disk
                .put_if(entry, |existing| {
                    self.is_current(&stamp, existing.map(|r| r.metadata.version))
                })
                .await;
            match stored {
                Ok(Some(dropped)) => {
                    self.stats.record_removal(&RemovalReason::WrittenBack);
                    self.record_disk_drops(&dropped);
                }
                Ok(None) => {
                    debug!("Dropped write-back of {}: {}", stamp.key, RemovalReason::Superseded);
                    self.stats.record_removal(&RemovalReason::Evicted);
                }
                Err(e) => {
                    warn!("Write-back of {} failed, dropping it: {}", stamp.key, e);
                    if matches!(e, CacheError::Io { .. }) {
                        self.stats.record_io_failure();
                    }
                    self.stats.record_removal(&RemovalReason::Evicted);
                }
            }
        }
    }

    fn record_disk_drops(&self, dropped: &[String]) {
        for key in dropped {
            debug!("Disk capacity dropped {}", key);
            self.stats.record_removal(&RemovalReason::Evicted);
        }
    }

    /// Remove a key from whichever tier holds it; absent keys are a no-op
    ///
    /// A write-back or promotion of the key already in flight is dropped.
    pub async fn delete(&self, key: &str) {
        let _op = self.fence.begin();
        let started = Instant::now();
        let version = self.fence.issue(key);

        let in_memory = self
            .memory
            .remove_if(key, |entry| entry.metadata.version < version)
            .await
            .is_some();
        let on_disk = self
            .disk
            .remove_if(key, |record| record.metadata.version < version)
            .await
            .is_some();
        let tier = if in_memory {
            Some(Tier::Memory)
        } else if on_disk {
            Some(Tier::Disk)
        } else {
            None
        };

        if let Some(tier) = tier {
            debug!("Deleted {} from {} ({})", key, tier, RemovalReason::Explicit);
        }
        self.stats
            .record_latency(Operation::Delete, tier, started.elapsed())
            .await;
    }

    /// Counters, latency window and per-tier residency
    pub async fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot().await;
        snapshot.memory_entries = self.memory.len().await;
        snapshot.memory_bytes = self.memory.resident_bytes().await;
        snapshot.disk_entries = self.disk.len().await;
        snapshot.disk_bytes = self.disk.resident_bytes().await;
        snapshot
    }

    /// Whether either tier holds `key`, without touching recency
    pub async fn contains(&self, key: &str) -> bool {
        self.tier_of(key).await.is_some()
    }

    /// Tier currently holding `key`
    pub async fn tier_of(&self, key: &str) -> Option<Tier> {
        if self.memory.contains(key).await {
            Some(Tier::Memory)
        } else if self.disk.contains(key).await {
            Some(Tier::Disk)
        } else {
            None
        }
    }

    /// Remove every entry from both tiers
    pub async fn clear(&self) -> usize {
        let _op = self.fence.begin();
        self.fence.issue_floor();
        let removed = self.memory.drain().await.len() + self.disk.clear().await;
        info!("Cleared {} cache entries", removed);
        removed
    }

    /// Remove every entry tagged with `class` from both tiers
    pub async fn invalidate_class(&self, class: &str) -> usize {
        let _op = self.fence.begin();
        let version = self.fence.issue_class(class);
        let reason = RemovalReason::ClassInvalidated {
            class: class.to_string(),
        };
        let mut removed = 0;

        for key in self.memory.keys_in_class(class).await {
            let stale = |entry: &CacheEntry| {
                entry.metadata.class == class && entry.metadata.version < version
            };
            if self.memory.remove_if(&key, stale).await.is_some() {
                removed += 1;
            }
        }
        for key in self.disk.keys_in_class(class).await {
            let stale = |record: &IndexRecord| {
                record.metadata.class == class && record.metadata.version < version
            };
            if self.disk.remove_if(&key, stale).await.is_some() {
                removed += 1;
            }
        }

        for _ in 0..removed {
            self.stats.record_removal(&reason);
        }
        info!("Removed {} entries ({})", removed, reason);
        removed
    }

    /// Run one expiry pass over both tiers now
    pub async fn sweep_now(&self) -> SweepReport {
        self.expiry_sweeper().sweep().await
    }

    /// Delete disk blobs that no index record references
    pub async fn purge_orphans(&self) -> Result<usize> {
        self.disk.purge_orphans().await
    }

    /// Typed read; a value that fails to deserialize is a miss
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cached value for {} did not deserialize: {}", key, e);
                None
            }
        }
    }

    /// Typed write through serde_json
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        class: Option<&str>,
    ) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, bytes, ttl, class).await,
            Err(e) => {
                warn!("Not caching {}: {}", key, CacheError::from(e));
                false
            }
        }
    }

    /// Stop the sweeper, write back hot entries and flush the index
    ///
    /// The cache stays usable afterwards, but without a sweeper.
    pub async fn close(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.stop().await;
        }

        if self.config.persist_hot_on_close {
            let _op = self.fence.begin();
            let mut persisted = 0;
            for entry in self.memory.drain().await {
                if entry.is_expired() || !self.memory.qualifies_for_write_back(&entry) {
                    continue;
                }
                let stamp = Stamp::of(&entry);
                let stored = self
                    .disk
                    .put_if(entry, |existing| {
                        self.is_current(&stamp, existing.map(|r| r.metadata.version))
                    })
                    .await;
                match stored {
                    Ok(Some(dropped)) => {
                        persisted += 1;
                        self.record_disk_drops(&dropped);
                    }
                    Ok(None) => debug!("Skipped persisting superseded {}", stamp.key),
                    Err(e) => warn!("Failed to persist {} on close: {}", stamp.key, e),
                }
            }
            debug!("Persisted {} hot entries on close", persisted);
        }

        if let Err(e) = self.disk.flush().await {
            warn!("Failed to flush cache index on close: {}", e);
        }
        info!("Closed tiered cache at {:?}", self.config.data_dir);
    }

    fn expiry_sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::new(
            self.memory.clone(),
            self.disk.clone(),
            self.stats.clone(),
            self.config.sweeper_interval,
            self.config.sweep_batch_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &std::path::Path) -> CacheConfig {
        CacheConfig::builder()
            .data_dir(dir)
            .memory_capacity_bytes(1_000)
            .direct_to_disk_bytes(400)
            .disk_capacity_bytes(10_000)
            .enable_sweeper(false)
            .build()
    }

    #[tokio::test]
    async fn test_small_values_land_in_memory() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        assert!(cache.set("a", vec![1; 100], None, None).await);
        assert_eq!(cache.tier_of("a").await, Some(Tier::Memory));
        assert_eq!(cache.get("a").await, Some(vec![1; 100]));

        let stats = cache.stats().await;
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.memory_bytes, 100);
        assert_eq!(stats.recent_latencies.len(), 2);
    }

    #[tokio::test]
    async fn test_large_values_go_direct_to_disk() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        assert_eq!(
            cache.try_set("big", vec![2; 500], None, None).await.unwrap(),
            Tier::Disk
        );
        assert!(cache.memory().is_empty().await);
        assert_eq!(cache.get("big").await, Some(vec![2; 500]));
        assert_eq!(cache.stats().await.disk_hits, 1);
    }

    #[tokio::test]
    async fn test_set_moves_key_between_tiers() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        cache.set("k", vec![1; 500], None, None).await;
        assert_eq!(cache.tier_of("k").await, Some(Tier::Disk));

        cache.set("k", vec![1; 10], None, None).await;
        assert_eq!(cache.tier_of("k").await, Some(Tier::Memory));
        assert!(!cache.disk().contains("k").await);

        cache.set("k", vec![1; 600], None, None).await;
        assert_eq!(cache.tier_of("k").await, Some(Tier::Disk));
        assert!(!cache.memory().contains("k").await);
    }

    #[tokio::test]
    async fn test_oversized_value_rejected() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        assert!(!cache.set("huge", vec![0; 20_000], None, None).await);
        assert!(matches!(
            cache.try_set("huge", vec![0; 20_000], None, None).await,
            Err(CacheError::CapacityRejection { .. })
        ));
        assert!(!cache.contains("huge").await);
        assert_eq!(cache.stats().await.rejections, 1);
    }

    #[tokio::test]
    async fn test_value_above_disk_capacity_falls_back_to_memory() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::builder()
            .data_dir(tmp.path())
            .memory_capacity_bytes(1_000)
            .direct_to_disk_bytes(100)
            .disk_capacity_bytes(200)
            .enable_sweeper(false)
            .build();
        let cache = CacheCoordinator::open(config).await.unwrap();

        assert_eq!(
            cache.try_set("k", vec![0; 500], None, None).await.unwrap(),
            Tier::Memory
        );
        assert_eq!(cache.get("k").await, Some(vec![0; 500]));
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::builder()
            .data_dir(tmp.path())
            .default_ttl(Duration::from_millis(30))
            .enable_sweeper(false)
            .build();
        let cache = CacheCoordinator::open(config).await.unwrap();

        cache.set("a", b"v".to_vec(), None, None).await;
        cache
            .set("b", b"v".to_vec(), Some(Duration::from_secs(60)), None)
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(b"v".to_vec()));
        assert_eq!(cache.stats().await.expirations, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        cache.set("m", vec![1], None, None).await;
        cache.set("d", vec![1; 500], None, None).await;

        cache.delete("m").await;
        cache.delete("d").await;
        cache.delete("d").await;
        cache.delete("never-set").await;

        assert!(!cache.contains("m").await);
        assert!(!cache.contains("d").await);
        assert!(!cache.disk().blob_path_for("d").exists());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        let value = serde_json::json!({"holding": "affirmed", "score": 0.9});
        assert!(cache.set_json("case", &value, None, Some("ai_response")).await);
        let back: serde_json::Value = cache.get_json("case").await.unwrap();
        assert_eq!(back, value);

        cache.set("raw", b"not json".to_vec(), None, None).await;
        assert!(cache.get_json::<serde_json::Value>("raw").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_and_invalidate_class() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        cache.set("a", vec![1], None, Some("ai_response")).await;
        cache.set("b", vec![1; 500], None, Some("ai_response")).await;
        cache.set("c", vec![1], None, None).await;

        assert_eq!(cache.invalidate_class("ai_response").await, 2);
        assert!(cache.contains("c").await);
        assert!(!cache.contains("a").await);
        assert!(!cache.contains("b").await);

        assert_eq!(cache.clear().await, 1);
        assert!(!cache.contains("c").await);
    }

    #[tokio::test]
    async fn test_close_persists_hot_entries_only() {
        let tmp = TempDir::new().unwrap();
        {
            let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();
            cache.set("hot", vec![1; 10], None, None).await;
            cache.set("cold", vec![2; 10], None, None).await;
            for _ in 0..4 {
                cache.get("hot").await;
            }
            cache.close().await;
        }

        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();
        assert_eq!(cache.tier_of("hot").await, Some(Tier::Disk));
        assert_eq!(cache.get("hot").await, Some(vec![1; 10]));
        assert!(!cache.contains("cold").await);
    }

    #[tokio::test]
    async fn test_close_stops_sweeper() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::builder()
            .data_dir(tmp.path())
            .sweeper_interval(Duration::from_millis(10))
            .build();
        let cache = CacheCoordinator::open(config).await.unwrap();
        assert!(cache.sweeper.lock().await.is_some());

        cache.close().await;
        assert!(cache.sweeper.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_open() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::builder()
            .data_dir(tmp.path())
            .memory_capacity_bytes(0)
            .build();
        assert!(matches!(
            CacheCoordinator::open(config).await,
            Err(CacheError::Config(_))
        ));
    }

    /// Read `key` until it is hot enough to be written back on eviction
    async fn make_hot(cache: &CacheCoordinator, key: &str) {
        for _ in 0..4 {
            assert!(cache.get(key).await.is_some());
        }
    }

    /// Push a hot 100-byte `key` out of memory and onto disk
    async fn write_back_to_disk(cache: &CacheCoordinator, key: &str) {
        cache.set(key, vec![1; 100], None, None).await;
        make_hot(cache, key).await;
        for i in 0..4 {
            cache.set(&format!("filler{}", i), vec![0; 300], None, None).await;
        }
        assert_eq!(cache.tier_of(key).await, Some(Tier::Disk));
    }

    /// Read `key` from disk until the tier hands it over for promotion
    async fn take_promotion(cache: &CacheCoordinator, key: &str) -> CacheEntry {
        loop {
            match cache.disk.get(key).await {
                DiskLookup::Promote(entry) => return entry,
                DiskLookup::Hit(_) => {}
                other => panic!("expected a disk hit, got {:?}", other),
            }
        }
    }

    fn evicted_hot(entry: CacheEntry) -> Vec<Eviction> {
        vec![Eviction {
            entry,
            write_back: true,
        }]
    }

    #[tokio::test]
    async fn test_stale_write_back_does_not_replace_newer_disk_value() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        cache.set("k", vec![1; 100], None, None).await;
        make_hot(&cache, "k").await;

        // Evicted but not yet written back when the large set lands on disk
        let stale = cache.memory.remove("k").await.unwrap();
        assert!(cache.memory.qualifies_for_write_back(&stale));
        assert_eq!(
            cache.try_set("k", vec![9; 500], None, None).await.unwrap(),
            Tier::Disk
        );
        cache.handle_evictions(evicted_hot(stale)).await;

        assert_eq!(cache.get("k").await, Some(vec![9; 500]));
        assert_eq!(cache.stats().await.write_backs, 0);
    }

    #[tokio::test]
    async fn test_stale_write_back_does_not_replace_newer_memory_value() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        cache.set("k", vec![1; 100], None, None).await;
        make_hot(&cache, "k").await;

        let op = cache.fence.begin();
        let stale = cache.memory.remove("k").await.unwrap();
        cache.set("k", vec![9; 10], None, None).await;
        cache.handle_evictions(evicted_hot(stale)).await;
        drop(op);

        assert!(!cache.disk.contains("k").await);
        assert_eq!(cache.get("k").await, Some(vec![9; 10]));
    }

    #[tokio::test]
    async fn test_write_back_after_delete_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        cache.set("k", vec![1; 100], None, None).await;
        make_hot(&cache, "k").await;

        // The set that evicted "k" is still in flight during the delete
        let op = cache.fence.begin();
        let stale = cache.memory.remove("k").await.unwrap();
        cache.delete("k").await;
        cache.handle_evictions(evicted_hot(stale)).await;
        drop(op);

        assert!(!cache.contains("k").await);
        assert_eq!(cache.get("k").await, None);
        assert!(!cache.disk.blob_path_for("k").exists());
    }

    #[tokio::test]
    async fn test_promotion_after_delete_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();
        write_back_to_disk(&cache, "k").await;

        // The get that is promoting "k" is still in flight during the delete
        let op = cache.fence.begin();
        let promoted = take_promotion(&cache, "k").await;
        cache.delete("k").await;
        cache.promote(promoted).await;
        drop(op);

        assert!(!cache.contains("k").await);
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_promotion_does_not_replace_newer_disk_value() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();
        write_back_to_disk(&cache, "k").await;

        let op = cache.fence.begin();
        let promoted = take_promotion(&cache, "k").await;
        cache.set("k", vec![9; 500], None, None).await;
        cache.promote(promoted).await;
        drop(op);

        assert_eq!(cache.tier_of("k").await, Some(Tier::Disk));
        assert_eq!(cache.get("k").await, Some(vec![9; 500]));
    }

    #[tokio::test]
    async fn test_invalidate_class_drops_entry_in_transit() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        cache.set("k", vec![1; 100], None, Some("ocr")).await;
        make_hot(&cache, "k").await;

        let op = cache.fence.begin();
        let stale = cache.memory.remove("k").await.unwrap();
        assert_eq!(cache.invalidate_class("ocr").await, 0);
        cache.handle_evictions(evicted_hot(stale)).await;
        drop(op);

        assert!(!cache.contains("k").await);

        // Later writes to the class are unaffected
        assert!(cache.set("k", vec![2; 10], None, Some("ocr")).await);
        assert_eq!(cache.get("k").await, Some(vec![2; 10]));
    }

    #[tokio::test]
    async fn test_versions_continue_after_reopen() {
        let tmp = TempDir::new().unwrap();
        let before = {
            let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();
            cache.set("k", vec![1; 500], None, None).await;
            cache.disk.peek("k").await.unwrap().metadata.version
        };

        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();
        cache.set("k", vec![2; 10], None, None).await;
        assert!(cache.memory.peek("k").await.unwrap().metadata.version > before);
        assert!(!cache.disk.contains("k").await);
    }

    /// Put a regular file where the blob directory should be
    fn break_blob_dir(dir: &std::path::Path) {
        let blobs = dir.join("blobs");
        std::fs::remove_dir_all(&blobs).unwrap();
        std::fs::write(&blobs, b"").unwrap();
    }

    #[tokio::test]
    async fn test_disk_write_failure_falls_back_to_memory() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();
        break_blob_dir(tmp.path());

        assert_eq!(
            cache.try_set("big", vec![2; 500], None, None).await.unwrap(),
            Tier::Memory
        );
        assert_eq!(cache.get("big").await, Some(vec![2; 500]));
        assert!(!cache.disk.contains("big").await);
        assert_eq!(cache.stats().await.io_failures, 1);
    }

    #[tokio::test]
    async fn test_write_back_failure_drops_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        cache.set("k", vec![1; 100], None, None).await;
        make_hot(&cache, "k").await;
        break_blob_dir(tmp.path());

        for i in 0..4 {
            cache.set(&format!("filler{}", i), vec![0; 300], None, None).await;
        }

        assert!(!cache.contains("k").await);
        let stats = cache.stats().await;
        assert_eq!(stats.io_failures, 1);
        // "k" and filler0 were both pushed out
        assert_eq!(stats.write_backs, 0);
        assert_eq!(stats.evictions, 2);
    }

    #[tokio::test]
    async fn test_index_write_failure_keeps_disk_tier_serving() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheCoordinator::open(config(tmp.path())).await.unwrap();

        // A directory where the index file should be
        let index_path = cache.disk.index_path();
        if index_path.exists() {
            std::fs::remove_file(&index_path).unwrap();
        }
        std::fs::create_dir(&index_path).unwrap();

        assert!(cache.set("big", vec![3; 500], None, None).await);
        assert_eq!(cache.tier_of("big").await, Some(Tier::Disk));
        assert_eq!(cache.get("big").await, Some(vec![3; 500]));
        assert!(matches!(cache.disk.flush().await, Err(CacheError::Io { .. })));

        // Close logs the flush failure rather than failing
        cache.close().await;
        assert_eq!(cache.get("big").await, Some(vec![3; 500]));
    }
}

//! Persistent overflow tier
//!
//! Layout under the data directory:
//!
//! - `index.json`: one record per disk-resident key, rewritten wholesale via a
//!   temp file and rename on every mutation
//! - `blobs/<sha256(key)>.blob`: the encoded payload for each key
//!
//! The index is the source of truth. Records whose blob is missing, or whose
//! blob name does not match their key, are dropped at open. Blobs without a
//! record are ignored until [`DiskTier::purge_orphans`] removes them.

use crate::cache::codec::{key_digest, BlobCodec};
use crate::cache::entry::{CacheEntry, CacheMetadata};
use crate::cache::types::CacheKey;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";
const INDEX_VERSION: u32 = 1;

/// Index record for one disk-resident key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub key: CacheKey,

    #[serde(flatten)]
    pub metadata: CacheMetadata,

    /// Blob file name relative to the blob directory
    pub blob: String,
}

#[derive(Deserialize)]
struct IndexFile {
    version: u32,
    records: Vec<IndexRecord>,
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    version: u32,
    records: Vec<&'a IndexRecord>,
}

/// Outcome of a disk tier lookup
#[derive(Debug, Clone)]
pub enum DiskLookup {
    Hit(Vec<u8>),

    /// Access count crossed the promotion threshold; the entry has already
    /// been removed from disk and must be inserted into memory
    Promote(CacheEntry),

    /// Record was past `expires_at`; record and blob have been removed
    Expired,

    Absent,

    /// Blob unreadable or undecodable; record and blob have been removed
    Failed,
}

#[derive(Default)]
struct DiskIndex {
    records: BTreeMap<CacheKey, IndexRecord>,
    resident_bytes: u64,
}

impl DiskIndex {
    fn from_records(records: impl IntoIterator<Item = IndexRecord>) -> Self {
        let records: BTreeMap<_, _> = records.into_iter().map(|r| (r.key.clone(), r)).collect();
        let resident_bytes = records.values().map(|r| r.metadata.size_bytes as u64).sum();
        Self {
            records,
            resident_bytes,
        }
    }
}

/// Disk-backed store with an in-memory index
pub struct DiskTier {
    dir: PathBuf,
    blob_dir: PathBuf,
    capacity_bytes: u64,
    promotion_threshold: u64,
    promotion_max_bytes: usize,
    codec: Arc<dyn BlobCodec>,
    state: Mutex<DiskIndex>,
}

impl DiskTier {
    /// Open (or create) the tier in `dir`, loading its index
    ///
    /// Only a failure to create the directories is an error. An unreadable or
    /// torn index yields an empty (cold) tier.
    pub async fn open(
        dir: impl Into<PathBuf>,
        capacity_bytes: u64,
        promotion_threshold: u64,
        promotion_max_bytes: usize,
        codec: Arc<dyn BlobCodec>,
    ) -> Result<Self> {
        let dir = dir.into();
        let blob_dir = dir.join(BLOB_DIR);
        fs::create_dir_all(&blob_dir)
            .await
            .map_err(|e| CacheError::io(&blob_dir, e))?;

        let tier = Self {
            dir,
            blob_dir,
            capacity_bytes,
            promotion_threshold,
            promotion_max_bytes,
            codec,
            state: Mutex::new(DiskIndex::default()),
        };

        let index = tier.load_index().await;
        info!(
            "Opened disk tier at {:?} ({} entries, {} bytes)",
            tier.dir,
            index.records.len(),
            index.resident_bytes
        );
        *tier.state.lock().await = index;

        Ok(tier)
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    /// Path of the blob that holds (or would hold) `key`
    pub fn blob_path_for(&self, key: &str) -> PathBuf {
        self.blob_dir.join(blob_name(key))
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Look up a key, updating its access metadata and signalling promotion
    pub async fn get(&self, key: &str) -> DiskLookup {
        let mut index = self.state.lock().await;

        let Some(record) = index.records.get(key) else {
            return DiskLookup::Absent;
        };

        if record.metadata.is_expired_at(Utc::now()) {
            debug!("Disk entry expired: {}", key);
            self.remove_locked(&mut index, key).await;
            self.persist_best_effort(&index).await;
            return DiskLookup::Expired;
        }

        let path = self.blob_dir.join(&record.blob);
        let decoded = match fs::read(&path).await {
            Ok(blob) => self.codec.decode(key, &blob),
            Err(e) => Err(CacheError::io(&path, e)),
        };
        let value = match decoded {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping unreadable disk entry {}: {}", key, e);
                self.remove_locked(&mut index, key).await;
                self.persist_best_effort(&index).await;
                return DiskLookup::Failed;
            }
        };

        let promote = match index.records.get_mut(key) {
            Some(record) => {
                record.metadata.mark_accessed();
                record.metadata.access_count > self.promotion_threshold
                    && record.metadata.size_bytes <= self.promotion_max_bytes
            }
            None => false,
        };

        if promote {
            if let Some(record) = self.remove_locked(&mut index, key).await {
                self.persist_best_effort(&index).await;
                debug!(
                    "Promoting {} (access_count={})",
                    key, record.metadata.access_count
                );
                return DiskLookup::Promote(CacheEntry::from_parts(
                    record.key,
                    value,
                    record.metadata,
                ));
            }
        }

        self.persist_best_effort(&index).await;
        DiskLookup::Hit(value)
    }

    /// Persist an entry, returning keys dropped to stay under capacity
    pub async fn put(&self, entry: CacheEntry) -> Result<Vec<CacheKey>> {
        Ok(self.put_if(entry, |_| true).await?.unwrap_or_default())
    }

    /// Persist an entry only if `accept` approves the current record, if any
    ///
    /// `accept` runs under the index lock. Returns `None` when refused.
    pub async fn put_if<F>(&self, entry: CacheEntry, accept: F) -> Result<Option<Vec<CacheKey>>>
    where
        F: FnOnce(Option<&IndexRecord>) -> bool,
    {
        let size = entry.size_bytes() as u64;
        if size > self.capacity_bytes {
            return Err(CacheError::CapacityRejection {
                size_bytes: size,
                limit_bytes: self.capacity_bytes,
            });
        }

        let blob = self.codec.encode(&entry.key, &entry.value)?;
        let name = blob_name(&entry.key);

        let mut index = self.state.lock().await;
        if !accept(index.records.get(&entry.key)) {
            return Ok(None);
        }

        // Replacing a key frees its old bytes before the capacity check
        let previous = index.records.remove(&entry.key);
        if let Some(previous) = &previous {
            index.resident_bytes = index
                .resident_bytes
                .saturating_sub(previous.metadata.size_bytes as u64);
        }

        let mut dropped = Vec::new();
        while index.resident_bytes + size > self.capacity_bytes {
            let Some(victim) = index
                .records
                .values()
                .min_by_key(|r| r.metadata.last_accessed)
                .map(|r| r.key.clone())
            else {
                break;
            };
            debug!("Dropping {} from disk to make room for {}", victim, entry.key);
            self.remove_locked(&mut index, &victim).await;
            dropped.push(victim);
        }

        let path = self.blob_dir.join(&name);
        if let Err(e) = write_atomic(&path, &blob).await {
            // The old blob may or may not have been replaced; drop it either way
            if previous.is_some() {
                remove_blob(&path).await;
            }
            self.persist_best_effort(&index).await;
            return Err(e);
        }

        index.resident_bytes += size;
        index.records.insert(
            entry.key.clone(),
            IndexRecord {
                key: entry.key,
                metadata: entry.metadata,
                blob: name,
            },
        );
        self.persist_best_effort(&index).await;

        Ok(Some(dropped))
    }

    /// Remove a key's record and blob; absent keys are a no-op
    pub async fn remove(&self, key: &str) -> Option<IndexRecord> {
        let mut index = self.state.lock().await;
        let removed = self.remove_locked(&mut index, key).await;
        if removed.is_some() {
            self.persist_best_effort(&index).await;
        }
        removed
    }

    /// Remove `key` only if `pred` holds for its record
    pub async fn remove_if<F>(&self, key: &str, pred: F) -> Option<IndexRecord>
    where
        F: FnOnce(&IndexRecord) -> bool,
    {
        let mut index = self.state.lock().await;
        if !index.records.get(key).is_some_and(pred) {
            return None;
        }
        let removed = self.remove_locked(&mut index, key).await;
        self.persist_best_effort(&index).await;
        removed
    }

    /// Remove each key that is still expired at `now`
    ///
    /// The lock is taken per key so foreground operations interleave with a
    /// large batch. The index is written once at the end.
    pub async fn remove_expired_batch(
        &self,
        keys: &[CacheKey],
        now: DateTime<Utc>,
    ) -> Vec<IndexRecord> {
        let mut removed = Vec::new();
        for key in keys {
            {
                let mut index = self.state.lock().await;
                let expired = index
                    .records
                    .get(key)
                    .is_some_and(|r| r.metadata.is_expired_at(now));
                if expired {
                    removed.extend(self.remove_locked(&mut index, key).await);
                }
            }
            tokio::task::yield_now().await;
        }

        if !removed.is_empty() {
            let index = self.state.lock().await;
            self.persist_best_effort(&index).await;
        }
        removed
    }

    /// Collect expired keys from up to `limit` records after `cursor`
    ///
    /// Returns the keys and the cursor for the next batch, `None` once every
    /// record has been scanned.
    pub async fn scan_expired(
        &self,
        cursor: Option<&str>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> (Vec<CacheKey>, Option<CacheKey>) {
        let index = self.state.lock().await;
        let lower = match cursor {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };

        let mut expired = Vec::new();
        let mut last = None;
        let mut scanned = 0;
        for (key, record) in index
            .records
            .range::<str, _>((lower, Bound::Unbounded))
            .take(limit)
        {
            if record.metadata.is_expired_at(now) {
                expired.push(key.clone());
            }
            last = Some(key.clone());
            scanned += 1;
        }

        let next = if scanned < limit { None } else { last };
        (expired, next)
    }

    /// Keys of every record tagged with `class`
    pub async fn keys_in_class(&self, class: &str) -> Vec<CacheKey> {
        let index = self.state.lock().await;
        index
            .records
            .values()
            .filter(|r| r.metadata.class == class)
            .map(|r| r.key.clone())
            .collect()
    }

    /// Remove every record and blob, returning how many were removed
    pub async fn clear(&self) -> usize {
        let mut index = self.state.lock().await;
        let keys: Vec<CacheKey> = index.records.keys().cloned().collect();
        for key in &keys {
            self.remove_locked(&mut index, key).await;
        }
        self.persist_best_effort(&index).await;
        keys.len()
    }

    /// Delete blob files that no index record references
    pub async fn purge_orphans(&self) -> Result<usize> {
        let index = self.state.lock().await;
        let referenced: HashSet<&str> = index.records.values().map(|r| r.blob.as_str()).collect();

        let mut dir = fs::read_dir(&self.blob_dir)
            .await
            .map_err(|e| CacheError::io(&self.blob_dir, e))?;

        let mut purged = 0;
        while let Some(file) = dir
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.blob_dir, e))?
        {
            let name = file.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if referenced.contains(name) {
                continue;
            }
            match fs::remove_file(file.path()).await {
                Ok(()) => purged += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to purge orphan blob {:?}: {}", file.path(), e),
            }
        }

        if purged > 0 {
            info!("Purged {} orphaned blobs", purged);
        }
        Ok(purged)
    }

    /// Write the index to disk
    pub async fn flush(&self) -> Result<()> {
        let index = self.state.lock().await;
        self.persist(&index).await
    }

    /// Snapshot of all index records, ordered by key
    pub async fn records(&self) -> Vec<IndexRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    /// Index record for a key without touching access metadata
    pub async fn peek(&self, key: &str) -> Option<IndexRecord> {
        self.state.lock().await.records.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.state.lock().await.records.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.records.is_empty()
    }

    pub async fn resident_bytes(&self) -> u64 {
        self.state.lock().await.resident_bytes
    }

    /// Highest write version among the records
    pub async fn max_version(&self) -> u64 {
        let index = self.state.lock().await;
        index
            .records
            .values()
            .map(|r| r.metadata.version)
            .max()
            .unwrap_or(0)
    }

    async fn remove_locked(&self, index: &mut DiskIndex, key: &str) -> Option<IndexRecord> {
        let record = index.records.remove(key)?;
        index.resident_bytes = index
            .resident_bytes
            .saturating_sub(record.metadata.size_bytes as u64);
        remove_blob(&self.blob_dir.join(&record.blob)).await;
        Some(record)
    }

    async fn load_index(&self) -> DiskIndex {
        let path = self.index_path();
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return DiskIndex::default(),
            Err(e) => {
                warn!("Cannot read cache index {:?}, starting cold: {}", path, e);
                return DiskIndex::default();
            }
        };

        let file = match parse_index(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!("{} in {:?}, starting cold", e, path);
                return DiskIndex::default();
            }
        };

        let total = file.records.len();
        let mut records = Vec::with_capacity(total);
        for record in file.records {
            // Blob paths are derived from the key, never taken from the file
            if record.blob != blob_name(&record.key) {
                warn!(
                    "Dropping index record {} with foreign blob name {:?}",
                    record.key, record.blob
                );
                continue;
            }
            match fs::try_exists(self.blob_dir.join(&record.blob)).await {
                Ok(true) => records.push(record),
                _ => debug!("Dropping index record {} with missing blob", record.key),
            }
        }

        let index = DiskIndex::from_records(records);
        if index.records.len() != total {
            warn!(
                "Dropped {} invalid index records",
                total - index.records.len()
            );
            self.persist_best_effort(&index).await;
        }
        index
    }

    async fn persist(&self, index: &DiskIndex) -> Result<()> {
        let file = IndexFileRef {
            version: INDEX_VERSION,
            records: index.records.values().collect(),
        };
        let bytes = serde_json::to_vec(&file)?;
        write_atomic(&self.index_path(), &bytes).await
    }

    async fn persist_best_effort(&self, index: &DiskIndex) {
        if let Err(e) = self.persist(index).await {
            warn!("Failed to persist cache index: {}", e);
        }
    }
}

fn blob_name(key: &str) -> String {
    format!("{}.blob", key_digest(key))
}

fn parse_index(raw: &[u8]) -> Result<IndexFile> {
    let file: IndexFile = serde_json::from_slice(raw)
        .map_err(|e| CacheError::IndexCorruption(e.to_string()))?;
    if file.version != INDEX_VERSION {
        return Err(CacheError::IndexCorruption(format!(
            "unsupported index version {}",
            file.version
        )));
    }
    Ok(file)
}

/// Write to a sibling temp file, then rename over `path`
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("cache");
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    if let Err(e) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(CacheError::io(&tmp, e));
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(CacheError::io(path, e));
    }
    Ok(())
}

async fn remove_blob(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove blob {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::EnvelopeCodec;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn open_tier(dir: &Path) -> DiskTier {
        DiskTier::open(dir, 10_000, 5, 1_000, Arc::new(EnvelopeCodec))
            .await
            .unwrap()
    }

    fn entry(key: &str, size: usize) -> CacheEntry {
        CacheEntry::new(key.to_string(), vec![7; size], None, None)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;

        tier.put(entry("a", 100)).await.unwrap();
        assert!(tier.blob_path_for("a").exists());
        assert_eq!(tier.resident_bytes().await, 100);

        match tier.get("a").await {
            DiskLookup::Hit(v) => assert_eq!(v, vec![7; 100]),
            other => panic!("expected hit, got {:?}", other),
        }
        assert_eq!(tier.peek("a").await.unwrap().metadata.access_count, 1);

        assert!(tier.remove("a").await.is_some());
        assert!(!tier.blob_path_for("a").exists());
        assert!(matches!(tier.get("a").await, DiskLookup::Absent));

        // Idempotent
        assert!(tier.remove("a").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_tolerates_missing_blob() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;

        tier.put(entry("a", 10)).await.unwrap();
        std::fs::remove_file(tier.blob_path_for("a")).unwrap();

        assert!(tier.remove("a").await.is_some());
        assert!(tier.is_empty().await);
    }

    #[tokio::test]
    async fn test_promotion_after_threshold() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;
        tier.put(entry("hot", 10)).await.unwrap();

        for _ in 0..5 {
            assert!(matches!(tier.get("hot").await, DiskLookup::Hit(_)));
        }
        match tier.get("hot").await {
            DiskLookup::Promote(entry) => {
                assert_eq!(entry.metadata.access_count, 6);
                assert_eq!(entry.value, vec![7; 10]);
            }
            other => panic!("expected promotion, got {:?}", other),
        }
        assert!(!tier.contains("hot").await);
        assert!(!tier.blob_path_for("hot").exists());
    }

    #[tokio::test]
    async fn test_no_promotion_when_too_large_for_memory() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;
        tier.put(entry("big", 5_000)).await.unwrap();

        for _ in 0..10 {
            assert!(matches!(tier.get("big").await, DiskLookup::Hit(_)));
        }
        assert!(tier.contains("big").await);
    }

    #[tokio::test]
    async fn test_expired_record_removed_on_get() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;
        let short = CacheEntry::new(
            "short".to_string(),
            b"v".to_vec(),
            Some(Duration::from_millis(30)),
            None,
        );
        tier.put(short).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(tier.get("short").await, DiskLookup::Expired));
        assert!(!tier.blob_path_for("short").exists());
        assert!(tier.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupted_blob_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;
        tier.put(entry("a", 10)).await.unwrap();
        std::fs::write(tier.blob_path_for("a"), b"garbage").unwrap();

        assert!(matches!(tier.get("a").await, DiskLookup::Failed));
        assert!(!tier.contains("a").await);
    }

    #[tokio::test]
    async fn test_capacity_drops_least_recently_accessed() {
        let tmp = TempDir::new().unwrap();
        let tier = DiskTier::open(tmp.path(), 300, 100, 1_000, Arc::new(EnvelopeCodec))
            .await
            .unwrap();
        tier.put(entry("a", 100)).await.unwrap();
        tier.put(entry("b", 100)).await.unwrap();
        tier.put(entry("c", 100)).await.unwrap();
        tier.get("a").await;

        let dropped = tier.put(entry("d", 100)).await.unwrap();
        assert_eq!(dropped, vec!["b".to_string()]);
        assert_eq!(tier.resident_bytes().await, 300);

        let too_big = tier.put(entry("e", 301)).await;
        assert!(matches!(too_big, Err(CacheError::CapacityRejection { .. })));
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let tier = open_tier(tmp.path()).await;
            tier.put(CacheEntry::new(
                "a".into(),
                b"persisted".to_vec(),
                None,
                Some("ai_response"),
            ))
            .await
            .unwrap();
        }

        let tier = open_tier(tmp.path()).await;
        let record = tier.peek("a").await.unwrap();
        assert_eq!(record.metadata.class, "ai_response");
        assert_eq!(record.metadata.size_bytes, 9);
        match tier.get("a").await {
            DiskLookup::Hit(v) => assert_eq!(v, b"persisted"),
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_torn_index_starts_cold() {
        let tmp = TempDir::new().unwrap();
        {
            let tier = open_tier(tmp.path()).await;
            tier.put(entry("a", 10)).await.unwrap();
            let raw = std::fs::read(tier.index_path()).unwrap();
            std::fs::write(tier.index_path(), &raw[..raw.len() / 2]).unwrap();
        }

        let tier = open_tier(tmp.path()).await;
        assert!(tier.is_empty().await);
        assert!(matches!(tier.get("a").await, DiskLookup::Absent));

        // The orphaned blob is still on disk until purged
        assert!(tier.blob_path_for("a").exists());
        assert_eq!(tier.purge_orphans().await.unwrap(), 1);
        assert!(!tier.blob_path_for("a").exists());
    }

    #[tokio::test]
    async fn test_missing_blob_record_dropped_at_open() {
        let tmp = TempDir::new().unwrap();
        {
            let tier = open_tier(tmp.path()).await;
            tier.put(entry("a", 10)).await.unwrap();
            tier.put(entry("b", 10)).await.unwrap();
            std::fs::remove_file(tier.blob_path_for("a")).unwrap();
        }

        let tier = open_tier(tmp.path()).await;
        assert!(!tier.contains("a").await);
        assert!(tier.contains("b").await);
        assert_eq!(tier.resident_bytes().await, 10);
    }

    #[tokio::test]
    async fn test_scan_expired_batches() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;
        for i in 0..7 {
            let ttl = (i % 3 == 0).then(|| Duration::from_millis(20));
            tier.put(CacheEntry::new(format!("k{}", i), vec![1], ttl, None))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        let now = Utc::now();
        let mut cursor: Option<CacheKey> = None;
        let mut expired = Vec::new();
        let mut batches = 0;
        loop {
            let (keys, next) = tier.scan_expired(cursor.as_deref(), 2, now).await;
            expired.extend(keys);
            batches += 1;
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert!(batches >= 4);
        assert_eq!(expired, vec!["k0", "k3", "k6"]);
    }

    #[tokio::test]
    async fn test_clear_and_class_keys() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;
        tier.put(CacheEntry::new("a".into(), vec![1], None, Some("ocr")))
            .await
            .unwrap();
        tier.put(entry("b", 1)).await.unwrap();

        assert_eq!(tier.keys_in_class("ocr").await, vec!["a"]);
        assert_eq!(tier.clear().await, 2);
        assert!(tier.is_empty().await);
        assert_eq!(tier.purge_orphans().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_if_and_remove_if_respect_versions() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;
        let mut newer = entry("a", 10);
        newer.metadata.version = 9;
        tier.put(newer).await.unwrap();

        let mut older = entry("a", 20);
        older.metadata.version = 4;
        let refused = tier
            .put_if(older, |existing| existing.map_or(true, |r| r.metadata.version < 4))
            .await
            .unwrap();
        assert!(refused.is_none());
        assert_eq!(tier.peek("a").await.unwrap().metadata.version, 9);
        assert_eq!(tier.resident_bytes().await, 10);

        assert!(tier.remove_if("a", |r| r.metadata.version < 9).await.is_none());
        assert!(tier.remove_if("a", |r| r.metadata.version < 10).await.is_some());
        assert!(!tier.blob_path_for("a").exists());
        assert_eq!(tier.max_version().await, 0);
    }

    #[tokio::test]
    async fn test_remove_expired_batch_persists_index() {
        let tmp = TempDir::new().unwrap();
        {
            let tier = open_tier(tmp.path()).await;
            for i in 0..4 {
                let ttl = (i % 2 == 0).then(|| Duration::from_millis(20));
                tier.put(CacheEntry::new(format!("k{}", i), vec![1], ttl, None))
                    .await
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_millis(40)).await;

            let keys: Vec<CacheKey> = ["k0", "k1", "k2"].iter().map(|k| k.to_string()).collect();
            let removed = tier.remove_expired_batch(&keys, Utc::now()).await;
            let removed: Vec<_> = removed.into_iter().map(|r| r.key).collect();
            assert_eq!(removed, vec!["k0", "k2"]);
            assert!(!tier.blob_path_for("k0").exists());
        }

        // k1 was not expired and k3 was not in the batch
        let tier = open_tier(tmp.path()).await;
        let keys: Vec<_> = tier.records().await.into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["k1", "k3"]);
    }

    #[tokio::test]
    async fn test_foreign_blob_name_dropped_at_open() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("outside.txt");
        std::fs::write(&outside, b"not a cache blob").unwrap();
        {
            let tier = open_tier(tmp.path()).await;
            tier.put(entry("a", 10)).await.unwrap();
            tier.put(entry("b", 10)).await.unwrap();

            let raw = std::fs::read(tier.index_path()).unwrap();
            let mut index: serde_json::Value = serde_json::from_slice(&raw).unwrap();
            for record in index["records"].as_array_mut().unwrap() {
                if record["key"] == "a" {
                    record["blob"] = serde_json::json!("../outside.txt");
                }
            }
            std::fs::write(tier.index_path(), serde_json::to_vec(&index).unwrap()).unwrap();
        }

        let tier = open_tier(tmp.path()).await;
        assert!(!tier.contains("a").await);
        assert!(tier.contains("b").await);
        assert!(matches!(tier.get("a").await, DiskLookup::Absent));
        assert!(tier.remove("a").await.is_none());
        tier.purge_orphans().await.unwrap();
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn test_blob_write_failure_surfaces_io_error() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;
        tier.put(entry("a", 10)).await.unwrap();

        // A regular file where the blob directory should be
        let blobs = tmp.path().join(BLOB_DIR);
        std::fs::remove_dir_all(&blobs).unwrap();
        std::fs::write(&blobs, b"").unwrap();

        let result = tier.put(entry("b", 10)).await;
        assert!(matches!(result, Err(CacheError::Io { .. })));
        assert!(!tier.contains("b").await);
        assert_eq!(tier.resident_bytes().await, 10);

        // The unreadable record is dropped rather than served
        assert!(matches!(tier.get("a").await, DiskLookup::Failed));
        assert!(tier.is_empty().await);
    }

    #[tokio::test]
    async fn test_index_persist_failure_keeps_serving() {
        let tmp = TempDir::new().unwrap();
        let tier = open_tier(tmp.path()).await;
        tier.put(entry("a", 10)).await.unwrap();

        // A directory where the index file should be
        std::fs::remove_file(tier.index_path()).unwrap();
        std::fs::create_dir(tier.index_path()).unwrap();

        tier.put(entry("b", 20)).await.unwrap();
        assert!(matches!(tier.get("a").await, DiskLookup::Hit(_)));
        match tier.get("b").await {
            DiskLookup::Hit(v) => assert_eq!(v, vec![7; 20]),
            other => panic!("expected hit, got {:?}", other),
        }
        assert_eq!(tier.len().await, 2);

        let flushed = tier.flush().await;
        assert!(matches!(flushed, Err(CacheError::Io { .. })));
    }
}

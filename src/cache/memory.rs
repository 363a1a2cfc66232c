//! Bounded in-memory tier with LRU eviction
//!
//! Recency is kept in a doubly-linked list whose nodes live in a slot arena,
//! with a key -> slot table for O(1) lookup, move-to-front and eviction.
//! Freed slots are reused, so slot indices double as a stable scan cursor for
//! the expiry sweeper.

use crate::cache::entry::CacheEntry;
use crate::cache::types::CacheKey;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Outcome of a memory tier lookup
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryLookup {
    Hit(Vec<u8>),

    /// Entry was present but past `expires_at`; it has been removed
    Expired,

    Absent,
}

/// An entry pushed out by a `put`
#[derive(Debug, Clone)]
pub struct Eviction {
    pub entry: CacheEntry,

    /// `access_count` exceeded the write-back threshold
    pub write_back: bool,
}

/// Bounded LRU store
pub struct MemoryTier {
    capacity_bytes: usize,
    write_back_threshold: u64,
    store: RwLock<LruList>,
}

impl MemoryTier {
    pub fn new(capacity_bytes: usize, write_back_threshold: u64) -> Self {
        Self {
            capacity_bytes,
            write_back_threshold,
            store: RwLock::new(LruList::default()),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Look up a key, refreshing its recency and access metadata on a hit
    pub async fn get(&self, key: &str) -> MemoryLookup {
        let mut store = self.store.write().await;

        let Some(&slot) = store.index.get(key) else {
            return MemoryLookup::Absent;
        };

        if store.node(slot).entry.is_expired() {
            store.remove_slot(slot);
            debug!("Memory entry expired: {}", key);
            return MemoryLookup::Expired;
        }

        store.move_to_front(slot);
        let entry = &mut store.node_mut(slot).entry;
        entry.mark_accessed();
        MemoryLookup::Hit(entry.value.clone())
    }

    /// Insert an entry as most-recently-used, evicting from the LRU end
    ///
    /// Any resident entry for the same key is replaced. Evicted entries are
    /// returned so the caller can write them back outside this lock.
    pub async fn put(&self, entry: CacheEntry) -> Result<Vec<Eviction>> {
        Ok(self.put_if(entry, |_| true).await?.unwrap_or_default())
    }

    /// Insert only if `accept` approves the resident copy of the key, if any
    ///
    /// `accept` runs under the tier lock, so the decision and the write are
    /// atomic with respect to other writers. Returns `None` when refused.
    pub async fn put_if<F>(&self, entry: CacheEntry, accept: F) -> Result<Option<Vec<Eviction>>>
    where
        F: FnOnce(Option<&CacheEntry>) -> bool,
    {
        self.check_fits(&entry)?;
        let mut store = self.store.write().await;

        let resident = store.index.get(&entry.key).copied();
        if !accept(resident.map(|slot| &store.node(slot).entry)) {
            return Ok(None);
        }
        if let Some(slot) = resident {
            store.remove_slot(slot);
        }
        Ok(Some(self.insert_locked(&mut store, entry)))
    }

    fn check_fits(&self, entry: &CacheEntry) -> Result<()> {
        let size = entry.size_bytes();
        if size > self.capacity_bytes {
            return Err(CacheError::CapacityRejection {
                size_bytes: size as u64,
                limit_bytes: self.capacity_bytes as u64,
            });
        }
        Ok(())
    }

    fn insert_locked(&self, store: &mut LruList, entry: CacheEntry) -> Vec<Eviction> {
        store.push_front(entry);

        let mut evicted = Vec::new();
        while store.resident_bytes > self.capacity_bytes {
            // The new entry fits on its own, so the tail is never the new entry
            let Some(entry) = store.pop_back() else {
                break;
            };
            let write_back = self.qualifies_for_write_back(&entry);
            debug!(
                "Evicting {} from memory (access_count={}, write_back={})",
                entry.key, entry.metadata.access_count, write_back
            );
            evicted.push(Eviction { entry, write_back });
        }
        evicted
    }

    /// Unconditional removal
    pub async fn remove(&self, key: &str) -> Option<CacheEntry> {
        let mut store = self.store.write().await;
        let slot = store.index.get(key).copied()?;
        Some(store.remove_slot(slot))
    }

    /// Remove `key` only if `pred` holds for the resident entry
    pub async fn remove_if<F>(&self, key: &str, pred: F) -> Option<CacheEntry>
    where
        F: FnOnce(&CacheEntry) -> bool,
    {
        let mut store = self.store.write().await;
        let slot = store.index.get(key).copied()?;
        if !pred(&store.node(slot).entry) {
            return None;
        }
        Some(store.remove_slot(slot))
    }

    /// Remove `key` only if it is still expired at `now`
    pub async fn remove_if_expired(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut store = self.store.write().await;
        let slot = store.index.get(key).copied()?;
        if !store.node(slot).entry.metadata.is_expired_at(now) {
            return None;
        }
        Some(store.remove_slot(slot))
    }

    /// Collect expired keys from up to `limit` slots starting at `cursor`
    ///
    /// Returns the keys and the cursor for the next batch, `None` once the
    /// arena has been fully scanned.
    pub async fn scan_expired(
        &self,
        cursor: usize,
        limit: usize,
        now: DateTime<Utc>,
    ) -> (Vec<CacheKey>, Option<usize>) {
        let store = self.store.read().await;
        let end = cursor.saturating_add(limit).min(store.slots.len());

        let expired = store.slots[cursor.min(end)..end]
            .iter()
            .flatten()
            .filter(|node| node.entry.metadata.is_expired_at(now))
            .map(|node| node.entry.key.clone())
            .collect();

        let next = (end < store.slots.len()).then_some(end);
        (expired, next)
    }

    /// Keys of every resident entry tagged with `class`
    pub async fn keys_in_class(&self, class: &str) -> Vec<CacheKey> {
        let store = self.store.read().await;
        store
            .slots
            .iter()
            .flatten()
            .filter(|node| node.entry.metadata.class == class)
            .map(|node| node.entry.key.clone())
            .collect()
    }

    /// Remove and return every entry, least recently used first
    pub async fn drain(&self) -> Vec<CacheEntry> {
        let mut store = self.store.write().await;
        let mut entries = Vec::with_capacity(store.index.len());
        while let Some(entry) = store.pop_back() {
            entries.push(entry);
        }
        *store = LruList::default();
        entries
    }

    /// Whether an evicted entry of this access count would be written back
    pub fn qualifies_for_write_back(&self, entry: &CacheEntry) -> bool {
        entry.metadata.access_count > self.write_back_threshold
    }

    /// Check presence without touching recency
    pub async fn contains(&self, key: &str) -> bool {
        self.store.read().await.index.contains_key(key)
    }

    /// Copy of an entry's metadata without touching recency
    pub async fn peek(&self, key: &str) -> Option<CacheEntry> {
        let store = self.store.read().await;
        let slot = store.index.get(key).copied()?;
        Some(store.node(slot).entry.clone())
    }

    /// Keys ordered from least to most recently used
    pub async fn keys_by_recency(&self) -> Vec<CacheKey> {
        let store = self.store.read().await;
        let mut keys = Vec::with_capacity(store.index.len());
        let mut cursor = store.tail;
        while let Some(slot) = cursor {
            let node = store.node(slot);
            keys.push(node.entry.key.clone());
            cursor = node.prev;
        }
        keys
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.index.is_empty()
    }

    pub async fn resident_bytes(&self) -> usize {
        self.store.read().await.resident_bytes
    }
}

struct Node {
    entry: CacheEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena-backed doubly-linked list; `head` is most recently used
#[derive(Default)]
struct LruList {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<CacheKey, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    resident_bytes: usize,
}

impl LruList {
    // Slots reached through `index` or the links are always occupied.
    fn node(&self, slot: usize) -> &Node {
        match &self.slots[slot] {
            Some(node) => node,
            None => unreachable!("linked slot {} is vacant", slot),
        }
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        match &mut self.slots[slot] {
            Some(node) => node,
            None => unreachable!("linked slot {} is vacant", slot),
        }
    }

    fn push_front(&mut self, entry: CacheEntry) -> usize {
        self.resident_bytes += entry.size_bytes();
        let key = entry.key.clone();
        let node = Node {
            entry,
            prev: None,
            next: self.head,
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        if let Some(old_head) = self.head {
            self.node_mut(old_head).prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
        self.index.insert(key, slot);
        slot
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };

        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }

        let node = self.node_mut(slot);
        node.prev = None;
        node.next = None;
    }

    fn move_to_front(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);

        let old_head = self.head;
        {
            let node = self.node_mut(slot);
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h).prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn remove_slot(&mut self, slot: usize) -> CacheEntry {
        self.unlink(slot);
        let node = match self.slots[slot].take() {
            Some(node) => node,
            None => unreachable!("linked slot {} is vacant", slot),
        };
        self.free.push(slot);
        self.index.remove(&node.entry.key);
        self.resident_bytes = self.resident_bytes.saturating_sub(node.entry.size_bytes());
        node.entry
    }

    fn pop_back(&mut self) -> Option<CacheEntry> {
        let tail = self.tail?;
        Some(self.remove_slot(tail))
    }
}

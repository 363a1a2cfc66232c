//! Write ordering for entries moving between tiers
//!
//! Every set, delete and invalidation takes a version from a shared clock
//! before it touches a tier. An entry in transit (a write-back or a
//! promotion) is only admitted into its destination tier if no newer write,
//! delete or invalidation of its key or class has been issued since the entry
//! was written. Fences are kept while any operation is in flight and dropped
//! once the coordinator goes idle, when no entry can be in transit.

use crate::cache::types::CacheKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Fences {
    keys: HashMap<CacheKey, u64>,
    classes: HashMap<String, u64>,
}

pub struct WriteFence {
    clock: AtomicU64,

    /// Versions below this were issued before the last `clear`
    floor: AtomicU64,

    active: AtomicUsize,
    fences: Mutex<Fences>,
}

impl Default for WriteFence {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteFence {
    pub fn new() -> Self {
        Self {
            // Version 0 is reserved for entries that never went through a set
            clock: AtomicU64::new(1),
            floor: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            fences: Mutex::new(Fences::default()),
        }
    }

    /// Make sure future versions are above `version`
    pub fn observe(&self, version: u64) {
        self.clock.fetch_max(version.saturating_add(1), Ordering::SeqCst);
    }

    /// Mark an operation as in flight until the guard drops
    pub fn begin(&self) -> FenceGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        FenceGuard { fence: self }
    }

    /// Version for a new write or delete of `key`
    pub fn issue(&self, key: &str) -> u64 {
        let mut fences = self.lock();
        let version = self.next();
        let latest = fences.keys.entry(key.to_string()).or_insert(version);
        *latest = (*latest).max(version);
        version
    }

    /// Version for an invalidation of every entry tagged `class`
    pub fn issue_class(&self, class: &str) -> u64 {
        let mut fences = self.lock();
        let version = self.next();
        let latest = fences.classes.entry(class.to_string()).or_insert(version);
        *latest = (*latest).max(version);
        version
    }

    /// Version for a `clear`; everything written before it is stale
    pub fn issue_floor(&self) -> u64 {
        let _fences = self.lock();
        let version = self.next();
        self.floor.fetch_max(version, Ordering::SeqCst);
        version
    }

    /// Whether an entry written at `version` is still current
    pub fn admits(&self, key: &str, class: &str, version: u64) -> bool {
        if version < self.floor.load(Ordering::SeqCst) {
            return false;
        }
        let fences = self.lock();
        fences.keys.get(key).map_or(true, |&latest| version >= latest)
            && fences.classes.get(class).map_or(true, |&latest| version > latest)
    }

    fn next(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Fences> {
        self.fences.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let mut fences = self.lock();
        // Re-check under the lock; an operation may have started meanwhile
        if self.active.load(Ordering::SeqCst) == 0 {
            fences.keys.clear();
            fences.classes.clear();
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        let fences = self.lock();
        fences.keys.len() + fences.classes.len()
    }
}

/// Keeps fences alive while an operation is in flight
pub struct FenceGuard<'a> {
    fence: &'a WriteFence,
}

impl Drop for FenceGuard<'_> {
    fn drop(&mut self) {
        self.fence.finish();
    }
}

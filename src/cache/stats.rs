//! Counters and rolling latency samples

use crate::cache::types::{LatencySample, Operation, RemovalReason, StatsSnapshot, Tier};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Lock-free counters plus a bounded window of recent latencies
pub struct StatsTracker {
    hits: AtomicU64,
    misses: AtomicU64,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
    promotions: AtomicU64,
    expirations: AtomicU64,
    rejections: AtomicU64,
    io_failures: AtomicU64,
    sample_capacity: usize,
    samples: Mutex<VecDeque<LatencySample>>,
}

impl StatsTracker {
    pub fn new(sample_capacity: usize) -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            write_backs: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            io_failures: AtomicU64::new(0),
            sample_capacity,
            samples: Mutex::new(VecDeque::with_capacity(sample_capacity)),
        }
    }

    pub fn record_hit(&self, tier: Tier) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        match tier {
            Tier::Memory => self.memory_hits.fetch_add(1, Ordering::Relaxed),
            Tier::Disk => self.disk_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_io_failure(&self) {
        self.io_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an entry leaving a tier
    ///
    /// A write-back is also a capacity eviction from memory, so it counts
    /// toward both `evictions` and `write_backs`.
    pub fn record_removal(&self, reason: &RemovalReason) {
        let counter = match reason {
            RemovalReason::Expired => &self.expirations,
            RemovalReason::Evicted => &self.evictions,
            RemovalReason::WrittenBack => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                &self.write_backs
            }
            RemovalReason::Promoted => &self.promotions,
            RemovalReason::Unreadable => &self.io_failures,
            RemovalReason::Explicit
            | RemovalReason::Superseded
            | RemovalReason::ClassInvalidated { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Append a latency sample, discarding the oldest once full
    pub async fn record_latency(
        &self,
        operation: Operation,
        tier: Option<Tier>,
        duration: Duration,
    ) {
        if self.sample_capacity == 0 {
            return;
        }
        let mut samples = self.samples.lock().await;
        if samples.len() == self.sample_capacity {
            samples.pop_front();
        }
        samples.push_back(LatencySample {
            operation,
            tier,
            duration,
        });
    }

    /// Counter values and latency window; residency fields are left at zero
    pub async fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            io_failures: self.io_failures.load(Ordering::Relaxed),
            recent_latencies: self.samples.lock().await.iter().cloned().collect(),
            ..Default::default()
        }
    }
}

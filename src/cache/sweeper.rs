//! Background expiry sweeper
//!
//! Scans both tiers in bounded batches and removes expired entries one lock
//! acquisition at a time, yielding between removals so foreground calls are
//! never stalled behind a whole pass. The disk index is written once per
//! batch.

use crate::cache::disk::DiskTier;
use crate::cache::memory::MemoryTier;
use crate::cache::stats::StatsTracker;
use crate::cache::types::{CacheKey, RemovalReason};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Result of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub memory_expired: usize,
    pub disk_expired: usize,
    pub elapsed: Duration,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.memory_expired + self.disk_expired
    }
}

/// Periodic reaper of expired entries in both tiers
#[derive(Clone)]
pub struct ExpirySweeper {
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    stats: Arc<StatsTracker>,
    interval: Duration,
    batch_size: usize,
}

impl ExpirySweeper {
    pub fn new(
        memory: Arc<MemoryTier>,
        disk: Arc<DiskTier>,
        stats: Arc<StatsTracker>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            memory,
            disk,
            stats,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    /// Run one full pass over both tiers
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_until(None).await
    }

    /// Start the periodic task; the first pass runs one interval after start
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!("Starting expiry sweeper (interval: {:?})", self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.sweep_until(Some(&stop)).await;
                        if report.total() > 0 {
                            debug!(
                                "Sweeper removed {} memory and {} disk entries in {:?}",
                                report.memory_expired, report.disk_expired, report.elapsed
                            );
                        }
                    }
                    changed = stop.changed() => {
                        // A dropped handle counts as a stop request
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Expiry sweeper stopped");
        });

        SweeperHandle { shutdown, task }
    }

    async fn sweep_until(&self, stop: Option<&watch::Receiver<bool>>) -> SweepReport {
        let started = Instant::now();
        let stopping = || stop.is_some_and(|rx| *rx.borrow());
        let mut report = SweepReport::default();

        let mut cursor = Some(0);
        while let Some(from) = cursor {
            if stopping() {
                break;
            }
            let (expired, next) = self
                .memory
                .scan_expired(from, self.batch_size, Utc::now())
                .await;
            for key in expired {
                if self.memory.remove_if_expired(&key, Utc::now()).await.is_some() {
                    self.record_expired(&key, "memory");
                    report.memory_expired += 1;
                }
                tokio::task::yield_now().await;
            }
            cursor = next;
        }

        let mut cursor: Option<CacheKey> = None;
        loop {
            if stopping() {
                break;
            }
            let (expired, next) = self
                .disk
                .scan_expired(cursor.as_deref(), self.batch_size, Utc::now())
                .await;
            for record in self.disk.remove_expired_batch(&expired, Utc::now()).await {
                self.record_expired(&record.key, "disk");
                report.disk_expired += 1;
            }
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        report.elapsed = started.elapsed();
        report
    }

    fn record_expired(&self, key: &str, tier: &str) {
        debug!("Sweeper removed {} from {}", key, tier);
        self.stats.record_removal(&RemovalReason::Expired);
    }
}

/// Owner of a running sweeper task
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the task and wait for it to finish its current removal
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!("Expiry sweeper panicked: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

//! Configuration for the cache system

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the tiered cache
///
/// The access thresholds and the direct-to-disk fraction are tunable
/// defaults, not derived constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the disk tier's index and blobs
    pub data_dir: PathBuf,

    /// Memory tier capacity (sum of payload sizes)
    pub memory_capacity_bytes: usize,

    /// Disk tier capacity; advisory, enforced by dropping cold disk entries
    pub disk_capacity_bytes: u64,

    /// Memory evictions with `access_count` above this are written to disk
    pub write_back_threshold: u64,

    /// Disk entries with `access_count` above this move to memory
    pub promotion_threshold: u64,

    /// Values larger than this bypass memory; `None` means 10% of memory capacity
    pub direct_to_disk_bytes: Option<usize>,

    /// TTL applied when `set` gets none; `None` never expires
    pub default_ttl: Option<Duration>,

    /// Run the background expiry sweeper
    pub enable_sweeper: bool,

    /// Interval between sweeper passes
    pub sweeper_interval: Duration,

    /// Entries examined per sweeper lock acquisition while scanning
    pub sweep_batch_size: usize,

    /// Number of latency samples retained for stats
    pub latency_sample_capacity: usize,

    /// Delete unreferenced blob files when opening
    pub purge_orphans_on_open: bool,

    /// Write hot memory entries back to disk on close
    pub persist_hot_on_close: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/cache"),
            // 100 MB
            memory_capacity_bytes: 100 * 1024 * 1024,
            // 1 GB
            disk_capacity_bytes: 1024 * 1024 * 1024,
            write_back_threshold: 3,
            promotion_threshold: 5,
            direct_to_disk_bytes: None,
            default_ttl: None,
            enable_sweeper: true,
            // Sweep every 5 minutes
            sweeper_interval: Duration::from_secs(300),
            sweep_batch_size: 64,
            latency_sample_capacity: 128,
            purge_orphans_on_open: false,
            persist_hot_on_close: true,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.memory_capacity_bytes == 0 {
            return Err(CacheError::Config(
                "memory_capacity_bytes must be greater than 0".to_string(),
            ));
        }

        if self.disk_capacity_bytes == 0 {
            return Err(CacheError::Config(
                "disk_capacity_bytes must be greater than 0".to_string(),
            ));
        }

        if self.sweeper_interval.is_zero() {
            return Err(CacheError::Config(
                "sweeper_interval must be non-zero".to_string(),
            ));
        }

        if self.sweep_batch_size == 0 {
            return Err(CacheError::Config(
                "sweep_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err(CacheError::Config("data_dir must be set".to_string()));
        }

        Ok(())
    }

    /// Largest value admitted to the memory tier
    ///
    /// Never larger than the memory capacity itself, so a single admitted
    /// entry always fits.
    pub fn memory_admission_limit(&self) -> usize {
        self.direct_to_disk_bytes
            .unwrap_or(self.memory_capacity_bytes / 10)
            .min(self.memory_capacity_bytes)
    }

    /// Load configuration from `LEXCACHE_*` environment variables
    ///
    /// A `.env` file in the working directory is read first. Unset variables
    /// keep their defaults; unparseable ones are a configuration error.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Some(dir) = env_string("LEXCACHE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse("LEXCACHE_MEMORY_CAPACITY_BYTES")? {
            config.memory_capacity_bytes = v;
        }
        if let Some(v) = env_parse("LEXCACHE_DISK_CAPACITY_BYTES")? {
            config.disk_capacity_bytes = v;
        }
        if let Some(v) = env_parse("LEXCACHE_WRITE_BACK_THRESHOLD")? {
            config.write_back_threshold = v;
        }
        if let Some(v) = env_parse("LEXCACHE_PROMOTION_THRESHOLD")? {
            config.promotion_threshold = v;
        }
        if let Some(v) = env_parse("LEXCACHE_DIRECT_TO_DISK_BYTES")? {
            config.direct_to_disk_bytes = Some(v);
        }
        if let Some(secs) = env_parse::<u64>("LEXCACHE_DEFAULT_TTL_SECS")? {
            config.default_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(v) = env_parse("LEXCACHE_ENABLE_SWEEPER")? {
            config.enable_sweeper = v;
        }
        if let Some(secs) = env_parse("LEXCACHE_SWEEPER_INTERVAL_SECS")? {
            config.sweeper_interval = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse("LEXCACHE_SWEEP_BATCH_SIZE")? {
            config.sweep_batch_size = v;
        }
        if let Some(v) = env_parse("LEXCACHE_LATENCY_SAMPLES")? {
            config.latency_sample_capacity = v;
        }
        if let Some(v) = env_parse("LEXCACHE_PURGE_ORPHANS_ON_OPEN")? {
            config.purge_orphans_on_open = v;
        }
        if let Some(v) = env_parse("LEXCACHE_PERSIST_HOT_ON_CLOSE")? {
            config.persist_hot_on_close = v;
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("{}={:?}: {}", name, raw, e))),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    data_dir: Option<PathBuf>,
    memory_capacity_bytes: Option<usize>,
    disk_capacity_bytes: Option<u64>,
    write_back_threshold: Option<u64>,
    promotion_threshold: Option<u64>,
    direct_to_disk_bytes: Option<usize>,
    default_ttl: Option<Duration>,
    enable_sweeper: Option<bool>,
    sweeper_interval: Option<Duration>,
    sweep_batch_size: Option<usize>,
    latency_sample_capacity: Option<usize>,
    purge_orphans_on_open: Option<bool>,
    persist_hot_on_close: Option<bool>,
}

impl CacheConfigBuilder {
    /// Set the disk tier directory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set memory tier capacity in bytes
    pub fn memory_capacity_bytes(mut self, bytes: usize) -> Self {
        self.memory_capacity_bytes = Some(bytes);
        self
    }

    /// Set advisory disk tier capacity in bytes
    pub fn disk_capacity_bytes(mut self, bytes: u64) -> Self {
        self.disk_capacity_bytes = Some(bytes);
        self
    }

    pub fn write_back_threshold(mut self, threshold: u64) -> Self {
        self.write_back_threshold = Some(threshold);
        self
    }

    pub fn promotion_threshold(mut self, threshold: u64) -> Self {
        self.promotion_threshold = Some(threshold);
        self
    }

    /// Values above this size go straight to disk
    pub fn direct_to_disk_bytes(mut self, bytes: usize) -> Self {
        self.direct_to_disk_bytes = Some(bytes);
        self
    }

    /// TTL applied when `set` is called without one
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Enable or disable the background sweeper
    pub fn enable_sweeper(mut self, enable: bool) -> Self {
        self.enable_sweeper = Some(enable);
        self
    }

    /// Set sweeper interval
    pub fn sweeper_interval(mut self, interval: Duration) -> Self {
        self.sweeper_interval = Some(interval);
        self
    }

    pub fn sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = Some(size);
        self
    }

    pub fn latency_sample_capacity(mut self, capacity: usize) -> Self {
        self.latency_sample_capacity = Some(capacity);
        self
    }

    pub fn purge_orphans_on_open(mut self, enable: bool) -> Self {
        self.purge_orphans_on_open = Some(enable);
        self
    }

    pub fn persist_hot_on_close(mut self, enable: bool) -> Self {
        self.persist_hot_on_close = Some(enable);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            data_dir: self.data_dir.unwrap_or(defaults.data_dir),
            memory_capacity_bytes: self
                .memory_capacity_bytes
                .unwrap_or(defaults.memory_capacity_bytes),
            disk_capacity_bytes: self
                .disk_capacity_bytes
                .unwrap_or(defaults.disk_capacity_bytes),
            write_back_threshold: self
                .write_back_threshold
                .unwrap_or(defaults.write_back_threshold),
            promotion_threshold: self
                .promotion_threshold
                .unwrap_or(defaults.promotion_threshold),
            direct_to_disk_bytes: self.direct_to_disk_bytes.or(defaults.direct_to_disk_bytes),
            default_ttl: self.default_ttl.or(defaults.default_ttl),
            enable_sweeper: self.enable_sweeper.unwrap_or(defaults.enable_sweeper),
            sweeper_interval: self.sweeper_interval.unwrap_or(defaults.sweeper_interval),
            sweep_batch_size: self.sweep_batch_size.unwrap_or(defaults.sweep_batch_size),
            latency_sample_capacity: self
                .latency_sample_capacity
                .unwrap_or(defaults.latency_sample_capacity),
            purge_orphans_on_open: self
                .purge_orphans_on_open
                .unwrap_or(defaults.purge_orphans_on_open),
            persist_hot_on_close: self
                .persist_hot_on_close
                .unwrap_or(defaults.persist_hot_on_close),
        }
    }
}

/// Preset configurations for common deployments
impl CacheConfig {
    /// Memory-constrained environments (tests, small workers)
    pub fn small(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            memory_capacity_bytes: 10 * 1024 * 1024, // 10 MB
            disk_capacity_bytes: 100 * 1024 * 1024,  // 100 MB
            ..Default::default()
        }
    }

    /// Large deployments caching many AI responses and parsed documents
    pub fn large(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            memory_capacity_bytes: 1024 * 1024 * 1024,   // 1 GB
            disk_capacity_bytes: 20 * 1024 * 1024 * 1024, // 20 GB
            ..Default::default()
        }
    }
}

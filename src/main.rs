use std::io::Write;
use std::path::PathBuf;
use clap::{Parser, Subcommand};
use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lexcache::{CacheConfig, CacheCoordinator};

#[derive(Parser)]
#[command(name = "lexcache")]
#[command(about = "Inspect and maintain a tiered cache directory", long_about = None)]
struct Cli {
    /// Cache data directory (defaults to LEXCACHE_DATA_DIR or ./data/cache)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show disk tier statistics
    Stats,

    /// List disk-resident entries
    List {
        /// Only entries tagged with this class
        #[arg(short, long)]
        class: Option<String>,

        /// Maximum entries to print
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Print a cached value
    Get {
        key: String,

        /// Write the raw bytes to stdout
        #[arg(long)]
        raw: bool,
    },

    /// Delete a key
    Delete {
        key: String,
    },

    /// Remove expired entries now
    Sweep,

    /// Delete blob files no index record references
    PurgeOrphans,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "lexcache=info".into())
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = CacheConfig::from_env().context("invalid LEXCACHE_* configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    // One-shot commands: no background work, and promoted entries go back to disk
    config.enable_sweeper = false;
    config.persist_hot_on_close = true;

    let cache = CacheCoordinator::open(config)
        .await
        .context("failed to open cache")?;

    match cli.command {
        Commands::Stats => {
            let stats = cache.stats().await;
            let records = cache.disk().records().await;
            let expired = records
                .iter()
                .filter(|r| r.metadata.is_expired_at(chrono::Utc::now()))
                .count();

            println!("Cache Statistics ({:?}):", cache.config().data_dir);
            println!("  Disk entries:  {}", stats.disk_entries);
            println!(
                "  Disk bytes:    {} / {}",
                stats.disk_bytes,
                cache.disk().capacity_bytes()
            );
            println!("  Expired:       {}", expired);

            let mut classes = std::collections::BTreeMap::new();
            for record in &records {
                *classes.entry(record.metadata.class.as_str()).or_insert(0usize) += 1;
            }
            for (class, count) in classes {
                println!("  [{}] {}", class, count);
            }
        }

        Commands::List { class, limit } => {
            let records = cache.disk().records().await;
            let matching: Vec<_> = records
                .iter()
                .filter(|r| class.as_deref().map_or(true, |c| r.metadata.class == c))
                .collect();

            if matching.is_empty() {
                println!("No entries found.");
                return close(cache).await;
            }

            for record in matching.iter().take(limit) {
                let expires = record
                    .metadata
                    .expires_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}  [{}] {} bytes, {} reads, expires {}",
                    record.key,
                    record.metadata.class,
                    record.metadata.size_bytes,
                    record.metadata.access_count,
                    expires
                );
            }
            if matching.len() > limit {
                println!("... {} more", matching.len() - limit);
            }
        }

        Commands::Get { key, raw } => {
            match cache.get(&key).await {
                Some(value) if raw => {
                    std::io::stdout().write_all(&value)?;
                }
                Some(value) => {
                    println!("{}", String::from_utf8_lossy(&value));
                }
                None => {
                    eprintln!("Not cached: {}", key);
                }
            }
        }

        Commands::Delete { key } => {
            let existed = cache.contains(&key).await;
            cache.delete(&key).await;
            if existed {
                println!("Deleted {}", key);
            } else {
                println!("Not cached: {}", key);
            }
        }

        Commands::Sweep => {
            let report = cache.sweep_now().await;
            println!(
                "Removed {} expired entries in {:?}",
                report.total(),
                report.elapsed
            );
        }

        Commands::PurgeOrphans => {
            let purged = cache.purge_orphans().await?;
            println!("Purged {} orphaned blobs", purged);
        }
    }

    close(cache).await
}

async fn close(cache: CacheCoordinator) -> Result<()> {
    cache.close().await;
    Ok(())
}

//! netcache CLI - Cache directory maintenance
//!
//! This binary opens a cache directory with the storage engine and runs a
//! single command against it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netcache_common::{StorageConfig, StorageMode};
use netcache_storage::{Storage, TraverseFlags};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "netcache-cli")]
#[command(about = "netcache storage maintenance CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/netcache/netcache.toml")]
    config: String,

    /// Cache directory
    #[arg(short, long, env = "NETCACHE_PATH")]
    path: Option<String>,

    /// Capacity in bytes
    #[arg(long)]
    capacity: Option<u64>,

    /// Disable delayed writes, read timeouts and eviction
    #[arg(long)]
    deterministic: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show size, capacity and queue state
    Stats,
    /// List stored records
    List {
        /// Only records of this type
        #[arg(long = "type")]
        record_type: Option<String>,
        /// Only records of this partition
        #[arg(long)]
        partition: Option<String>,
        /// Compute eviction worth and body share counts
        #[arg(long)]
        details: bool,
    },
    /// Retrieve a record
    Get {
        #[command(flatten)]
        key: KeyArgs,
        /// Write the body to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Store a record with the contents of a file as body
    Put {
        #[command(flatten)]
        key: KeyArgs,
        /// Body file
        file: PathBuf,
        /// Header bytes, stored verbatim
        #[arg(long, default_value = "")]
        header: String,
    },
    /// Remove a record
    Remove {
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Delete records
    Clear {
        /// Only records of this type
        #[arg(long = "type")]
        record_type: Option<String>,
        /// Only records modified within this many seconds
        #[arg(long)]
        since_secs: Option<u64>,
    },
    /// Evict records until the cache fits its capacity
    Shrink {
        /// Give up after this many sweeps
        #[arg(long, default_value = "20")]
        max_rounds: u32,
    },
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    /// Record type
    #[arg(long = "type", default_value = "Resource")]
    record_type: String,
    /// Partition
    #[arg(long, default_value = "")]
    partition: String,
    /// Record identifier
    identifier: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct CacheConfig {
    #[serde(default = "default_cache_path")]
    path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_cache_path() -> String {
    "./netcache-data".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {}", e);
            Config::default()
        })
    } else {
        Config::default()
    };

    // CLI takes precedence
    let path = args.path.unwrap_or(config.cache.path);
    let mut storage_config = config.storage;
    if let Some(capacity) = args.capacity {
        storage_config.capacity = capacity;
    }
    if args.deterministic {
        storage_config.mode = StorageMode::AvoidRandomness;
    }
    let log_level = if args.log_level != "warn" {
        args.log_level
    } else {
        config.logging.level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!("Config file: {}", args.config);
    info!("Opening cache at {}", path);
    let storage = Storage::open_with_config(&path, storage_config)
        .await
        .with_context(|| format!("failed to open cache at {path}"))?;
    // Filters and sizes are only meaningful after the first synchronize.
    storage.synchronize().await;

    match args.command {
        Commands::Stats => stats(&storage, args.json).await,
        Commands::List {
            record_type,
            partition,
            details,
        } => list(&storage, record_type, partition, details, args.json).await,
        Commands::Get { key, output } => get(&storage, &key, output, args.json).await?,
        Commands::Put { key, file, header } => {
            let body = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let key = storage.make_key(key.partition, key.record_type, key.identifier)?;
            let record = storage.make_record(key.clone(), header.into_bytes(), body);
            let body_size = record.body.len();
            storage.store(record);
            storage.flush().await;
            println!("Stored {} ({} bytes)", key, body_size);
        }
        Commands::Remove { key } => {
            let key = storage.make_key(key.partition, key.record_type, key.identifier)?;
            storage.remove(&key).await;
            println!("Removed {}", key);
        }
        Commands::Clear {
            record_type,
            since_secs,
        } => {
            let since = since_secs
                .map(|secs| SystemTime::now() - Duration::from_secs(secs));
            storage.clear(record_type.as_deref(), since).await;
            println!("Cleared");
        }
        Commands::Shrink { max_rounds } => shrink(&storage, max_rounds).await,
    }

    Ok(())
}

async fn stats(storage: &Storage, json: bool) {
    let stats = storage.stats().await;
    if json {
        let value = serde_json::json!({
            "path": storage.version_path().display().to_string(),
            "capacity": stats.capacity,
            "approximate_size": stats.approximate_size,
            "records_size": stats.records_size,
            "blobs_size": stats.blobs_size,
        });
        println!("{value}");
        return;
    }

    println!("Cache Stats");
    println!("===========");
    println!("Path:             {}", storage.version_path().display());
    println!("Capacity:         {}", stats.capacity);
    println!("Approximate size: {}", stats.approximate_size);
    println!("Records size:     {}", stats.records_size);
    println!("Blobs size:       {}", stats.blobs_size);
}

async fn list(
    storage: &Storage,
    record_type: Option<String>,
    partition: Option<String>,
    details: bool,
    json: bool,
) {
    let flags = if details {
        TraverseFlags::COMPUTE_WORTH | TraverseFlags::SHARE_COUNT
    } else {
        TraverseFlags::empty()
    };

    let mut count = 0usize;
    if !json {
        println!(
            "{:<20} {:<12} {:>10} {:>6} {:>6}  IDENTIFIER",
            "PARTITION", "TYPE", "BODY", "WORTH", "SHARE"
        );
        println!("{}", "-".repeat(80));
    }
    storage
        .traverse(
            record_type.as_deref(),
            partition.as_deref(),
            flags,
            |entry| {
                let Some((record, info)) = entry else {
                    return;
                };
                count += 1;
                let key = &record.key;
                if json {
                    let value = serde_json::json!({
                        "partition": key.partition(),
                        "type": key.record_type(),
                        "identifier": key.identifier(),
                        "hash": key.hash_as_string(),
                        "header_size": record.header.len(),
                        "body_size": info.body_size,
                        "body_hash": info.body_hash,
                        "worth": details.then_some(info.worth),
                        "share_count": details.then_some(info.body_share_count),
                    });
                    println!("{value}");
                } else {
                    println!(
                        "{:<20} {:<12} {:>10} {:>6.2} {:>6}  {}",
                        key.partition(),
                        key.record_type(),
                        info.body_size,
                        info.worth,
                        info.body_share_count,
                        key.identifier()
                    );
                }
            },
        )
        .await;
    if !json {
        println!();
        println!("{count} records");
    }
}

async fn get(
    storage: &Storage,
    key: &KeyArgs,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let key = storage.make_key(&key.partition, &key.record_type, &key.identifier)?;
    let retrieved = storage.retrieve(&key, 0).await;
    let Some(record) = retrieved.record else {
        anyhow::bail!("{} not found", key);
    };

    if let Some(output) = &output {
        std::fs::write(output, &record.body)
            .with_context(|| format!("failed to write {}", output.display()))?;
    }

    if json {
        let value = serde_json::json!({
            "hash": key.hash_as_string(),
            "header_size": record.header.len(),
            "body_size": record.body.len(),
            "body_hash": record.body_hash.to_hex(),
        });
        println!("{value}");
    } else {
        println!("Record:      {}", key);
        println!("Hash:        {}", key.hash_as_string());
        println!("Header size: {}", record.header.len());
        println!("Body size:   {}", record.body.len());
        println!("Body hash:   {}", record.body_hash);
        if let Some(output) = output {
            println!("Body written to {}", output.display());
        }
    }
    Ok(())
}

async fn shrink(storage: &Storage, max_rounds: u32) {
    let before = storage.approximate_size().await;
    let capacity = storage.capacity().await;
    let mut rounds = 0;
    while rounds < max_rounds && storage.approximate_size().await > capacity {
        storage.shrink().await;
        rounds += 1;
    }
    let after = storage.approximate_size().await;
    println!("Shrunk from {before} to {after} bytes in {rounds} rounds (capacity {capacity})");
}

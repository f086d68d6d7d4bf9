//! Cascade Node - cache daemon for one overlay node
//!
//! Serves the cache wire protocol over TCP. Rank 0 is the overlay root
//! and may carry a backing store and mmap regions; every other rank
//! points at its parent.

mod client;
mod server;
mod store;

use anyhow::{Context, Result, bail};
use cascade_cache::{CacheConfig, CacheService};
use cascade_common::HashAlgorithm;
use clap::Parser;
use client::ParentClient;
use server::NodeServer;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use store::FsStore;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cascade-node")]
#[command(about = "Cascade content cache node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cascade/node.toml")]
    config: String,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Overlay rank (0 is the root)
    #[arg(short, long)]
    rank: Option<u32>,

    /// Parent node address (required for rank > 0)
    #[arg(long)]
    parent: Option<String>,

    /// Directory for the file-backed backing store (rank 0 only)
    #[arg(long)]
    backing_dir: Option<String>,

    /// Purge target size in bytes
    #[arg(long)]
    purge_target_size: Option<u64>,

    /// Purge entry age threshold in seconds
    #[arg(long)]
    purge_old_entry: Option<u64>,

    /// Concurrent backing store window
    #[arg(long)]
    flush_batch_limit: Option<u32>,

    /// Maximum blob size in bytes
    #[arg(long)]
    blob_size_limit: Option<u64>,

    /// Hash algorithm name
    #[arg(long)]
    hash: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    node: NodeConfig,
    #[serde(default)]
    cache: CacheFileConfig,
    #[serde(default)]
    backing: BackingConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default)]
    rank: u32,
    #[serde(default)]
    parent: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            rank: 0,
            parent: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CacheFileConfig {
    #[serde(default)]
    purge_target_size: Option<u64>,
    #[serde(default)]
    purge_old_entry: Option<u64>,
    #[serde(default)]
    flush_batch_limit: Option<u32>,
    #[serde(default)]
    blob_size_limit: Option<u64>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    heartbeat_period: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BackingConfig {
    #[serde(default)]
    dir: Option<String>,
    #[serde(default = "default_backing_name")]
    name: String,
}

impl Default for BackingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            name: default_backing_name(),
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

fn default_listen() -> String {
    "0.0.0.0:9300".to_string()
}

fn default_backing_name() -> String {
    "fs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists
    let config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str)
            .with_context(|| format!("failed to parse config file {}", args.config))?
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    let listen = args.listen.unwrap_or(config.node.listen);
    let rank = args.rank.unwrap_or(config.node.rank);
    let parent = args.parent.or(config.node.parent);
    let backing_dir = args.backing_dir.or(config.backing.dir);
    let log_level = if args.log_level != "info" {
        args.log_level
    } else {
        config.logging.level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let defaults = CacheConfig::default();
    let hash_name = args
        .hash
        .or(config.cache.hash)
        .unwrap_or_else(|| defaults.hash.name().to_string());
    let hash: HashAlgorithm = hash_name.parse().map_err(|e| anyhow::anyhow!("{e}"))?;

    let cache_config = CacheConfig {
        purge_target_size: args
            .purge_target_size
            .or(config.cache.purge_target_size)
            .unwrap_or(defaults.purge_target_size),
        purge_old_entry: args
            .purge_old_entry
            .or(config.cache.purge_old_entry)
            .map_or(defaults.purge_old_entry, Duration::from_secs),
        flush_batch_limit: args
            .flush_batch_limit
            .or(config.cache.flush_batch_limit)
            .unwrap_or(defaults.flush_batch_limit),
        blob_size_limit: args
            .blob_size_limit
            .or(config.cache.blob_size_limit)
            .unwrap_or(defaults.blob_size_limit),
        hash,
        heartbeat_period: config
            .cache
            .heartbeat_period
            .map_or(defaults.heartbeat_period, Duration::from_secs),
        backing_name: backing_dir.is_some().then(|| config.backing.name.clone()),
    };
    // Frames must fit the largest storable blob plus envelope slack
    let max_frame = cache_config.blob_size_limit as usize + 4096;

    info!("Starting Cascade node");
    info!("Rank: {rank}");
    info!("Hash: {hash}");

    let upstream: Option<Arc<dyn cascade_cache::BlobPeer>> = match (&parent, rank) {
        (None, 0) => None,
        (Some(addr), r) if r > 0 => {
            info!("Parent: {addr}");
            Some(Arc::new(ParentClient::new(addr.clone(), max_frame)))
        }
        (Some(_), 0) => bail!("rank 0 is the root and takes no --parent"),
        (None, _) => bail!("rank > 0 requires --parent"),
        (Some(_), _) => unreachable!("covered by the r > 0 guard above"),
    };

    let handle = CacheService::spawn(cache_config, rank, upstream);

    // A configured backing store registers itself at startup, the same
    // way a backing service would announce itself over the wire.
    let backing = match backing_dir {
        Some(dir) if rank == 0 => {
            let store = Arc::new(FsStore::open(&dir, hash)?);
            let store_clone: Arc<FsStore> = Arc::clone(&store);
            let peer: Arc<dyn cascade_cache::BlobPeer> = store_clone;
            handle
                .register_backing(&config.backing.name, peer)
                .await
                .map_err(|e| anyhow::anyhow!("register backing store: {e}"))?;
            info!("Backing store: {dir}");
            Some(store)
        }
        Some(_) => {
            warn!("--backing-dir ignored on non-root rank");
            None
        }
        None => None,
    };

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!("Listening on {listen}");

    let server = NodeServer::new(handle, backing, max_frame);
    tokio::select! {
        result = server.serve(listener) => {
            result.map_err(|e| anyhow::anyhow!("server error: {e}"))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

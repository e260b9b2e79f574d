//! tagcache admin CLI
//!
//! Inspect and maintain a configured cache from the shell.
//!
//! ```text
//! tagcache --config cache.yaml set user:1 '{"name":"Ann"}' --ttl 60 --tag users
//! tagcache --config cache.yaml tag users
//! tagcache --config cache.yaml remove-tag users
//! ```
//!
//! Values are read and printed as JSON. With the native serializer, values
//! that are not plain JSON print as hex.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tagcache::{Cache, CacheConfig, CacheManager, ManagerConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tagcache - backend-agnostic tagged cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache configuration file (single cache or `caches:` registry)
    #[arg(long, short, env = "TAGCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache name when the configuration is a registry
    #[arg(long, env = "TAGCACHE_NAME")]
    cache: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the value stored under a key
    Get { key: String },

    /// Store a JSON value
    Set {
        key: String,
        /// JSON value
        value: String,
        /// Seconds to live, 0 = never expire
        #[arg(long, default_value = "0")]
        ttl: u64,
        /// Tag to attach (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Delete a key
    Remove { key: String },

    /// Delete every key carrying a tag
    RemoveTag { tag: String },

    /// List keys carrying a tag
    Tag { tag: String },

    /// List every key in the cache namespace
    Keys,

    /// Wipe the cache namespace
    Flush,

    /// Print backend status
    Status,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let (manager, cache) = match open(&args).await {
        Ok(opened) => opened,
        Err(e) => {
            error!("Failed to open cache: {:#}", e);
            return Err(e);
        }
    };

    let outcome = run(&cache, args.command).await;

    if let Err(e) = manager.shutdown().await {
        error!("Failed to shut down cleanly: {}", e);
    }
    outcome
}

async fn open(args: &Args) -> anyhow::Result<(CacheManager, std::sync::Arc<Cache>)> {
    let manager = match &args.config {
        None => {
            info!("No configuration given, using an in-memory cache");
            let manager = CacheManager::new();
            manager.register("default", Cache::from_config(&CacheConfig::default()).await?);
            manager
        }
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let registry: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            if registry.get("caches").is_some() {
                CacheManager::from_config(&ManagerConfig::from_yaml_str(&text)?).await?
            } else {
                let manager = CacheManager::new();
                let cache = Cache::from_config(&CacheConfig::from_yaml_str(&text)?).await?;
                manager.register("default", cache);
                manager
            }
        }
    };

    let cache = match &args.cache {
        Some(name) => manager.cache(name),
        None => manager.default_cache(),
    };
    let Some(cache) = cache else {
        bail!(
            "no cache selected; available: {}",
            manager.names().join(", ")
        );
    };
    Ok((manager, cache))
}

async fn run(cache: &Cache, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Get { key } => match cache.get::<serde_json::Value>(&key).await {
            Ok(Some(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
            Ok(None) => bail!("miss: {}", key),
            Err(tagcache::Error::Serialization { .. }) => match cache.get_raw(&key).await? {
                Some(bytes) => println!("{}", hex::encode(bytes)),
                None => bail!("miss: {}", key),
            },
            Err(e) => return Err(e.into()),
        },
        Command::Set {
            key,
            value,
            ttl,
            tags,
        } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).context("value must be JSON")?;
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            if !cache.set(&key, &value, ttl, &tags).await? {
                bail!("write of '{}' was not stored", key);
            }
        }
        Command::Remove { key } => {
            if !cache.remove(&key).await? {
                bail!("miss: {}", key);
            }
        }
        Command::RemoveTag { tag } => {
            if !cache.remove_tag(&tag).await? {
                bail!("no such tag: {}", tag);
            }
        }
        Command::Tag { tag } => match cache.get_tag(&tag).await? {
            Some(keys) => {
                for key in keys {
                    println!("{}", key);
                }
            }
            None => bail!("no such tag: {}", tag),
        },
        Command::Keys => {
            for key in cache.get_all_keys().await? {
                println!("{}", key);
            }
        }
        Command::Flush => {
            cache.flush().await?;
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&cache.status().await?)?);
        }
    }
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // logs go to stderr so command output stays pipeable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

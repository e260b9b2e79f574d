//! Cache configuration
//!
//! Loaded from YAML. A single cache:
//!
//! ```yaml
//! prefix: "app:"
//! key_hash: md5
//! tag_hash: none
//! serializer: json
//! lock_enabled: true
//! lock:
//!   max_iterations: 15
//!   retry_interval_ms: 1
//!   lock_ttl_secs: 5
//! backend:
//!   type: redis
//!   urls: ["redis://127.0.0.1:6379"]
//!   database: 0
//! ```
//!
//! A registry wraps several of these under `caches:` with a `default:` name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{CacheBackend, FileBackend, MemoryBackend, NullBackend};
use crate::codec::{Codec, CodecKind};
use crate::error::{Error, Result};
use crate::keys::{HashAlgorithm, KeyNormalizer, LOCK_NAMESPACE, TAG_NAMESPACE};
use crate::lock::RetryPolicy;

// =============================================================================
// Backend selection
// =============================================================================

fn default_shards() -> u32 {
    crate::backend::DEFAULT_SHARDS
}

fn default_collection() -> String {
    "cache".to_string()
}

/// Physical store and its connection parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process shared memory
    #[default]
    Memory,
    /// Redis; URLs are tried in order until one connects
    Redis {
        urls: Vec<String>,
        #[serde(default)]
        database: i64,
        #[serde(default)]
        password: Option<String>,
    },
    /// Memcached server pool
    Memcached { servers: Vec<String> },
    /// MongoDB collection used as a cache
    Mongodb {
        uri: String,
        database: String,
        #[serde(default = "default_collection")]
        collection: String,
    },
    /// One file per entry under `root`
    File {
        root: PathBuf,
        #[serde(default = "default_shards")]
        shards: u32,
    },
    /// Stores nothing
    Null,
}

impl BackendConfig {
    /// Short backend name
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Memory => "memory",
            BackendConfig::Redis { .. } => "redis",
            BackendConfig::Memcached { .. } => "memcached",
            BackendConfig::Mongodb { .. } => "mongodb",
            BackendConfig::File { .. } => "file",
            BackendConfig::Null => "null",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            BackendConfig::Redis { urls, .. } if urls.is_empty() => {
                Err(Error::Config("redis backend needs at least one url".into()))
            }
            BackendConfig::Memcached { servers } if servers.is_empty() => {
                Err(Error::Config("memcached backend needs at least one server".into()))
            }
            BackendConfig::Mongodb { uri, database, collection }
                if uri.is_empty() || database.is_empty() || collection.is_empty() =>
            {
                Err(Error::Config(
                    "mongodb backend needs uri, database and collection".into(),
                ))
            }
            BackendConfig::File { shards, .. } if *shards == 0 => {
                Err(Error::Config("file backend needs at least one shard".into()))
            }
            _ => Ok(()),
        }
    }

    /// Open the configured store
    pub async fn connect(&self, codec: Codec) -> Result<Arc<dyn CacheBackend>> {
        let backend: Arc<dyn CacheBackend> = match self {
            BackendConfig::Memory => Arc::new(MemoryBackend::new()),
            BackendConfig::Null => Arc::new(NullBackend::new()),
            BackendConfig::File { root, shards } => {
                Arc::new(FileBackend::new(root.clone(), *shards, codec))
            }
            #[cfg(feature = "redis")]
            BackendConfig::Redis {
                urls,
                database,
                password,
            } => Arc::new(
                crate::backend::RedisBackend::connect(urls, *database, password.clone()).await?,
            ),
            #[cfg(feature = "memcached")]
            BackendConfig::Memcached { servers } => {
                Arc::new(crate::backend::MemcachedBackend::connect(servers).await?)
            }
            #[cfg(feature = "mongodb")]
            BackendConfig::Mongodb {
                uri,
                database,
                collection,
            } => Arc::new(crate::backend::MongoBackend::connect(uri, database, collection).await?),
            #[allow(unreachable_patterns)]
            other => {
                return Err(Error::Config(format!(
                    "built without support for the {} backend",
                    other.kind()
                )))
            }
        };
        info!(backend = backend.name(), "Cache backend ready");
        Ok(backend)
    }
}

// =============================================================================
// Cache configuration
// =============================================================================

/// Configuration of one cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Literal prefix in front of every physical key
    pub prefix: String,
    /// Hash applied to entry names
    pub key_hash: HashAlgorithm,
    /// Hash applied to tag names
    pub tag_hash: HashAlgorithm,
    /// Value codec
    pub serializer: CodecKind,
    /// Guard writes with the advisory lock
    pub lock_enabled: bool,
    /// Lock retry policy
    pub lock: RetryPolicy,
    /// Physical store
    pub backend: BackendConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            key_hash: HashAlgorithm::None,
            tag_hash: HashAlgorithm::None,
            serializer: CodecKind::Native,
            lock_enabled: true,
            lock: RetryPolicy::default(),
            backend: BackendConfig::Memory,
        }
    }
}

impl CacheConfig {
    /// Parse and validate YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Check option consistency
    pub fn validate(&self) -> Result<()> {
        if self.prefix.starts_with(TAG_NAMESPACE) || self.prefix.starts_with(LOCK_NAMESPACE) {
            return Err(Error::Config(format!(
                "prefix '{}' starts with a reserved namespace",
                self.prefix
            )));
        }
        if self.lock.max_iterations == 0 {
            return Err(Error::Config("lock.max_iterations must be at least 1".into()));
        }
        self.backend.validate()
    }

    /// Normalizer for these options
    pub fn normalizer(&self) -> KeyNormalizer {
        KeyNormalizer::new(self.prefix.clone(), self.key_hash, self.tag_hash)
    }

    /// Codec for these options
    pub fn codec(&self) -> Codec {
        Codec::new(self.serializer)
    }
}

// =============================================================================
// Registry configuration
// =============================================================================

/// Named caches for a [`crate::CacheManager`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub caches: BTreeMap<String, CacheConfig>,
    /// Name returned by `default_cache()`; the only cache when omitted
    pub default: Option<String>,
}

impl ManagerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, cache) in &self.caches {
            cache
                .validate()
                .map_err(|e| Error::Config(format!("cache '{}': {}", name, e)))?;
        }
        if let Some(default) = &self.default {
            if !self.caches.contains_key(default) {
                return Err(Error::Config(format!(
                    "default cache '{}' is not defined",
                    default
                )));
            }
        }
        Ok(())
    }

    /// Name of the default cache
    pub fn default_name(&self) -> Option<&str> {
        match &self.default {
            Some(name) => Some(name.as_str()),
            None if self.caches.len() == 1 => self.caches.keys().next().map(String::as_str),
            None => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

//! tagcache - Backend-Agnostic Tagged Cache
//!
//! One cache contract over heterogeneous stores, with tag-based grouped
//! invalidation and stampede-safe write locking.
//!
//! # Architecture
//!
//! ```text
//! Cache (facade) → KeyNormalizer → Codec → LockManager → TagIndex → CacheBackend
//! ```
//!
//! # Backends
//!
//! - Memory - in-process shared memory (`DashMap`)
//! - File - one file per entry, stable hash sharding
//! - Null - stores nothing, fail-open composition
//! - Redis - feature `redis` (default)
//! - Memcached - feature `memcached`
//! - MongoDB - feature `mongodb`
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> tagcache::Result<()> {
//! let cache = tagcache::Cache::memory();
//! cache.set("user:1", "Ann", 0, &["users"]).await?;
//! assert_eq!(cache.get::<String>("user:1").await?.as_deref(), Some("Ann"));
//! cache.remove_tag("users").await?;
//! assert!(!cache.exists("user:1").await?);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`backend`] - The backend port and its adapters
//! - [`cache`] - The cache facade
//! - [`clock`] - Time source for self-expiring backends
//! - [`codec`] - Native and JSON value codecs
//! - [`config`] - YAML configuration
//! - [`error`] - Error types
//! - [`keys`] - Key and tag normalization
//! - [`lock`] - Stampede-prevention lock manager
//! - [`manager`] - Named cache registry
//! - [`metrics`] - Operation counters
//! - [`tags`] - Tag index

pub mod backend;
pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod tags;

// Re-export commonly used types
pub use backend::{CacheBackend, Capabilities, Expiry, FileBackend, MemoryBackend, NullBackend};
pub use cache::Cache;
pub use codec::{Codec, CodecKind};
pub use config::{BackendConfig, CacheConfig, ManagerConfig};
pub use error::{Error, Result};
pub use keys::{HashAlgorithm, KeyNormalizer};
pub use lock::{LockManager, RetryPolicy};
pub use manager::CacheManager;
pub use metrics::{CacheMetrics, MetricsSnapshot};

#[cfg(feature = "memcached")]
pub use backend::MemcachedBackend;
#[cfg(feature = "mongodb")]
pub use backend::MongoBackend;
#[cfg(feature = "redis")]
pub use backend::RedisBackend;

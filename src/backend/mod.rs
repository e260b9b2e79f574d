//! Backend Adapters
//!
//! One adapter per physical store, all behind the [`CacheBackend`] port.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Cache (facade)                             │
//! │   normalizer │ codec │ lock manager │ tag index │ metrics        │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │  physical keys, raw bytes
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    CacheBackend (port)                           │
//! │  Memory │ File │ Null │ Redis │ Memcached │ MongoDB             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Adapters implement primitives only. Anything an adapter cannot do
//! natively keeps the trait default, which either composes other primitives
//! (batch reads and deletes) or reports [`Error::Unsupported`] so the facade
//! can fall back to a locked read-modify-write. [`Capabilities`] tells the
//! facade which path to take.

use std::any::Any;

use async_trait::async_trait;
use serde::Serialize;

use crate::clock::Clock;
use crate::error::{Error, Result};

mod file;
mod memory;
mod null;

#[cfg(feature = "memcached")]
mod memcached;
#[cfg(feature = "mongodb")]
mod mongo;
#[cfg(feature = "redis")]
mod redis;

pub use file::{FileBackend, FileRecord, DEFAULT_SHARDS};
pub use memory::MemoryBackend;
pub use null::NullBackend;

#[cfg(feature = "memcached")]
pub use memcached::MemcachedBackend;
#[cfg(feature = "mongodb")]
pub use mongo::MongoBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Memcached treats relative expirations above this as absolute timestamps
pub const MAX_RELATIVE_EXPIRY: u64 = 60 * 60 * 24 * 30;

/// Expiry requested for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The entry never expires
    Never,
    /// The entry expires this many seconds from now
    In(u64),
    /// Leave the entry's current expiry untouched (new entries never expire)
    Keep,
}

impl Expiry {
    /// `0` means never, anything else is relative seconds
    pub fn from_ttl(ttl_secs: u64) -> Self {
        if ttl_secs == 0 {
            Expiry::Never
        } else {
            Expiry::In(ttl_secs)
        }
    }

    /// `0` keeps the current expiry, anything else is relative seconds
    pub fn keep_or(ttl_secs: u64) -> Self {
        if ttl_secs == 0 {
            Expiry::Keep
        } else {
            Expiry::In(ttl_secs)
        }
    }

    /// Absolute unix expiry given the clock and the entry's existing
    /// absolute expiry (`0` = never)
    pub fn resolve(&self, clock: &dyn Clock, current: u64) -> u64 {
        match self {
            Expiry::Never => 0,
            Expiry::In(secs) => clock.deadline(*secs),
            Expiry::Keep => current,
        }
    }
}

/// What an adapter can do natively
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// The store evicts expired entries on its own
    pub native_expiry: bool,
    /// Atomic server-side increment
    pub native_increment: bool,
    /// Server-side set type usable for the tag index
    pub native_sets: bool,
    /// The store can list its keys
    pub enumeration: bool,
}

/// Port every physical store implements.
///
/// Keys are physical keys produced by [`crate::keys::KeyNormalizer`]; values
/// are codec output. Every method must be safe to call concurrently.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Short backend name
    fn name(&self) -> &'static str;

    /// Native capabilities
    fn capabilities(&self) -> Capabilities;

    /// Read a value; expired entries are a miss
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditionally write a value
    async fn write(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool>;

    /// Write only if the key does not exist (atomic where the store allows)
    async fn create_if_absent(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool>;

    /// Check whether a live entry exists
    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.read(key).await?.is_some())
    }

    /// Change the expiry of an existing entry
    async fn touch(&self, key: &str, expiry: Expiry) -> Result<bool>;

    /// Delete an entry; deleting a missing key returns `false`
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete `key` only while it still holds `expected`.
    ///
    /// The default reads then deletes in two steps; adapters with a
    /// conditional delete override it.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        match self.read(key).await? {
            Some(value) if value == expected => self.delete(key).await,
            _ => Ok(false),
        }
    }

    /// Atomically add `delta` to a counter.
    ///
    /// Returns `None` when the key is missing and `create` is false.
    async fn increment(
        &self,
        _key: &str,
        _delta: i64,
        _expiry: Expiry,
        _create: bool,
    ) -> Result<Option<i64>> {
        Err(Error::unsupported(self.name(), "increment"))
    }

    /// Add a member to a server-side set
    async fn set_add(&self, _key: &str, _member: &str) -> Result<bool> {
        Err(Error::unsupported(self.name(), "set_add"))
    }

    /// Members of a server-side set, `None` if the set does not exist
    async fn set_members(&self, _key: &str) -> Result<Option<Vec<String>>> {
        Err(Error::unsupported(self.name(), "set_members"))
    }

    /// Every live physical key
    async fn keys(&self) -> Result<Vec<String>> {
        Err(Error::unsupported(self.name(), "keys"))
    }

    /// Remove every key starting with one of `prefixes` (all keys if empty)
    async fn flush(&self, prefixes: &[String]) -> Result<bool>;

    /// Backend-specific diagnostics
    async fn status(&self) -> Result<serde_json::Value>;

    /// Release connections; the default has nothing to release
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Read several keys, in order
    async fn read_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.read(key).await?);
        }
        Ok(out)
    }

    /// Delete several keys, returning how many existed
    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Concrete adapter for capability-checked downcasts
    fn as_any(&self) -> &dyn Any;
}

/// True when `key` falls under one of `prefixes` (or `prefixes` is empty)
pub(crate) fn matches_prefixes(key: &str, prefixes: &[String]) -> bool {
    prefixes.is_empty() || prefixes.iter().any(|p| key.starts_with(p.as_str()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_expiry_from_ttl() {
        assert_eq!(Expiry::from_ttl(0), Expiry::Never);
        assert_eq!(Expiry::from_ttl(30), Expiry::In(30));
        assert_eq!(Expiry::keep_or(0), Expiry::Keep);
        assert_eq!(Expiry::keep_or(5), Expiry::In(5));
    }

    #[test]
    fn test_expiry_resolve() {
        let clock = ManualClock::new(100);
        assert_eq!(Expiry::Never.resolve(&clock, 150), 0);
        assert_eq!(Expiry::In(10).resolve(&clock, 150), 110);
        assert_eq!(Expiry::Keep.resolve(&clock, 150), 150);
        assert_eq!(Expiry::Keep.resolve(&clock, 0), 0);
    }

    #[test]
    fn test_matches_prefixes() {
        assert!(matches_prefixes("anything", &[]));
        let prefixes = vec!["app:".to_string(), "__tag__:app:".to_string()];
        assert!(matches_prefixes("app:k", &prefixes));
        assert!(matches_prefixes("__tag__:app:t", &prefixes));
        assert!(!matches_prefixes("other:k", &prefixes));
    }
}

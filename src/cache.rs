//! Cache facade.
//!
//! The surface applications call. Composes the normalizer, codec, lock
//! manager and tag index on top of one [`CacheBackend`]:
//!
//! ```text
//!   logical key ──► KeyNormalizer ──► physical key
//!   value       ──► Codec         ──► bytes
//!                   LockManager   ──► guards the write
//!                   TagIndex      ──► records tag membership
//!                   CacheBackend  ──► performs the physical operation
//! ```
//!
//! Invalid input (empty keys, keys that land in a reserved namespace) is a
//! miss or `Ok(false)`, never an error. Operations the backend structurally
//! cannot perform surface as [`Error::Unsupported`]. Transport failures
//! propagate unchanged.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::backend::{CacheBackend, Capabilities, Expiry, MemoryBackend};
use crate::codec::{decode_counter, encode_counter, Codec};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::keys::KeyNormalizer;
use crate::lock::LockManager;
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::tags::TagIndex;

/// Uniform cache over one backend
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    normalizer: KeyNormalizer,
    codec: Codec,
    locks: Arc<LockManager>,
    tags: TagIndex,
    lock_enabled: bool,
    metrics: CacheMetrics,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("backend", &self.backend.name())
            .field("normalizer", &self.normalizer)
            .field("codec", &self.codec)
            .field("lock_enabled", &self.lock_enabled)
            .finish()
    }
}

impl Cache {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Wrap an already opened backend
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        let codec = config.codec();
        let locks = Arc::new(LockManager::new(backend.clone(), config.lock));
        let tags = TagIndex::new(backend.clone(), locks.clone(), codec, config.lock_enabled);
        Self {
            backend,
            normalizer: config.normalizer(),
            codec,
            locks,
            tags,
            lock_enabled: config.lock_enabled,
            metrics: CacheMetrics::new(),
        }
    }

    /// Validate `config`, open its backend and wrap it
    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let backend = config.backend.connect(config.codec()).await?;
        Ok(Self::new(backend, config))
    }

    /// In-process cache with default options
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), &CacheConfig::default())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Adapter-specific handle, `None` if the cache runs on another backend
    pub fn backend<B: CacheBackend>(&self) -> Option<&B> {
        self.backend.as_any().downcast_ref::<B>()
    }

    /// Shared backend handle
    pub fn backend_handle(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    pub fn normalizer(&self) -> &KeyNormalizer {
        &self.normalizer
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // =========================================================================
    // Single-key operations
    // =========================================================================

    /// Raw stored bytes for `key`
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(physical) = self.normalizer.normalize_key(key) else {
            self.metrics.record_miss();
            return Ok(None);
        };
        let bytes = self.backend.read(&physical).await?;
        if bytes.is_some() {
            self.metrics.record_hit();
        } else {
            self.metrics.record_miss();
        }
        Ok(bytes)
    }

    /// Cached value for `key`, `None` on a miss
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`. `ttl` is in seconds, `0` never expires.
    ///
    /// Returns `false` for invalid keys and when the write lock could not be
    /// taken.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: u64,
        tags: &[&str],
    ) -> Result<bool> {
        let Some(physical) = self.normalizer.normalize_key(key) else {
            return Ok(false);
        };
        let bytes = self.codec.encode(value)?;

        let written = if self.lock_enabled {
            let lock_key = self.normalizer.lock_key(&physical);
            let outcome = self
                .locks
                .with_lock(&lock_key, || self.write_entry(&physical, &bytes, ttl, tags))
                .await?;
            self.metrics.record_lock(outcome.is_some());
            outcome.unwrap_or(false)
        } else {
            self.write_entry(&physical, &bytes, ttl, tags).await?
        };

        self.metrics.record_write(written);
        debug!(key = %physical, ttl, tags = tags.len(), written, "Cache set");
        Ok(written)
    }

    async fn write_entry(&self, physical: &str, bytes: &[u8], ttl: u64, tags: &[&str]) -> Result<bool> {
        if !self.attach_tags(physical, tags).await? {
            return Ok(false);
        }
        self.backend.write(physical, bytes, Expiry::from_ttl(ttl)).await
    }

    async fn attach_tags(&self, physical: &str, tags: &[&str]) -> Result<bool> {
        for tag in tags {
            let Some(tag_key) = self.normalizer.normalize_tag(tag) else {
                continue;
            };
            if !self.tags.add_member(&tag_key, physical).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Store `value` only if `key` does not exist yet
    pub async fn add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: u64,
        tags: &[&str],
    ) -> Result<bool> {
        let Some(physical) = self.normalizer.normalize_key(key) else {
            return Ok(false);
        };
        if self.backend.contains(&physical).await? {
            return Ok(false);
        }
        let bytes = self.codec.encode(value)?;
        let created = self
            .backend
            .create_if_absent(&physical, &bytes, Expiry::from_ttl(ttl))
            .await?;
        if !created {
            self.metrics.record_write(false);
            return Ok(false);
        }
        // tags only follow a successful create so a losing add never tags the
        // winner's entry
        if !self.attach_tags(&physical, tags).await? {
            // an untagged entry would survive its tag's invalidation
            self.backend.delete(&physical).await?;
            warn!(key = %physical, "Tag index busy, rolled back add");
            self.metrics.record_write(false);
            return Ok(false);
        }
        self.metrics.record_write(true);
        Ok(true)
    }

    /// True when `key` holds a live entry
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.normalizer.normalize_key(key) {
            Some(physical) => self.backend.contains(&physical).await,
            None => Ok(false),
        }
    }

    /// Change the expiry of an existing entry without touching its value
    pub async fn touch(&self, key: &str, ttl: u64) -> Result<bool> {
        match self.normalizer.normalize_key(key) {
            Some(physical) => self.backend.touch(&physical, Expiry::from_ttl(ttl)).await,
            None => Ok(false),
        }
    }

    /// Add `offset` to the counter at `key`.
    ///
    /// A missing counter starts at `0` when `create` is set, otherwise the
    /// call returns `None`. A non-zero `ttl` resets the expiry; `0` keeps the
    /// current one.
    pub async fn increment(
        &self,
        key: &str,
        offset: i64,
        ttl: u64,
        create: bool,
    ) -> Result<Option<i64>> {
        let Some(physical) = self.normalizer.normalize_key(key) else {
            return Ok(None);
        };
        let expiry = Expiry::keep_or(ttl);

        if self.backend.capabilities().native_increment {
            return self.backend.increment(&physical, offset, expiry, create).await;
        }

        if !self.lock_enabled {
            return self.increment_composed(&physical, offset, expiry, create).await;
        }

        let lock_key = self.normalizer.lock_key(&physical);
        let outcome = self
            .locks
            .with_lock(&lock_key, || {
                self.increment_composed(&physical, offset, expiry, create)
            })
            .await?;
        self.metrics.record_lock(outcome.is_some());
        Ok(outcome.flatten())
    }

    /// Subtract `offset` from the counter at `key`
    pub async fn decrement(
        &self,
        key: &str,
        offset: i64,
        ttl: u64,
        create: bool,
    ) -> Result<Option<i64>> {
        self.increment(key, offset.saturating_neg(), ttl, create).await
    }

    async fn increment_composed(
        &self,
        physical: &str,
        offset: i64,
        expiry: Expiry,
        create: bool,
    ) -> Result<Option<i64>> {
        let current = match self.backend.read(physical).await? {
            Some(bytes) => decode_counter(&bytes).ok_or_else(|| {
                Error::backend(
                    self.backend.name(),
                    format!("value at '{}' is not a counter", physical),
                )
            })?,
            None if create => 0,
            None => return Ok(None),
        };
        let next = current.wrapping_add(offset);
        self.backend
            .write(physical, &encode_counter(next), expiry)
            .await?;
        Ok(Some(next))
    }

    /// Delete `key`; `false` if it did not exist
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let Some(physical) = self.normalizer.normalize_key(key) else {
            return Ok(false);
        };
        let removed = self.backend.delete(&physical).await?;
        if removed {
            self.metrics.record_deletes(1);
        }
        Ok(removed)
    }

    // =========================================================================
    // Batch operations
    // =========================================================================

    /// Delete several keys, returning how many existed
    pub async fn remove_multi(&self, keys: &[&str]) -> Result<u64> {
        let physical: Vec<String> = keys
            .iter()
            .filter_map(|k| self.normalizer.normalize_key(k))
            .collect();
        let removed = self.backend.delete_many(&physical).await?;
        self.metrics.record_deletes(removed);
        Ok(removed)
    }

    /// Values for every key that hit, keyed by the logical key
    pub async fn get_multi<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<BTreeMap<String, T>> {
        let valid: Vec<(&str, String)> = keys
            .iter()
            .filter_map(|k| self.normalizer.normalize_key(k).map(|p| (*k, p)))
            .collect();
        let physical: Vec<String> = valid.iter().map(|(_, p)| p.clone()).collect();
        let values = self.backend.read_many(&physical).await?;

        let mut out = BTreeMap::new();
        for ((logical, _), bytes) in valid.into_iter().zip(values) {
            match bytes {
                Some(bytes) => {
                    self.metrics.record_hit();
                    out.insert(logical.to_string(), self.codec.decode(&bytes)?);
                }
                None => self.metrics.record_miss(),
            }
        }
        Ok(out)
    }

    /// Store several values with a shared ttl and tag list; `true` when every
    /// write succeeded
    pub async fn set_multi<T: Serialize>(
        &self,
        items: &[(&str, T)],
        ttl: u64,
        tags: &[&str],
    ) -> Result<bool> {
        let mut all = true;
        for (key, value) in items {
            all &= self.set(key, value, ttl, tags).await?;
        }
        Ok(all)
    }

    /// Touch several keys, returning how many existed
    pub async fn touch_multi(&self, keys: &[&str], ttl: u64) -> Result<u64> {
        let mut touched = 0;
        for key in keys {
            if self.touch(key, ttl).await? {
                touched += 1;
            }
        }
        Ok(touched)
    }

    // =========================================================================
    // Tags
    // =========================================================================

    /// Keys carrying `tag` with the prefix stripped, `None` if the tag does
    /// not exist
    pub async fn get_tag(&self, tag: &str) -> Result<Option<Vec<String>>> {
        let Some(tag_key) = self.normalizer.normalize_tag(tag) else {
            return Ok(None);
        };
        Ok(self.tags.members(&tag_key).await?.map(|members| {
            let mut keys: Vec<String> = members
                .iter()
                .map(|m| self.normalizer.strip_prefix(m).to_string())
                .collect();
            keys.sort();
            keys.dedup();
            keys
        }))
    }

    pub async fn exists_tag(&self, tag: &str) -> Result<bool> {
        match self.normalizer.normalize_tag(tag) {
            Some(tag_key) => self.tags.exists(&tag_key).await,
            None => Ok(false),
        }
    }

    /// Delete every entry carrying `tag`, then the tag itself
    pub async fn remove_tag(&self, tag: &str) -> Result<bool> {
        let Some(tag_key) = self.normalizer.normalize_tag(tag) else {
            return Ok(false);
        };
        let removed = self.tags.delete_tag(&tag_key).await?;
        if removed {
            self.metrics.record_tag_invalidation();
        }
        Ok(removed)
    }

    /// Remove several tags, returning how many existed
    pub async fn remove_multi_tags(&self, tags: &[&str]) -> Result<u64> {
        let mut removed = 0;
        for tag in tags {
            if self.remove_tag(tag).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Namespace-wide operations
    // =========================================================================

    async fn entry_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .backend
            .keys()
            .await?
            .into_iter()
            .filter(|k| self.normalizer.owns_entry(k))
            .collect())
    }

    /// Every live entry key in this cache's namespace, prefix stripped
    pub async fn get_all_keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entry_keys()
            .await?
            .iter()
            .map(|k| self.normalizer.strip_prefix(k).to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Every live entry in this cache's namespace, prefix stripped
    pub async fn get_all<T: DeserializeOwned>(&self) -> Result<BTreeMap<String, T>> {
        let physical = self.entry_keys().await?;
        let values = self.backend.read_many(&physical).await?;
        let mut out = BTreeMap::new();
        for (key, bytes) in physical.iter().zip(values) {
            if let Some(bytes) = bytes {
                out.insert(
                    self.normalizer.strip_prefix(key).to_string(),
                    self.codec.decode(&bytes)?,
                );
            }
        }
        Ok(out)
    }

    /// Wipe entries, tags and locks in this cache's namespace
    pub async fn flush(&self) -> Result<bool> {
        let prefixes = self.normalizer.namespace_prefixes();
        let flushed = self.backend.flush(&prefixes).await?;
        warn!(
            backend = self.backend.name(),
            prefix = %self.normalizer.prefix(),
            "Cache namespace flushed"
        );
        Ok(flushed)
    }

    /// Diagnostics: backend, options, metrics and backend-native status
    pub async fn status(&self) -> Result<serde_json::Value> {
        let metrics = self.metrics.snapshot();
        Ok(json!({
            "backend": self.backend.name(),
            "capabilities": self.backend.capabilities(),
            "prefix": self.normalizer.prefix(),
            "serializer": self.codec.kind().name(),
            "lock_enabled": self.lock_enabled,
            "lock_policy": self.locks.policy(),
            "locks": self.locks.stats(),
            "metrics": metrics,
            "hit_ratio": metrics.hit_ratio(),
            "native": self.backend.status().await?,
        }))
    }

    /// Release backend connections
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    // =========================================================================
    // Read-through
    // =========================================================================

    /// Cached value for `key`, or the result of `producer` written back.
    ///
    /// With locking enabled only the lock holder runs `producer`; callers
    /// that waited re-read first. A caller that cannot get the lock computes
    /// the value itself but does not write it.
    pub async fn remember<T, F, Fut>(&self, key: &str, ttl: u64, tags: &[&str], producer: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let Some(physical) = self.normalizer.normalize_key(key) else {
            return producer().await;
        };

        if !self.lock_enabled {
            let value = producer().await?;
            let bytes = self.codec.encode(&value)?;
            let written = self.write_entry(&physical, &bytes, ttl, tags).await?;
            self.metrics.record_write(written);
            return Ok(value);
        }

        let mut producer = Some(producer);
        let slot = &mut producer;
        let lock_key = self.normalizer.lock_key(&physical);
        let outcome = self
            .locks
            .with_lock(&lock_key, || async move {
                if let Some(value) = self.get::<T>(key).await? {
                    return Ok(value);
                }
                let produce = slot
                    .take()
                    .ok_or_else(|| Error::Internal("producer already consumed".into()))?;
                let value = produce().await?;
                let bytes = self.codec.encode(&value)?;
                let written = self.write_entry(&physical, &bytes, ttl, tags).await?;
                self.metrics.record_write(written);
                Ok(value)
            })
            .await?;
        self.metrics.record_lock(outcome.is_some());

        match outcome {
            Some(value) => Ok(value),
            None => {
                if let Some(value) = self.get(key).await? {
                    return Ok(value);
                }
                match producer.take() {
                    Some(produce) => produce().await,
                    None => Err(Error::Internal("producer already consumed".into())),
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

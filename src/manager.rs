//! Cache registry
//!
//! Owns named [`Cache`] instances built from a [`ManagerConfig`] and closes
//! their backends on shutdown. Pass it by reference (or `Arc`) to whatever
//! needs a cache instead of reaching for a global.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};

/// Named caches with an optional default
#[derive(Default)]
pub struct CacheManager {
    caches: RwLock<BTreeMap<String, Arc<Cache>>>,
    default: RwLock<Option<String>>,
}

impl CacheManager {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every cache in `config`
    pub async fn from_config(config: &ManagerConfig) -> Result<Self> {
        config.validate()?;
        let manager = Self::new();
        for (name, cache_config) in &config.caches {
            let cache = Cache::from_config(cache_config).await?;
            manager.register(name.clone(), cache);
        }
        *manager.default.write() = config.default_name().map(str::to_string);
        info!(caches = config.caches.len(), "Cache manager ready");
        Ok(manager)
    }

    /// Add or replace a cache; returns the one it replaced
    pub fn register(&self, name: impl Into<String>, cache: Cache) -> Option<Arc<Cache>> {
        self.caches.write().insert(name.into(), Arc::new(cache))
    }

    /// Choose the default cache
    pub fn set_default(&self, name: &str) -> Result<()> {
        if !self.caches.read().contains_key(name) {
            return Err(Error::Config(format!("cache '{}' is not registered", name)));
        }
        *self.default.write() = Some(name.to_string());
        Ok(())
    }

    /// Cache by name
    pub fn cache(&self, name: &str) -> Option<Arc<Cache>> {
        self.caches.read().get(name).cloned()
    }

    /// The configured default, or the only registered cache
    pub fn default_cache(&self) -> Option<Arc<Cache>> {
        if let Some(name) = self.default.read().as_deref() {
            return self.cache(name);
        }
        let caches = self.caches.read();
        if caches.len() == 1 {
            caches.values().next().cloned()
        } else {
            None
        }
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    /// Close every backend and empty the registry.
    ///
    /// Every backend is closed even if one fails; the first failure is
    /// returned.
    pub async fn shutdown(&self) -> Result<()> {
        let caches: Vec<(String, Arc<Cache>)> = {
            let mut guard = self.caches.write();
            std::mem::take(&mut *guard).into_iter().collect()
        };
        *self.default.write() = None;

        let mut first_error = None;
        for (name, cache) in caches {
            if let Err(e) = cache.close().await {
                warn!(cache = %name, error = %e, "Failed to close cache backend");
                first_error.get_or_insert(e);
            }
        }
        info!("Cache manager shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

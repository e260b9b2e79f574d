//! In-process shared-memory backend.
//!
//! Entries live in a `DashMap` sharded for concurrent access. Expiry is
//! tracked per entry and enforced lazily on access against the injected
//! [`Clock`](crate::clock::Clock). Sets for the tag index are kept in a
//! second map.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;

use super::{matches_prefixes, CacheBackend, Capabilities, Expiry};
use crate::clock::{is_expired, system_clock, SharedClock};
use crate::codec::{decode_counter, encode_counter};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    /// Unix seconds, 0 = never
    expire_at: u64,
}

/// Shared-memory cache backend
pub struct MemoryBackend {
    entries: DashMap<String, MemoryEntry>,
    sets: DashMap<String, HashSet<String>>,
    clock: SharedClock,
    expired_purges: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_clock(system_clock())
    }
}

impl MemoryBackend {
    /// Create an empty backend on the wall clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty backend on a custom clock
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            sets: DashMap::new(),
            clock,
            expired_purges: AtomicU64::new(0),
        }
    }

    /// Number of stored entries, including ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.sets.is_empty()
    }

    fn purge_if_expired(&self, key: &str) {
        let now = self.clock.now();
        if self
            .entries
            .remove_if(key, |_, e| is_expired(e.expire_at, now))
            .is_some()
        {
            self.expired_purges.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_expiry: false,
            native_increment: true,
            native_sets: true,
            enumeration: true,
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            if !is_expired(entry.expire_at, now) {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.purge_if_expired(key);
        Ok(None)
    }

    async fn write(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = if is_expired(occupied.get().expire_at, now) {
                    0
                } else {
                    occupied.get().expire_at
                };
                occupied.insert(MemoryEntry {
                    value: value.to_vec(),
                    expire_at: expiry.resolve(self.clock.as_ref(), current),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry {
                    value: value.to_vec(),
                    expire_at: expiry.resolve(self.clock.as_ref(), 0),
                });
            }
        }
        Ok(true)
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        let now = self.clock.now();
        let fresh = MemoryEntry {
            value: value.to_vec(),
            expire_at: expiry.resolve(self.clock.as_ref(), 0),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if is_expired(occupied.get().expire_at, now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn touch(&self, key: &str, expiry: Expiry) -> Result<bool> {
        let now = self.clock.now();
        let touched = match self.entries.get_mut(key) {
            Some(mut entry) if !is_expired(entry.expire_at, now) => {
                entry.expire_at = expiry.resolve(self.clock.as_ref(), entry.expire_at);
                true
            }
            Some(_) => false,
            None => return Ok(false),
        };
        if !touched {
            self.purge_if_expired(key);
        }
        Ok(touched)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let removed_entry = self
            .entries
            .remove(key)
            .map(|(_, e)| !is_expired(e.expire_at, now))
            .unwrap_or(false);
        let removed_set = self.sets.remove(key).is_some();
        Ok(removed_entry || removed_set)
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove_if(key, |_, e| e.value == expected && !is_expired(e.expire_at, now))
            .is_some())
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        expiry: Expiry,
        create: bool,
    ) -> Result<Option<i64>> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !is_expired(occupied.get().expire_at, now) => {
                let current = decode_counter(&occupied.get().value).ok_or_else(|| {
                    Error::backend("memory", format!("value at '{}' is not a counter", key))
                })?;
                let next = current.wrapping_add(delta);
                let entry = occupied.get_mut();
                entry.value = encode_counter(next);
                entry.expire_at = expiry.resolve(self.clock.as_ref(), entry.expire_at);
                Ok(Some(next))
            }
            Entry::Occupied(mut occupied) => {
                if !create {
                    occupied.remove();
                    self.expired_purges.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                occupied.insert(MemoryEntry {
                    value: encode_counter(delta),
                    expire_at: expiry.resolve(self.clock.as_ref(), 0),
                });
                Ok(Some(delta))
            }
            Entry::Vacant(vacant) => {
                if !create {
                    return Ok(None);
                }
                vacant.insert(MemoryEntry {
                    value: encode_counter(delta),
                    expire_at: expiry.resolve(self.clock.as_ref(), 0),
                });
                Ok(Some(delta))
            }
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_members(&self, key: &str) -> Result<Option<Vec<String>>> {
        Ok(self.sets.get(key).map(|set| {
            let mut members: Vec<String> = set.iter().cloned().collect();
            members.sort();
            members
        }))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !is_expired(e.value().expire_at, now))
            .map(|e| e.key().clone())
            .chain(self.sets.iter().map(|s| s.key().clone()))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn flush(&self, prefixes: &[String]) -> Result<bool> {
        if prefixes.is_empty() {
            self.entries.clear();
            self.sets.clear();
        } else {
            self.entries.retain(|k, _| !matches_prefixes(k, prefixes));
            self.sets.retain(|k, _| !matches_prefixes(k, prefixes));
        }
        Ok(true)
    }

    async fn status(&self) -> Result<serde_json::Value> {
        let bytes: usize = self.entries.iter().map(|e| e.value().value.len()).sum();
        Ok(json!({
            "entries": self.entries.len(),
            "sets": self.sets.len(),
            "value_bytes": bytes,
            "expired_purges": self.expired_purges.load(Ordering::Relaxed),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn backend() -> (MemoryBackend, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (MemoryBackend::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let (b, _) = backend();
        assert!(b.write("k", b"v", Expiry::Never).await.unwrap());
        assert_eq!(b.read("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(b.delete("k").await.unwrap());
        assert!(!b.delete("k").await.unwrap());
        assert_eq!(b.read("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_if_eq_checks_value() {
        let (b, clock) = backend();
        b.write("__lock__:k", b"mine", Expiry::In(5)).await.unwrap();
        assert!(!b.delete_if_eq("__lock__:k", b"theirs").await.unwrap());
        assert!(b.contains("__lock__:k").await.unwrap());
        assert!(b.delete_if_eq("__lock__:k", b"mine").await.unwrap());
        assert!(!b.contains("__lock__:k").await.unwrap());

        // an expired token is nobody's to release
        b.write("__lock__:k", b"mine", Expiry::In(5)).await.unwrap();
        clock.advance(5);
        assert!(!b.delete_if_eq("__lock__:k", b"mine").await.unwrap());
    }

    #[tokio::test]
    async fn test_lazy_expiry_purges_entry() {
        let (b, clock) = backend();
        b.write("k", b"v", Expiry::In(1)).await.unwrap();
        assert!(b.contains("k").await.unwrap());
        clock.advance(1);
        assert_eq!(b.read("k").await.unwrap(), None);
        assert_eq!(b.len(), 0);
    }

    #[tokio::test]
    async fn test_create_if_absent_over_expired() {
        let (b, clock) = backend();
        assert!(b.create_if_absent("lock", b"a", Expiry::In(5)).await.unwrap());
        assert!(!b.create_if_absent("lock", b"b", Expiry::In(5)).await.unwrap());
        clock.advance(5);
        assert!(b.create_if_absent("lock", b"c", Expiry::In(5)).await.unwrap());
        assert_eq!(b.read("lock").await.unwrap(), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn test_touch_keeps_value() {
        let (b, clock) = backend();
        b.write("k", b"v", Expiry::In(100)).await.unwrap();
        assert!(b.touch("k", Expiry::In(1)).await.unwrap());
        assert_eq!(b.read("k").await.unwrap(), Some(b"v".to_vec()));
        clock.advance(2);
        assert_eq!(b.read("k").await.unwrap(), None);
        assert!(!b.touch("k", Expiry::In(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_semantics() {
        let (b, _) = backend();
        assert_eq!(b.increment("c", 5, Expiry::Keep, false).await.unwrap(), None);
        assert_eq!(b.increment("c", 5, Expiry::Keep, true).await.unwrap(), Some(5));
        assert_eq!(b.increment("c", 3, Expiry::Keep, true).await.unwrap(), Some(8));
        assert_eq!(b.increment("c", -10, Expiry::Keep, true).await.unwrap(), Some(-2));

        b.write("s", b"\x01abc", Expiry::Never).await.unwrap();
        assert!(b.increment("s", 1, Expiry::Keep, true).await.is_err());
    }

    #[tokio::test]
    async fn test_increment_keeps_expiry() {
        let (b, clock) = backend();
        b.increment("c", 1, Expiry::In(10), true).await.unwrap();
        clock.advance(5);
        b.increment("c", 1, Expiry::Keep, true).await.unwrap();
        clock.advance(5);
        assert_eq!(b.read("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sets_are_deduplicated() {
        let (b, _) = backend();
        assert!(b.set_add("t", "a").await.unwrap());
        assert!(!b.set_add("t", "a").await.unwrap());
        b.set_add("t", "b").await.unwrap();
        assert_eq!(
            b.set_members("t").await.unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert!(b.delete("t").await.unwrap());
        assert_eq!(b.set_members("t").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_flush_by_prefix() {
        let (b, _) = backend();
        b.write("app:a", b"1", Expiry::Never).await.unwrap();
        b.write("other:b", b"2", Expiry::Never).await.unwrap();
        b.set_add("__tag__:app:t", "app:a").await.unwrap();
        let prefixes = vec!["app:".to_string(), "__tag__:app:".to_string()];
        b.flush(&prefixes).await.unwrap();
        assert_eq!(b.keys().await.unwrap(), vec!["other:b".to_string()]);
    }

    #[tokio::test]
    async fn test_status_blob() {
        let (b, _) = backend();
        b.write("k", b"abc", Expiry::Never).await.unwrap();
        let status = b.status().await.unwrap();
        assert_eq!(status["entries"], 1);
        assert_eq!(status["value_bytes"], 3);
    }
}

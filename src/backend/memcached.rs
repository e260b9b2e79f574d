//! Memcached backend.
//!
//! The `memcache` client is blocking, so every call runs on the blocking
//! pool. Memcached has native expiry, `add` and `incr`, but no sets and no
//! key enumeration: the tag index is emulated, and `keys` / prefixed
//! `flush` report [`Error::Unsupported`].
//!
//! Counters are unsigned on the server. A decrement below zero clamps at
//! `0`, and a counter created by a negative delta starts at `0`.

use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use memcache::MemcacheError;
use serde_json::json;
use sha1::{Digest, Sha1};
use tracing::info;

use super::{CacheBackend, Capabilities, Expiry, MAX_RELATIVE_EXPIRY};
use crate::clock::{system_clock, SharedClock};
use crate::codec::encode_counter;
use crate::error::{Error, Result};

/// Longest key the server accepts
const MAX_KEY_LEN: usize = 250;

/// Memcached-backed cache
pub struct MemcachedBackend {
    client: Arc<memcache::Client>,
    servers: Vec<String>,
    clock: SharedClock,
}

impl MemcachedBackend {
    /// Connect to a server pool (`memcache://host:port` URLs)
    pub async fn connect(servers: &[String]) -> Result<Self> {
        let urls = servers.to_vec();
        let client = tokio::task::spawn_blocking(move || memcache::Client::connect(urls))
            .await
            .map_err(|e| Error::Internal(format!("memcached connect task failed: {}", e)))??;
        info!(servers = ?servers, "Connected to Memcached");
        Ok(Self {
            client: Arc::new(client),
            servers: servers.to_vec(),
            clock: system_clock(),
        })
    }

    /// Underlying client, for commands the cache contract does not cover
    pub fn client(&self) -> &memcache::Client {
        &self.client
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&memcache::Client) -> std::result::Result<T, MemcacheError> + Send + 'static,
        T: Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|e| Error::Internal(format!("memcached task failed: {}", e)))?
            .map_err(Error::from)
    }

    /// Expiration argument: relative seconds, or an absolute timestamp past
    /// the server's 30-day relative window
    fn expiration(&self, expiry: Expiry) -> u32 {
        match expiry {
            Expiry::Never | Expiry::Keep => 0,
            Expiry::In(secs) => {
                let secs = secs.max(1);
                let value = if secs > MAX_RELATIVE_EXPIRY {
                    self.clock.deadline(secs)
                } else {
                    secs
                };
                value.min(u32::MAX as u64) as u32
            }
        }
    }
}

/// Key as sent on the wire: no whitespace or control bytes, at most 250 bytes
fn wire_key(key: &str) -> Cow<'_, str> {
    let safe = key.len() <= MAX_KEY_LEN && key.bytes().all(|b| b > b' ' && b != 0x7f);
    if safe {
        return Cow::Borrowed(key);
    }
    let encoded = urlencoding::encode(key);
    if encoded.len() <= MAX_KEY_LEN {
        Cow::Owned(encoded.into_owned())
    } else {
        Cow::Owned(format!("sha1:{}", hex::encode(Sha1::digest(key.as_bytes()))))
    }
}

#[async_trait]
impl CacheBackend for MemcachedBackend {
    fn name(&self) -> &'static str {
        "memcached"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_expiry: true,
            native_increment: true,
            native_sets: false,
            enumeration: false,
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = wire_key(key).into_owned();
        self.blocking(move |c| c.get::<Vec<u8>>(&key)).await
    }

    async fn write(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        let key = wire_key(key).into_owned();
        let value = value.to_vec();
        let exp = self.expiration(expiry);
        self.blocking(move |c| c.set(&key, value.as_slice(), exp)).await?;
        Ok(true)
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        let key = wire_key(key).into_owned();
        let value = value.to_vec();
        let exp = self.expiration(expiry);
        self.blocking(move |c| match c.add(&key, value.as_slice(), exp) {
            Ok(()) => Ok(true),
            // NOT_STORED: the key exists
            Err(MemcacheError::CommandError(_)) => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    async fn touch(&self, key: &str, expiry: Expiry) -> Result<bool> {
        if expiry == Expiry::Keep {
            return self.contains(key).await;
        }
        let key = wire_key(key).into_owned();
        let exp = self.expiration(expiry);
        self.blocking(move |c| c.touch(&key, exp)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = wire_key(key).into_owned();
        self.blocking(move |c| c.delete(&key)).await
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        expiry: Expiry,
        create: bool,
    ) -> Result<Option<i64>> {
        let key = wire_key(key).into_owned();
        let touch_exp = match expiry {
            Expiry::Keep => None,
            other => Some(self.expiration(other)),
        };
        self.blocking(move |c| {
            let apply = |c: &memcache::Client| -> std::result::Result<u64, MemcacheError> {
                if delta >= 0 {
                    c.increment(&key, delta as u64)
                } else {
                    c.decrement(&key, delta.unsigned_abs())
                }
            };
            let value = match apply(c) {
                Ok(v) => v,
                Err(MemcacheError::CommandError(_)) if create => {
                    let initial = delta.max(0);
                    match c.add(&key, encode_counter(initial).as_slice(), touch_exp.unwrap_or(0)) {
                        Ok(()) => return Ok(Some(initial)),
                        // lost the create race; the winner's counter exists now
                        Err(MemcacheError::CommandError(_)) => apply(c)?,
                        Err(e) => return Err(e),
                    }
                }
                Err(MemcacheError::CommandError(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            if let Some(exp) = touch_exp {
                c.touch(&key, exp)?;
            }
            Ok(Some(value.min(i64::MAX as u64) as i64))
        })
        .await
    }

    async fn flush(&self, prefixes: &[String]) -> Result<bool> {
        if !prefixes.is_empty() {
            return Err(Error::unsupported(self.name(), "flush by prefix"));
        }
        self.blocking(|c| c.flush()).await?;
        info!(servers = ?self.servers, "Flushed Memcached");
        Ok(true)
    }

    async fn status(&self) -> Result<serde_json::Value> {
        let stats = self.blocking(|c| c.stats()).await?;
        let servers: serde_json::Map<String, serde_json::Value> = stats
            .into_iter()
            .map(|(server, fields)| {
                let picked: serde_json::Map<String, serde_json::Value> = fields
                    .into_iter()
                    .filter(|(name, _)| {
                        matches!(
                            name.as_str(),
                            "version" | "uptime" | "curr_items" | "bytes" | "get_hits"
                                | "get_misses" | "evictions" | "curr_connections"
                        )
                    })
                    .map(|(name, value)| (name, json!(value)))
                    .collect();
                (server, serde_json::Value::Object(picked))
            })
            .collect();
        Ok(json!({ "servers": servers }))
    }

    async fn read_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let wire: Vec<String> = keys.iter().map(|k| wire_key(k).into_owned()).collect();
        let lookup = wire.clone();
        let mut found = self
            .blocking(move |c| {
                let refs: Vec<&str> = lookup.iter().map(String::as_str).collect();
                c.gets::<Vec<u8>>(&refs)
            })
            .await?;
        Ok(wire.iter().map(|k| found.remove(k)).collect())
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
    use crate::codec::decode_counter;

    #[test]
    fn test_wire_key_passthrough_and_escaping() {
        assert_eq!(wire_key("app:user:1"), "app:user:1");
        assert_eq!(wire_key("has space"), "has%20space");
        let long = "k".repeat(300);
        let wire = wire_key(&long);
        assert!(wire.starts_with("sha1:"));
        assert!(wire.len() <= MAX_KEY_LEN);
    }

    #[test]
    fn test_counter_format_matches_server() {
        assert_eq!(decode_counter(&encode_counter(42)), Some(42));
    }

    fn servers() -> Vec<String> {
        vec![std::env::var("MEMCACHED_URL")
            .unwrap_or_else(|_| "memcache://127.0.0.1:11211".to_string())]
    }

    #[tokio::test]
    #[ignore = "needs a running Memcached server (MEMCACHED_URL)"]
    async fn test_native_primitives() {
        let b = MemcachedBackend::connect(&servers()).await.unwrap();
        b.delete("tagcache-test:k").await.unwrap();
        b.delete("tagcache-test:n").await.unwrap();

        assert!(b.create_if_absent("tagcache-test:k", b"v", Expiry::In(60)).await.unwrap());
        assert!(!b.create_if_absent("tagcache-test:k", b"w", Expiry::In(60)).await.unwrap());
        assert_eq!(b.read("tagcache-test:k").await.unwrap(), Some(b"v".to_vec()));

        assert_eq!(b.increment("tagcache-test:n", 5, Expiry::Keep, true).await.unwrap(), Some(5));
        assert_eq!(b.increment("tagcache-test:n", -9, Expiry::Keep, true).await.unwrap(), Some(0));
        assert_eq!(b.increment("tagcache-test:none", 1, Expiry::Keep, false).await.unwrap(), None);

        assert!(b.keys().await.unwrap_err().is_unsupported());
        assert!(b.flush(&["tagcache-test:".to_string()]).await.unwrap_err().is_unsupported());
    }
}

//! No-op backend.
//!
//! Stores nothing. Reads always miss and writes report success, which gives
//! callers fail-open caching when a real store is unavailable.

use std::any::Any;

use async_trait::async_trait;
use serde_json::json;

use super::{CacheBackend, Capabilities, Expiry};
use crate::error::Result;

/// Backend that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CacheBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_expiry: true,
            native_increment: true,
            native_sets: true,
            enumeration: true,
        }
    }

    async fn read(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn write(&self, _key: &str, _value: &[u8], _expiry: Expiry) -> Result<bool> {
        Ok(true)
    }

    async fn create_if_absent(&self, _key: &str, _value: &[u8], _expiry: Expiry) -> Result<bool> {
        Ok(true)
    }

    async fn touch(&self, _key: &str, _expiry: Expiry) -> Result<bool> {
        Ok(false)
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Ok(true)
    }

    async fn increment(
        &self,
        _key: &str,
        _delta: i64,
        _expiry: Expiry,
        _create: bool,
    ) -> Result<Option<i64>> {
        Ok(None)
    }

    async fn set_add(&self, _key: &str, _member: &str) -> Result<bool> {
        Ok(true)
    }

    async fn set_members(&self, _key: &str) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn flush(&self, _prefixes: &[String]) -> Result<bool> {
        Ok(true)
    }

    async fn status(&self) -> Result<serde_json::Value> {
        Ok(json!({ "enabled": false }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_backend_stores_nothing() {
        let b = NullBackend::new();
        assert!(b.write("k", b"v", Expiry::Never).await.unwrap());
        assert_eq!(b.read("k").await.unwrap(), None);
        assert!(!b.contains("k").await.unwrap());
        assert_eq!(b.increment("c", 1, Expiry::Keep, true).await.unwrap(), None);
        assert!(b.keys().await.unwrap().is_empty());
    }
}

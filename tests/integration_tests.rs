//! tagcache Integration Tests
//!
//! Exercises the public cache contract end to end:
//! - Contract behaviour on the memory and file backends
//! - Tag invalidation and stampede locking across concurrent callers
//! - Configuration and the cache registry
//! - Fail-open composition with the null backend

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tagcache::clock::ManualClock;
use tagcache::{
    Cache, CacheBackend, CacheConfig, CacheManager, CodecKind, Expiry, FileBackend,
    HashAlgorithm, ManagerConfig, MemoryBackend, NullBackend, RetryPolicy,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    roles: Vec<String>,
}

fn ann() -> Profile {
    Profile {
        name: "Ann".to_string(),
        roles: vec!["admin".to_string()],
    }
}

fn memory(config: CacheConfig) -> (Cache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
    (Cache::new(backend, &config), clock)
}

fn files(dir: &std::path::Path, config: CacheConfig) -> (Cache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let backend = Arc::new(FileBackend::with_clock(dir, 16, config.codec(), clock.clone()));
    (Cache::new(backend, &config), clock)
}

// =============================================================================
// Contract
// =============================================================================

mod contract_tests {
    use super::*;

    async fn scenario(cache: &Cache, clock: &ManualClock) {
        assert!(cache.set("user:1", &ann(), 0, &["users"]).await.unwrap());
        assert!(cache.set("user:2", &ann(), 0, &["users", "admins"]).await.unwrap());
        assert_eq!(cache.get::<Profile>("user:1").await.unwrap(), Some(ann()));

        let members = cache.get_tag("users").await.unwrap().unwrap();
        assert_eq!(members, vec!["user:1", "user:2"]);

        assert!(cache.remove_tag("users").await.unwrap());
        assert_eq!(cache.get::<Profile>("user:1").await.unwrap(), None);
        assert_eq!(cache.get::<Profile>("user:2").await.unwrap(), None);
        assert!(!cache.exists_tag("users").await.unwrap());
        // the other tag still lists the removed key; removing it is harmless
        assert!(cache.remove_tag("admins").await.unwrap());

        assert!(cache.set("session", "abc", 30, &[]).await.unwrap());
        clock.advance(29);
        assert!(cache.exists("session").await.unwrap());
        clock.advance(1);
        assert!(!cache.exists("session").await.unwrap());

        assert_eq!(cache.increment("visits", 5, 0, true).await.unwrap(), Some(5));
        assert_eq!(cache.increment("visits", 3, 0, true).await.unwrap(), Some(8));
        assert_eq!(cache.decrement("visits", 1, 0, false).await.unwrap(), Some(7));

        assert!(cache.add("once", "first", 0, &[]).await.unwrap());
        assert!(!cache.add("once", "second", 0, &[]).await.unwrap());
        assert_eq!(
            cache.get::<String>("once").await.unwrap().as_deref(),
            Some("first")
        );

        assert_eq!(cache.get_all_keys().await.unwrap(), vec!["once", "visits"]);
        assert!(cache.flush().await.unwrap());
        assert!(cache.get_all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend() {
        let (cache, clock) = memory(CacheConfig::default());
        scenario(&cache, &clock).await;
    }

    #[tokio::test]
    async fn test_memory_backend_with_prefix_and_json() {
        let (cache, clock) = memory(CacheConfig {
            prefix: "site:".to_string(),
            serializer: CodecKind::Json,
            tag_hash: HashAlgorithm::Sha1,
            ..CacheConfig::default()
        });
        scenario(&cache, &clock).await;
    }

    #[tokio::test]
    async fn test_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, clock) = files(dir.path(), CacheConfig::default());
        scenario(&cache, &clock).await;
    }

    #[tokio::test]
    async fn test_file_backend_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, clock) = files(
            dir.path(),
            CacheConfig {
                prefix: "site:".to_string(),
                serializer: CodecKind::Json,
                ..CacheConfig::default()
            },
        );
        scenario(&cache, &clock).await;
    }

    #[tokio::test]
    async fn test_hashed_keys_are_opaque() {
        let (cache, _) = memory(CacheConfig {
            key_hash: HashAlgorithm::Md5,
            ..CacheConfig::default()
        });
        cache.set("user:1", "v", 0, &[]).await.unwrap();
        assert_eq!(
            cache.get_all_keys().await.unwrap(),
            vec![HashAlgorithm::Md5.apply("user:1")]
        );
        assert_eq!(cache.get::<String>("user:1").await.unwrap().as_deref(), Some("v"));
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency_tests {
    use super::*;

    fn patient() -> CacheConfig {
        CacheConfig {
            lock: RetryPolicy {
                max_iterations: 10_000,
                retry_interval_ms: 1,
                lock_ttl_secs: 5,
            },
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_taggers_on_files_lose_no_members() {
        let dir = tempfile::tempdir().unwrap();
        let config = patient();
        let backend = Arc::new(FileBackend::new(dir.path(), 8, config.codec()));
        let cache = Arc::new(Cache::new(backend, &config));

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("page:{}", i);
                let stored = cache.set(&key, &i, 0, &["pages"]).await;
                stored
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }
        assert_eq!(cache.get_tag("pages").await.unwrap().unwrap().len(), 16);
        assert!(cache.remove_tag("pages").await.unwrap());
        assert!(cache.get_all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remember_computes_once_under_contention() {
        let config = patient();
        let cache = Arc::new(Cache::new(Arc::new(MemoryBackend::new()), &config));
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .remember("expensive", 0, &[], || async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(42i64)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_held_lock_bounds_the_write() {
        let config = CacheConfig {
            lock: RetryPolicy {
                max_iterations: 15,
                retry_interval_ms: 1,
                lock_ttl_secs: 5,
            },
            ..CacheConfig::default()
        };
        let backend = Arc::new(MemoryBackend::new());
        backend
            .write("__lock__:hot", b"someone", Expiry::In(60))
            .await
            .unwrap();
        let cache = Cache::new(backend, &config);

        let started = std::time::Instant::now();
        assert!(!cache.set("hot", "v", 0, &[]).await.unwrap());
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(cache.metrics().lock_contentions, 1);
    }
}

// =============================================================================
// Configuration and registry
// =============================================================================

mod registry_tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
default: fragments
caches:
  fragments:
    prefix: "frag:"
    serializer: json
    backend:
      type: file
      root: {}
      shards: 4
  sessions:
    prefix: "sess:"
  off:
    backend:
      type: "null"
"#,
            dir.path().display()
        );
        let manager = CacheManager::from_config(&ManagerConfig::from_yaml_str(&yaml).unwrap())
            .await
            .unwrap();
        assert_eq!(manager.names(), vec!["fragments", "off", "sessions"]);

        let fragments = manager.default_cache().unwrap();
        assert!(fragments.backend::<FileBackend>().is_some());
        fragments.set("header", "<h1>", 0, &["layout"]).await.unwrap();
        assert_eq!(
            fragments.get::<String>("header").await.unwrap().as_deref(),
            Some("<h1>")
        );

        let sessions = manager.cache("sessions").unwrap();
        assert!(sessions.backend::<MemoryBackend>().is_some());

        manager.shutdown().await.unwrap();
        assert!(manager.names().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(CacheConfig::from_yaml_str("serializer: xml").is_err());
        assert!(CacheConfig::from_yaml_str("key_hash: sha256").is_err());
        assert!(CacheConfig::from_yaml_str("prefix: \"__lock__:\"").is_err());
    }
}

// =============================================================================
// Fail-open
// =============================================================================

mod null_tests {
    use super::*;

    #[tokio::test]
    async fn test_null_backend_contract() {
        let backend: Arc<dyn CacheBackend> = Arc::new(NullBackend::new());
        let cache = Cache::new(backend, &CacheConfig::default());

        assert!(cache.set("k", &ann(), 0, &["t"]).await.unwrap());
        assert_eq!(cache.get::<Profile>("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());
        assert!(!cache.exists_tag("t").await.unwrap());
        assert!(cache.remove("k").await.unwrap());
        assert_eq!(cache.increment("n", 1, 0, true).await.unwrap(), None);
        let all: BTreeMap<String, i64> = cache.get_all().await.unwrap();
        assert!(all.is_empty());
        assert_eq!(cache.status().await.unwrap()["native"]["enabled"], false);
    }
}

//! Tag index.
//!
//! A tag key maps to the set of physical entry keys carrying that tag. Where
//! the backend has a server-side set the index uses it directly; otherwise
//! the set is a codec-encoded `Vec<String>` updated read-modify-write under
//! the lock manager so concurrent taggers do not lose members.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{CacheBackend, Expiry};
use crate::codec::Codec;
use crate::error::Result;
use crate::keys::lock_key_of;
use crate::lock::LockManager;

/// Tag index over one backend
pub struct TagIndex {
    backend: Arc<dyn CacheBackend>,
    locks: Arc<LockManager>,
    codec: Codec,
    lock_enabled: bool,
}

impl TagIndex {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        locks: Arc<LockManager>,
        codec: Codec,
        lock_enabled: bool,
    ) -> Self {
        Self {
            backend,
            locks,
            codec,
            lock_enabled,
        }
    }

    /// True when the backend keeps the index in a native set
    pub fn is_native(&self) -> bool {
        self.backend.capabilities().native_sets
    }

    /// Add `member` to `tag_key`. Adding an existing member is a no-op.
    ///
    /// Returns `false` only when the emulated index could not take its lock.
    pub async fn add_member(&self, tag_key: &str, member: &str) -> Result<bool> {
        if self.is_native() {
            self.backend.set_add(tag_key, member).await?;
            return Ok(true);
        }

        if !self.lock_enabled {
            self.append(tag_key, member).await?;
            return Ok(true);
        }

        let lock_key = lock_key_of(tag_key);
        let added = self
            .locks
            .with_lock(&lock_key, || self.append(tag_key, member))
            .await?;
        if added.is_none() {
            warn!(tag = %tag_key, member = %member, "Could not lock tag index");
        }
        Ok(added.is_some())
    }

    async fn append(&self, tag_key: &str, member: &str) -> Result<()> {
        let mut members = self.load(tag_key).await?.unwrap_or_default();
        if members.iter().any(|m| m == member) {
            return Ok(());
        }
        members.push(member.to_string());
        let bytes = self.codec.encode(&members)?;
        self.backend.write(tag_key, &bytes, Expiry::Never).await?;
        Ok(())
    }

    async fn load(&self, tag_key: &str) -> Result<Option<Vec<String>>> {
        match self.backend.read(tag_key).await? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Members of `tag_key`, `None` when the tag does not exist
    pub async fn members(&self, tag_key: &str) -> Result<Option<Vec<String>>> {
        if self.is_native() {
            self.backend.set_members(tag_key).await
        } else {
            self.load(tag_key).await
        }
    }

    /// True when the tag has an index entry
    pub async fn exists(&self, tag_key: &str) -> Result<bool> {
        Ok(self.members(tag_key).await?.is_some())
    }

    /// Delete every member key, then the tag entry itself.
    ///
    /// Members that already expired or were removed are skipped. Returns
    /// `false` if the tag did not exist.
    pub async fn delete_tag(&self, tag_key: &str) -> Result<bool> {
        let Some(members) = self.members(tag_key).await? else {
            return Ok(false);
        };
        let removed = self.backend.delete_many(&members).await?;
        self.backend.delete(tag_key).await?;
        debug!(
            tag = %tag_key,
            members = members.len(),
            removed,
            "Cascaded tag delete"
        );
        Ok(true)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, MemoryBackend};
    use crate::codec::CodecKind;
    use crate::lock::RetryPolicy;

    fn index_over(backend: Arc<dyn CacheBackend>) -> TagIndex {
        let locks = Arc::new(LockManager::new(backend.clone(), RetryPolicy::default()));
        TagIndex::new(backend, locks, Codec::new(CodecKind::Native), true)
    }

    async fn exercise(index: &TagIndex, backend: &Arc<dyn CacheBackend>) {
        backend.write("a", b"1", Expiry::Never).await.unwrap();
        backend.write("b", b"2", Expiry::Never).await.unwrap();

        assert!(index.add_member("__tag__:t", "a").await.unwrap());
        assert!(index.add_member("__tag__:t", "b").await.unwrap());
        assert!(index.add_member("__tag__:t", "a").await.unwrap());

        let mut members = index.members("__tag__:t").await.unwrap().unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        // orphan member does not abort the cascade
        backend.delete("b").await.unwrap();
        assert!(index.delete_tag("__tag__:t").await.unwrap());
        assert_eq!(backend.read("a").await.unwrap(), None);
        assert!(!index.exists("__tag__:t").await.unwrap());
        assert!(!index.delete_tag("__tag__:t").await.unwrap());
    }

    #[tokio::test]
    async fn test_native_index_on_memory() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let index = index_over(backend.clone());
        assert!(index.is_native());
        exercise(&index, &backend).await;
    }

    #[tokio::test]
    async fn test_emulated_index_on_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn CacheBackend> =
            Arc::new(FileBackend::new(dir.path(), 4, Codec::new(CodecKind::Native)));
        let index = index_over(backend.clone());
        assert!(!index.is_native());
        exercise(&index, &backend).await;
    }

    #[tokio::test]
    async fn test_emulated_concurrent_taggers_keep_all_members() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn CacheBackend> =
            Arc::new(FileBackend::new(dir.path(), 4, Codec::new(CodecKind::Json)));
        let locks = Arc::new(LockManager::new(
            backend.clone(),
            RetryPolicy {
                max_iterations: 5_000,
                retry_interval_ms: 1,
                lock_ttl_secs: 5,
            },
        ));
        let index = Arc::new(TagIndex::new(
            backend,
            locks,
            Codec::new(CodecKind::Json),
            true,
        ));

        let mut handles = Vec::new();
        for i in 0..10 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                index.add_member("__tag__:t", &format!("k{}", i)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }
        assert_eq!(index.members("__tag__:t").await.unwrap().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_lock_contention_reports_failure() {
        let backend: Arc<dyn CacheBackend> = Arc::new(
            FileBackend::new(tempfile::tempdir().unwrap().into_path(), 4, Codec::default()),
        );
        let locks = Arc::new(LockManager::new(
            backend.clone(),
            RetryPolicy {
                max_iterations: 2,
                retry_interval_ms: 0,
                lock_ttl_secs: 5,
            },
        ));
        backend
            .write("__lock__:__tag__:t", b"held", Expiry::Never)
            .await
            .unwrap();
        let index = TagIndex::new(backend, locks, Codec::default(), true);
        assert!(!index.add_member("__tag__:t", "a").await.unwrap());
        assert_eq!(index.members("__tag__:t").await.unwrap(), None);
    }
}

//! Filesystem backend.
//!
//! One file per entry holding a codec-encoded [`FileRecord`]. Layout:
//!
//! ```text
//! {root}/{space}/{shard:02x}/{name}.cache
//!
//! space  = entries | tags | locks   (from the key's reserved namespace)
//! shard  = fxhash(key) % shards     (stable, independent of directory size)
//! name   = urlencoded key, or sha1:{hex} once that exceeds MAX_NAME_LEN
//! ```
//!
//! Every record carries its key, so hashed names still enumerate.
//!
//! Writes go to a temp file in the target directory and are renamed into
//! place. `create_if_absent` hard-links the temp file, which fails atomically
//! when the target already exists.

use std::any::Any;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha1::{Digest, Sha1};
use tracing::debug;

use super::{matches_prefixes, CacheBackend, Capabilities, Expiry};
use crate::clock::{is_expired, system_clock, SharedClock};
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::keys::KeySpace;

const FILE_SUFFIX: &str = ".cache";
const TMP_SUFFIX: &str = ".tmp";

/// Longest url-encoded name used verbatim; most filesystems cap names at 255 bytes
const MAX_NAME_LEN: usize = 200;

/// Name prefix of hashed entries. `:` is always escaped in encoded names.
const HASHED_PREFIX: &str = "sha1:";

/// Default number of shard directories per key space
pub const DEFAULT_SHARDS: u32 = 64;

/// Persisted form of one entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Physical key the record belongs to
    #[serde(default)]
    pub key: String,
    /// Unix seconds, 0 = never
    pub expire_at: u64,
    /// Codec output for the cached value
    pub value: Vec<u8>,
}

/// Filesystem-backed cache
pub struct FileBackend {
    root: PathBuf,
    shards: u32,
    codec: Codec,
    clock: SharedClock,
}

impl FileBackend {
    /// Create a backend rooted at `root`
    pub fn new(root: impl Into<PathBuf>, shards: u32, codec: Codec) -> Self {
        Self::with_clock(root, shards, codec, system_clock())
    }

    /// Create a backend on a custom clock
    pub fn with_clock(root: impl Into<PathBuf>, shards: u32, codec: Codec, clock: SharedClock) -> Self {
        Self {
            root: root.into(),
            shards: shards.max(1),
            codec,
            clock,
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let space = KeySpace::of(key);
        let shard = shard_of(key, self.shards);
        self.root
            .join(space.label())
            .join(format!("{:02x}", shard))
            .join(format!("{}{}", file_name(key), FILE_SUFFIX))
    }

    async fn load(&self, path: &Path) -> Result<Option<FileRecord>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(self.codec.decode(&bytes)?))
    }

    /// Load a record, deleting it when expired
    async fn load_live(&self, path: &Path) -> Result<Option<FileRecord>> {
        match self.load(path).await? {
            Some(record) if is_expired(record.expire_at, self.clock.now()) => {
                remove_quietly(path).await?;
                debug!(path = %path.display(), "Purged expired cache file");
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Write `record` to a temp file next to `path`
    async fn stage(&self, path: &Path, record: &FileRecord) -> Result<PathBuf> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("no parent for {}", path.display())))?;
        tokio::fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!(".{}{}", uuid::Uuid::new_v4(), TMP_SUFFIX));
        tokio::fs::write(&tmp, self.codec.encode(record)?).await?;
        Ok(tmp)
    }

    async fn store(&self, path: &Path, record: &FileRecord) -> Result<()> {
        let tmp = self.stage(path, record).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            remove_quietly(&tmp).await?;
            return Err(e.into());
        }
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for space in [KeySpace::Entry, KeySpace::Tag, KeySpace::Lock] {
            let space_dir = self.root.join(space.label());
            let mut shards = match tokio::fs::read_dir(&space_dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(shard) = shards.next_entry().await? {
                if !shard.file_type().await?.is_dir() {
                    continue;
                }
                let mut entries = tokio::fs::read_dir(shard.path()).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name();
                    let Some(encoded) = name.to_str().and_then(|n| n.strip_suffix(FILE_SUFFIX))
                    else {
                        continue;
                    };
                    if encoded.starts_with(HASHED_PREFIX) {
                        // vanished or unreadable records are skipped
                        if let Ok(Some(record)) = self.load(&entry.path()).await {
                            files.push((record.key, entry.path()));
                        }
                    } else if let Ok(key) = urlencoding::decode(encoded) {
                        files.push((key.into_owned(), entry.path()));
                    }
                }
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_expiry: false,
            native_increment: false,
            native_sets: false,
            enumeration: true,
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .load_live(&self.path_for(key))
            .await?
            .map(|record| record.value))
    }

    async fn write(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        let path = self.path_for(key);
        let current = match expiry {
            Expiry::Keep => self
                .load_live(&path)
                .await?
                .map(|r| r.expire_at)
                .unwrap_or(0),
            _ => 0,
        };
        let record = FileRecord {
            key: key.to_string(),
            expire_at: expiry.resolve(self.clock.as_ref(), current),
            value: value.to_vec(),
        };
        self.store(&path, &record).await?;
        Ok(true)
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        let path = self.path_for(key);
        let record = FileRecord {
            key: key.to_string(),
            expire_at: expiry.resolve(self.clock.as_ref(), 0),
            value: value.to_vec(),
        };
        let tmp = self.stage(&path, &record).await?;
        // A second attempt covers an expired file that blocked the first link
        let mut created = false;
        for _ in 0..2 {
            match tokio::fs::hard_link(&tmp, &path).await {
                Ok(()) => {
                    created = true;
                    break;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.load_live(&path).await?.is_some() {
                        break;
                    }
                }
                Err(e) => {
                    remove_quietly(&tmp).await?;
                    return Err(e.into());
                }
            }
        }
        remove_quietly(&tmp).await?;
        Ok(created)
    }

    async fn touch(&self, key: &str, expiry: Expiry) -> Result<bool> {
        let path = self.path_for(key);
        match self.load_live(&path).await? {
            Some(mut record) => {
                record.key = key.to_string();
                record.expire_at = expiry.resolve(self.clock.as_ref(), record.expire_at);
                self.store(&path, &record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        let live = self.load_live(&path).await?.is_some();
        if live {
            remove_quietly(&path).await?;
        }
        Ok(live)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for (key, path) in self.list_files().await? {
            if self.load_live(&path).await?.is_some() {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn flush(&self, prefixes: &[String]) -> Result<bool> {
        if prefixes.is_empty() {
            for space in [KeySpace::Entry, KeySpace::Tag, KeySpace::Lock] {
                match tokio::fs::remove_dir_all(self.root.join(space.label())).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(true);
        }
        for (key, path) in self.list_files().await? {
            if matches_prefixes(&key, prefixes) {
                remove_quietly(&path).await?;
            }
        }
        Ok(true)
    }

    async fn status(&self) -> Result<serde_json::Value> {
        let files = self.list_files().await?;
        let mut bytes = 0u64;
        let mut per_space = serde_json::Map::new();
        for (key, path) in &files {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                bytes += meta.len();
            }
            let label = KeySpace::of(key).label();
            let count = per_space.get(label).and_then(|v| v.as_u64()).unwrap_or(0);
            per_space.insert(label.to_string(), json!(count + 1));
        }
        Ok(json!({
            "root": self.root.display().to_string(),
            "shards": self.shards,
            "codec": self.codec.kind().name(),
            "files": files.len(),
            "bytes": bytes,
            "spaces": per_space,
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// File name for a key, hashed when the encoded form is too long
fn file_name(key: &str) -> String {
    let encoded = urlencoding::encode(key);
    if encoded.len() <= MAX_NAME_LEN {
        encoded.into_owned()
    } else {
        format!("{}{}", HASHED_PREFIX, hex::encode(Sha1::digest(key.as_bytes())))
    }
}

/// Stable shard for a key (FxHash)
fn shard_of(key: &str, shards: u32) -> u32 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in key.as_bytes() {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    (hash % shards as u64) as u32
}

async fn remove_quietly(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Tests
// =============================================================================

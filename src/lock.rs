//! Stampede-prevention lock manager.
//!
//! An advisory per-key mutex built on the backend's `create_if_absent`:
//!
//! 1. Create `__lock__:{key}` with an owner token and a short TTL.
//! 2. On success run the guarded write, then delete the token.
//! 3. On failure sleep `retry_interval` and try again, at most
//!    `max_iterations` attempts in total.
//! 4. When every attempt fails, log the contention and give up.
//!
//! Reads never take the lock. A crashed writer's token expires on its own.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{CacheBackend, Expiry};
use crate::error::{Error, Result};

/// Default number of create attempts before giving up
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;

/// Default pause between attempts, in milliseconds
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1;

/// Default lifetime of a lock token, in seconds
pub const DEFAULT_LOCK_TTL_SECS: u64 = 5;

/// Retry policy for lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total create attempts, including the first
    pub max_iterations: u32,
    /// Pause between attempts
    pub retry_interval_ms: u64,
    /// Lifetime of the lock token
    pub lock_ttl_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
        }
    }
}

impl RetryPolicy {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// A held lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    owner: String,
}

impl LockToken {
    /// Lock key in the backend
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opaque owner value stored under the lock key
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// Lock counters
#[derive(Debug, Default)]
pub struct LockStats {
    attempts: AtomicU64,
    acquisitions: AtomicU64,
    contentions: AtomicU64,
}

/// Point-in-time copy of [`LockStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStatsSnapshot {
    pub attempts: u64,
    pub acquisitions: u64,
    pub contentions: u64,
}

impl LockStats {
    pub fn snapshot(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
        }
    }
}

/// Advisory lock manager over one backend
pub struct LockManager {
    backend: Arc<dyn CacheBackend>,
    policy: RetryPolicy,
    stats: LockStats,
}

impl LockManager {
    pub fn new(backend: Arc<dyn CacheBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            stats: LockStats::default(),
        }
    }

    /// Active policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Counters
    pub fn stats(&self) -> LockStatsSnapshot {
        self.stats.snapshot()
    }

    /// Take `lock_key`, retrying per the policy.
    ///
    /// Fails with [`Error::LockContention`] when the lock stayed held for
    /// every attempt.
    pub async fn lock(&self, lock_key: &str) -> Result<LockToken> {
        let owner = uuid::Uuid::new_v4().to_string();
        let ttl = Expiry::In(self.policy.lock_ttl_secs.max(1));
        let attempts = self.policy.max_iterations.max(1);

        for attempt in 1..=attempts {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            if self
                .backend
                .create_if_absent(lock_key, owner.as_bytes(), ttl)
                .await?
            {
                self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %lock_key, attempt, "Acquired write lock");
                return Ok(LockToken {
                    key: lock_key.to_string(),
                    owner,
                });
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.retry_interval()).await;
            }
        }

        self.stats.contentions.fetch_add(1, Ordering::Relaxed);
        Err(Error::LockContention {
            key: lock_key.to_string(),
            attempts,
        })
    }

    /// Like [`LockManager::lock`], but contention is logged and reported as
    /// `None`.
    pub async fn acquire(&self, lock_key: &str) -> Result<Option<LockToken>> {
        match self.lock(lock_key).await {
            Ok(token) => Ok(Some(token)),
            Err(e @ Error::LockContention { .. }) => {
                warn!(key = %lock_key, error = %e, "Abandoning guarded write");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Release a lock if this token still owns it.
    ///
    /// A token that already expired and was re-taken by another writer is left
    /// alone.
    pub async fn release(&self, token: &LockToken) -> Result<bool> {
        self.backend
            .delete_if_eq(&token.key, token.owner.as_bytes())
            .await
    }

    /// Run `f` while holding `lock_key`.
    ///
    /// Returns `Ok(None)` if the lock could not be taken; `f` does not run.
    pub async fn with_lock<F, Fut, T>(&self, lock_key: &str, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let Some(token) = self.acquire(lock_key).await? else {
            return Ok(None);
        };
        let outcome = f().await;
        if let Err(e) = self.release(&token).await {
            // the token TTL clears it eventually
            warn!(key = %lock_key, error = %e, "Failed to release write lock");
        }
        outcome.map(Some)
    }
}

// =============================================================================
// Tests
// =============================================================================

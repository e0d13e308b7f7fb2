//! Distributed mutual exclusion on top of the shared store.
//!
//! A lock is a `<name>:lock` key set only if absent and expiring after a
//! time-to-live. Acquisition retries a fixed number of times; release deletes
//! the key if it still holds the lock sentinel. The read and the delete are
//! two separate commands, so a lock that expired and was re-acquired by
//! someone else in between can still be released by the old holder.
//!
//! ```rust
//! use prioq::lock::{DistributedLock, LockOptions};
//! use prioq::storage::{KeySpace, MemoryBackend};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let lock = DistributedLock::new(Arc::new(MemoryBackend::new()), KeySpace::default());
//!
//! let guard = lock.acquire("reindex", LockOptions::default()).await.unwrap();
//! assert!(lock.acquire("reindex", LockOptions::once()).await.is_err());
//!
//! guard.release().await.unwrap();
//! assert!(lock.acquire("reindex", LockOptions::once()).await.is_ok());
//! # });
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::storage::{Backend, KeySpace};

/// Value stored under a held lock key
pub const LOCK_SENTINEL: &str = "locked!";

/// Acquisition parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// Expiry of the lock key
    pub ttl: Duration,
    /// Extra tries after the first failed one
    pub attempts: u32,
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            attempts: 10,
            retry_interval: Duration::from_millis(100),
        }
    }
}

impl LockOptions {
    /// A single try with no retries
    pub fn once() -> Self {
        Self {
            attempts: 0,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// Factory for named locks on one store.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn Backend>,
    keys: KeySpace,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn Backend>, keys: KeySpace) -> Self {
        Self { backend, keys }
    }

    /// Acquires `name`, retrying up to `options.attempts` more times.
    ///
    /// Fails with [`QueueError::LockUnavailable`] when every try finds the
    /// lock held.
    pub async fn acquire(&self, name: &str, options: LockOptions) -> Result<LockGuard> {
        let key = self.keys.lock(name);
        let mut tries = 0;
        loop {
            if self
                .backend
                .set_nx_px(&key, LOCK_SENTINEL, options.ttl)
                .await?
            {
                debug!(key = %key, tries, "Lock acquired");
                return Ok(LockGuard {
                    backend: Arc::clone(&self.backend),
                    key,
                });
            }
            if tries >= options.attempts {
                return Err(QueueError::LockUnavailable { key });
            }
            tries += 1;
            tokio::time::sleep(options.retry_interval).await;
        }
    }

    /// Releases `name` without a guard. Returns whether a lock was released.
    pub async fn release(&self, name: &str) -> Result<bool> {
        release_key(self.backend.as_ref(), &self.keys.lock(name)).await
    }
}

/// Capability to release an acquired lock.
///
/// Dropping the guard without calling [`release`](LockGuard::release) leaves
/// the key to expire on its own.
#[must_use = "an unreleased lock is held until its ttl expires"]
pub struct LockGuard {
    backend: Arc<dyn Backend>,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(self) -> Result<bool> {
        release_key(self.backend.as_ref(), &self.key).await
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

async fn release_key(backend: &dyn Backend, key: &str) -> Result<bool> {
    match backend.get(key).await? {
        Some(value) if value == LOCK_SENTINEL => {
            let released = backend.del(key).await?;
            debug!(key = %key, "Lock released");
            Ok(released)
        }
        _ => Ok(false),
    }
}

//! Backend wrapper that injects storage faults into tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

use super::{Backend, Batch, MemoryBackend, StorageError, Subscription};

/// A [`MemoryBackend`] whose batches can be made to fail and whose
/// subscriptions can be cut.
pub(crate) struct FlakyBackend {
    inner: MemoryBackend,
    failing_execs: AtomicUsize,
    cut: broadcast::Sender<()>,
}

impl FlakyBackend {
    pub(crate) fn new() -> Self {
        let (cut, _) = broadcast::channel(1);
        Self {
            inner: MemoryBackend::new(),
            failing_execs: AtomicUsize::new(0),
            cut,
        }
    }

    /// The next `count` calls to `exec` fail without applying anything.
    pub(crate) fn fail_next_execs(&self, count: usize) {
        self.failing_execs.store(count, Ordering::SeqCst);
    }

    /// Ends every subscription opened so far.
    pub(crate) fn end_subscriptions(&self) {
        let _ = self.cut.send(());
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        self.inner.incr(key).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        self.inner.hgetall(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        self.inner.hget(key, field).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        self.inner.hset(key, field, value).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StorageError> {
        self.inner.zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        self.inner.zrem(key, member).await
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, StorageError> {
        self.inner.zrange(key).await
    }

    async fn zrangebyscore(&self, key: &str, max: f64) -> Result<Vec<String>, StorageError> {
        self.inner.zrangebyscore(key, max).await
    }

    async fn zpopmax(&self, key: &str) -> Result<Option<(String, f64)>, StorageError> {
        self.inner.zpopmax(key).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StorageError> {
        self.inner.sadd(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError> {
        self.inner.smembers(key).await
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.lpush(key, value).await
    }

    async fn blocking_pop(&self, key: &str, wait: Duration) -> Result<Option<String>, StorageError> {
        self.inner.blocking_pop(key, wait).await
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.inner.set_nx_px(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key).await
    }

    async fn del(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.del(key).await
    }

    async fn exec(&self, batch: Batch) -> Result<(), StorageError> {
        let failing = self
            .failing_execs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::timeout(5));
        }
        self.inner.exec(batch).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StorageError> {
        let mut cut = self.cut.subscribe();
        let messages = self.inner.subscribe(channel).await?;
        Ok(messages
            .take_until(async move {
                let _ = cut.recv().await;
            })
            .boxed())
    }
}

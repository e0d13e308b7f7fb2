use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use super::{Backend, Batch, Command, MemoryConfig, StorageError, Subscription};

/// String value with an optional expiry deadline
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl Keyspace {
    fn live_string(&mut self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    /// Members ordered by (score, member), lowest first
    fn ordered(&self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .sorted_sets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) {
        self.sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sorted_sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member).is_some();
        if set.is_empty() {
            self.sorted_sets.remove(key);
        }
        removed
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    fn lpush(&mut self, key: &str, value: &str) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
    }

    fn lpop(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_front();
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn del(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let string = self
            .strings
            .remove(key)
            .is_some_and(|entry| entry.is_live(now));
        let hash = self.hashes.remove(key).is_some();
        let zset = self.sorted_sets.remove(key).is_some();
        let list = self.lists.remove(key).is_some();
        let set = self.sets.remove(key).is_some();
        string || hash || zset || list || set
    }

    fn apply(&mut self, command: &Command) {
        match command {
            Command::HSet { key, field, value } => self.hset(key, field, value),
            Command::ZAdd { key, member, score } => self.zadd(key, member, *score),
            Command::ZRem { key, member } => {
                self.zrem(key, member);
            }
            Command::LPush { key, value } => self.lpush(key, value),
            Command::SAdd { key, member } => self.sadd(key, member),
            Command::Del { key } => {
                self.del(key);
            }
        }
    }
}

/// In-process backend.
///
/// Every process sharing a `MemoryBackend` (through an `Arc`) sees the same
/// keyspace, so several queues in one process can coordinate exactly as they
/// would over Redis. Nothing is persisted.
#[derive(Debug)]
pub struct MemoryBackend {
    keyspace: Mutex<Keyspace>,
    pushed: Notify,
    bus: broadcast::Sender<(String, String)>,
    config: MemoryConfig,
}

impl MemoryBackend {
    /// Create a new memory backend with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Create a new memory backend with the specified configuration
    pub fn with_config(config: MemoryConfig) -> Self {
        let (bus, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            pushed: Notify::new(),
            bus,
            config,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Drop every key
    pub fn clear(&self) {
        *self.keyspace() = Keyspace::default();
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        // No code path panics while holding the guard, so a poisoned lock
        // still guards a consistent keyspace.
        self.keyspace.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        let mut keyspace = self.keyspace();
        let current = match keyspace.live_string(key) {
            Some(entry) => entry.value.parse::<i64>().map_err(|_| {
                StorageError::invalid_value(key, "value is not an integer")
            })?,
            None => 0,
        };
        let next = current + 1;
        keyspace.strings.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        Ok(self.keyspace().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .keyspace()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        self.keyspace().hset(key, field, value);
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StorageError> {
        self.keyspace().zadd(key, member, score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        Ok(self.keyspace().zrem(key, member))
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .keyspace()
            .ordered(key)
            .into_iter()
            .map(|(member, _)| member)
            .collect())
    }

    async fn zrangebyscore(&self, key: &str, max: f64) -> Result<Vec<String>, StorageError> {
        Ok(self
            .keyspace()
            .ordered(key)
            .into_iter()
            .filter(|(_, score)| *score <= max)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zpopmax(&self, key: &str) -> Result<Option<(String, f64)>, StorageError> {
        let mut keyspace = self.keyspace();
        let Some((member, score)) = keyspace.ordered(key).pop() else {
            return Ok(None);
        };
        keyspace.zrem(key, &member);
        Ok(Some((member, score)))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StorageError> {
        self.keyspace().sadd(key, member);
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .keyspace()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.keyspace().lpush(key, value);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(&self, key: &str, wait: Duration) -> Result<Option<String>, StorageError> {
        let deadline = Instant::now() + wait;
        loop {
            // Register for wakeups before checking, so a push between the
            // check and the await is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.keyspace().lpop(key) {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut keyspace = self.keyspace();
        if keyspace.live_string(key).is_some() {
            return Ok(false);
        }
        keyspace.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .keyspace()
            .live_string(key)
            .map(|entry| entry.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.keyspace().del(key))
    }

    async fn exec(&self, batch: Batch) -> Result<(), StorageError> {
        let pushes = batch
            .commands()
            .iter()
            .any(|command| matches!(command, Command::LPush { .. }));
        {
            let mut keyspace = self.keyspace();
            for command in batch.commands() {
                keyspace.apply(command);
            }
        }
        if pushes {
            self.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError> {
        // Publishing with no subscribers is not an error, same as Redis.
        let _ = self.bus.send((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StorageError> {
        let receiver = self.bus.subscribe();
        let channel = channel.to_string();

        let messages = stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((name, payload)) if name == channel => {
                            return Some((payload, receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %channel, skipped, "Subscriber lagged behind, messages dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(messages.boxed())
    }
}

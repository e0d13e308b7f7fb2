//! Backing store adapter.
//!
//! The queue only talks to its store through the [`Backend`] trait: hashes,
//! priority-scored sorted sets, blocking notification lists, atomic command
//! batches, expiring conditional keys and publish/subscribe. Two backends
//! implement it:
//!
//! - **[`MemoryBackend`]**: in-process, for tests and single-process setups
//! - **[`RedisBackend`]**: shared Redis server, for multi-process deployments
//!
//! ## Atomic batches
//!
//! Multi-step mutations (state transitions, removal, first save) are built as
//! a [`Batch`] and applied with [`Backend::exec`], which either applies every
//! command or none of them.
//!
//! ```rust
//! use prioq::storage::{Backend, Batch, MemoryBackend};
//!
//! # tokio_test::block_on(async {
//! let backend = MemoryBackend::new();
//! let batch = Batch::new()
//!     .hset("job:1", "state", "pending")
//!     .zadd("jobs:pending", "1", 3.0)
//!     .lpush("email:jobs", "1");
//! backend.exec(batch).await.unwrap();
//!
//! assert_eq!(
//!     backend.zpopmax("jobs:pending").await.unwrap(),
//!     Some(("1".to_string(), 3.0))
//! );
//! # });
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod error;
pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "redis")]
pub use config::RedisConfig;
pub use config::{MemoryConfig, StorageConfig};
pub use error::StorageError;
pub use keys::KeySpace;
pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis::RedisBackend;

/// Stream of payloads received on a subscribed channel.
pub type Subscription = BoxStream<'static, String>;

/// One command inside an atomic [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    HSet {
        key: String,
        field: String,
        value: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    ZRem {
        key: String,
        member: String,
    },
    LPush {
        key: String,
        value: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    Del {
        key: String,
    },
}

/// Ordered list of commands applied all-or-nothing by [`Backend::exec`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset(mut self, key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.commands.push(Command::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Adds one `HSet` per field.
    pub fn hset_all<I, F, V>(mut self, key: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<String>,
    {
        let key = key.into();
        for (field, value) in fields {
            self = self.hset(key.clone(), field, value);
        }
        self
    }

    pub fn zadd(mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        self.commands.push(Command::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn zrem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(Command::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn lpush(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.commands.push(Command::LPush {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(Command::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.commands.push(Command::Del { key: key.into() });
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Operation contract of the shared key-value/pub-sub store.
///
/// Keys are passed fully namespaced (see [`KeySpace`]). All values are
/// strings; sorted-set scores are floats.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Increments an integer key and returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, StorageError>;

    /// Reads every field of a hash; a missing key yields an empty map.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StorageError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StorageError>;

    /// Returns whether the member was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    /// Every member, lowest score first.
    async fn zrange(&self, key: &str) -> Result<Vec<String>, StorageError>;

    /// Members with a score of at most `max`, lowest first.
    async fn zrangebyscore(&self, key: &str, max: f64) -> Result<Vec<String>, StorageError>;

    /// Atomically removes and returns the highest-scored member with its score.
    async fn zpopmax(&self, key: &str) -> Result<Option<(String, f64)>, StorageError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StorageError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError>;

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Pops from the head of a list, waiting up to `wait` for a push.
    ///
    /// Each pushed value is delivered to exactly one waiter. Returns `None`
    /// when the wait elapses with nothing pushed.
    async fn blocking_pop(&self, key: &str, wait: Duration) -> Result<Option<String>, StorageError>;

    /// Sets `key` only if it does not exist, expiring after `ttl`.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> Result<bool, StorageError>;

    /// Applies every command of the batch atomically.
    async fn exec(&self, batch: Batch) -> Result<(), StorageError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError>;

    /// Subscribes to a channel. The subscription is confirmed when this returns.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StorageError>;
}

/// Creates the backend described by `config`.
///
/// ```rust
/// use prioq::storage::{connect, StorageConfig};
///
/// # tokio_test::block_on(async {
/// let backend = connect(&StorageConfig::default()).await.unwrap();
/// backend.lpush("k", "1").await.unwrap();
/// # });
/// ```
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn Backend>, StorageError> {
    match config {
        StorageConfig::Memory(memory_config) => {
            Ok(Arc::new(MemoryBackend::with_config(memory_config.clone())))
        }
        #[cfg(feature = "redis")]
        StorageConfig::Redis(redis_config) => {
            let backend = RedisBackend::with_config(redis_config.clone()).await?;
            Ok(Arc::new(backend))
        }
    }
}

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client, RedisResult};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{Backend, Batch, Command, RedisConfig, StorageError, Subscription};

/// Shortest wait handed to BLPOP; a zero timeout would block forever
const MIN_BLOCKING_WAIT: Duration = Duration::from_millis(10);

/// Redis backend.
///
/// Ordinary commands share one auto-reconnecting [`ConnectionManager`].
/// Blocking pops hold a connection for their whole wait, so each concurrent
/// pop checks out its own connection from a small idle pool.
pub struct RedisBackend {
    client: Client,
    connection_manager: ConnectionManager,
    blocking_pool: Mutex<Vec<MultiplexedConnection>>,
    config: RedisConfig,
}

impl RedisBackend {
    /// Create a new Redis backend with the specified configuration
    pub async fn with_config(config: RedisConfig) -> Result<Self, StorageError> {
        let client = Client::open(config.full_url())
            .map_err(|e| StorageError::configuration(format!("Invalid Redis url: {}", e)))?;

        let connection_manager =
            timeout(config.connection_timeout, ConnectionManager::new(client.clone()))
                .await
                .map_err(|_| StorageError::timeout(config.connection_timeout.as_millis() as u64))?
                .map_err(|e| {
                    StorageError::connection_with_source(
                        "Failed to create connection manager",
                        Box::new(e),
                    )
                })?;

        tracing::debug!(url = %config.url, "Connected to Redis");

        Ok(Self {
            client,
            connection_manager,
            blocking_pool: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    fn connection(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }

    /// Execute a Redis command with timeout
    async fn with_timeout<F, T>(&self, operation: &str, future: F) -> Result<T, StorageError>
    where
        F: std::future::Future<Output = RedisResult<T>>,
    {
        Self::bounded(self.config.command_timeout, operation, future).await
    }

    async fn bounded<F, T>(limit: Duration, operation: &str, future: F) -> Result<T, StorageError>
    where
        F: std::future::Future<Output = RedisResult<T>>,
    {
        timeout(limit, future)
            .await
            .map_err(|_| StorageError::timeout(limit.as_millis() as u64))?
            .map_err(|e| {
                StorageError::operation_failed_with_source(operation, e.to_string(), Box::new(e))
            })
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StorageError> {
        if let Some(connection) = self.blocking_pool.lock().await.pop() {
            return Ok(connection);
        }
        timeout(
            self.config.connection_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StorageError::timeout(self.config.connection_timeout.as_millis() as u64))?
        .map_err(|e| {
            StorageError::connection_with_source("Failed to open blocking connection", Box::new(e))
        })
    }

    async fn checkin_blocking(&self, connection: MultiplexedConnection) {
        self.blocking_pool.lock().await.push(connection);
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        let mut conn = self.connection();
        self.with_timeout("INCR", conn.incr(key, 1)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        let mut conn = self.connection();
        self.with_timeout("HGETALL", conn.hgetall(key)).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection();
        self.with_timeout("HGET", conn.hget(key, field)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        let mut conn = self.connection();
        self.with_timeout("HSET", conn.hset(key, field, value)).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StorageError> {
        let mut conn = self.connection();
        self.with_timeout("ZADD", conn.zadd(key, member, score)).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection();
        let removed: i64 = self.with_timeout("ZREM", conn.zrem(key, member)).await?;
        Ok(removed > 0)
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection();
        self.with_timeout("ZRANGE", conn.zrange(key, 0, -1)).await
    }

    async fn zrangebyscore(&self, key: &str, max: f64) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection();
        self.with_timeout("ZRANGEBYSCORE", conn.zrangebyscore(key, "-inf", max))
            .await
    }

    async fn zpopmax(&self, key: &str) -> Result<Option<(String, f64)>, StorageError> {
        let mut conn = self.connection();
        // Reply is a flat [member, score] list
        let reply: Vec<String> = self
            .with_timeout(
                "ZPOPMAX",
                redis::cmd("ZPOPMAX").arg(key).query_async(&mut conn),
            )
            .await?;
        let mut reply = reply.into_iter();
        let (Some(member), Some(score)) = (reply.next(), reply.next()) else {
            return Ok(None);
        };
        let score = score
            .parse::<f64>()
            .map_err(|_| StorageError::invalid_value(key, format!("non-numeric score '{}'", score)))?;
        Ok(Some((member, score)))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StorageError> {
        let mut conn = self.connection();
        self.with_timeout("SADD", conn.sadd(key, member)).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection();
        self.with_timeout("SMEMBERS", conn.smembers(key)).await
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut conn = self.connection();
        self.with_timeout("LPUSH", conn.lpush(key, value)).await
    }

    async fn blocking_pop(&self, key: &str, wait: Duration) -> Result<Option<String>, StorageError> {
        let wait = wait.max(MIN_BLOCKING_WAIT);
        let mut conn = self.checkout_blocking().await?;

        let popped: Result<Option<(String, String)>, StorageError> = Self::bounded(
            wait + self.config.command_timeout,
            "BLPOP",
            redis::cmd("BLPOP")
                .arg(key)
                .arg(wait.as_secs_f64())
                .query_async(&mut conn),
        )
        .await;

        // A connection whose BLPOP was abandoned may still deliver the reply
        // later, so only healthy connections go back to the pool.
        if popped.is_ok() {
            self.checkin_blocking(conn).await;
        }

        Ok(popped?.map(|(_, value)| value))
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection();
        let reply: Option<String> = self
            .with_timeout(
                "SET NX PX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis().max(1) as u64)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection();
        self.with_timeout("GET", conn.get(key)).await
    }

    async fn del(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection();
        let removed: i64 = self.with_timeout("DEL", conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn exec(&self, batch: Batch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in batch.commands() {
            match command {
                Command::HSet { key, field, value } => {
                    pipe.hset(key, field, value).ignore();
                }
                Command::ZAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                Command::ZRem { key, member } => {
                    pipe.zrem(key, member).ignore();
                }
                Command::LPush { key, value } => {
                    pipe.lpush(key, value).ignore();
                }
                Command::SAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                Command::Del { key } => {
                    pipe.del(key).ignore();
                }
            }
        }

        let mut conn = self.connection();
        self.with_timeout("MULTI/EXEC", pipe.query_async(&mut conn))
            .await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError> {
        let mut conn = self.connection();
        let _receivers: i64 = self
            .with_timeout("PUBLISH", conn.publish(channel, message))
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StorageError> {
        let mut pubsub = timeout(self.config.connection_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| StorageError::timeout(self.config.connection_timeout.as_millis() as u64))?
            .map_err(|e| {
                StorageError::connection_with_source("Failed to open pub/sub connection", Box::new(e))
            })?;

        self.with_timeout("SUBSCRIBE", pubsub.subscribe(channel))
            .await?;

        let channel = channel.to_string();
        let messages = pubsub.into_on_message().filter_map(move |message| {
            let payload = message.get_payload::<String>();
            let channel = channel.clone();
            async move {
                match payload {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Dropping non-text pub/sub payload");
                        None
                    }
                }
            }
        });

        Ok(messages.boxed())
    }
}

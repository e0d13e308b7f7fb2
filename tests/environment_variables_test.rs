//! Configuration loaded from the process environment.

use prioq::{QueueConfig, QueueError, StorageConfig};
use std::env;
use std::time::Duration;

// A single test mutates the environment so nothing races on it.
#[test]
fn test_queue_config_from_environment() {
    let vars = [
        ("PRIOQ_KEY_PREFIX", "env-test"),
        ("PRIOQ_BLOCK_TIMEOUT_MS", "250"),
        ("PRIOQ_SCHEDULER_INTERVAL_MS", "75"),
    ];
    for (key, value) in vars {
        env::set_var(key, value);
    }
    env::remove_var("PRIOQ_REDIS_URL");
    let redis_url = env::var("REDIS_URL").ok();
    env::remove_var("REDIS_URL");

    let config = QueueConfig::from_env().unwrap();
    assert_eq!(config.key_prefix, "env-test");
    assert_eq!(config.block_timeout, Duration::from_millis(250));
    assert_eq!(config.scheduler_interval, Duration::from_millis(75));
    assert!(matches!(config.storage, StorageConfig::Memory(_)));

    env::set_var("PRIOQ_BLOCK_TIMEOUT_MS", "soon");
    assert!(matches!(
        QueueConfig::from_env(),
        Err(QueueError::Configuration { .. })
    ));

    #[cfg(feature = "redis")]
    {
        env::set_var("PRIOQ_BLOCK_TIMEOUT_MS", "250");
        env::set_var("PRIOQ_REDIS_URL", "redis://cache.internal:6380");
        let config = QueueConfig::from_env().unwrap();
        match config.storage {
            StorageConfig::Redis(redis) => assert_eq!(redis.url, "redis://cache.internal:6380"),
            other => panic!("expected redis storage, got {:?}", other),
        }
        env::remove_var("PRIOQ_REDIS_URL");
    }

    for (key, _) in vars {
        env::remove_var(key);
    }
    if let Some(url) = redis_url {
        env::set_var("REDIS_URL", url);
    }
}

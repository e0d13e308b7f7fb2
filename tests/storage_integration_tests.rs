use prioq::storage::{connect, Backend, Batch, MemoryConfig, StorageConfig};
use prioq::{Done, JobEvent, JobHandle, Queue, QueueConfig};
use serde_json::json;
use std::time::Duration;

#[cfg(feature = "redis")]
use prioq::RedisConfig;

/// Test the storage factory with the in-process backend
#[tokio::test]
async fn test_storage_factory_memory() {
    let config = StorageConfig::Memory(MemoryConfig::new().with_channel_capacity(16));
    let backend = connect(&config).await.unwrap();

    let batch = Batch::new()
        .hset("job:1", "type", "email")
        .zadd("jobs:pending", "1", 3.0)
        .zadd("jobs:pending", "2", 5.0)
        .lpush("email:jobs", "1");
    backend.exec(batch).await.unwrap();

    assert_eq!(
        backend.hget("job:1", "type").await.unwrap(),
        Some("email".to_string())
    );
    assert_eq!(
        backend.zpopmax("jobs:pending").await.unwrap(),
        Some(("2".to_string(), 5.0))
    );
    assert_eq!(
        backend
            .blocking_pop("email:jobs", Duration::from_millis(10))
            .await
            .unwrap(),
        Some("1".to_string())
    );
    assert_eq!(
        backend
            .blocking_pop("email:jobs", Duration::from_millis(10))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_memory_blocking_pop_wakes_on_push() {
    let backend = connect(&StorageConfig::default()).await.unwrap();

    let waiter = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.blocking_pop("wake", Duration::from_secs(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    backend.lpush("wake", "1").await.unwrap();

    let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(popped, Some("1".to_string()));
}

#[tokio::test]
#[cfg(feature = "redis")]
async fn test_storage_factory_redis() {
    let config = StorageConfig::Redis(
        RedisConfig::new()
            .with_url("redis://127.0.0.1:6379")
            .with_database(3),
    );

    // Try to create Redis storage, skip if not available
    match connect(&config).await {
        Ok(backend) => {
            let key = format!("prioq_test_factory:{}", uuid::Uuid::new_v4());
            assert!(backend
                .set_nx_px(&key, "locked!", Duration::from_secs(5))
                .await
                .unwrap());
            assert!(!backend
                .set_nx_px(&key, "locked!", Duration::from_secs(5))
                .await
                .unwrap());
            assert!(backend.del(&key).await.unwrap());
        }
        Err(_) => {
            println!("Redis not available, skipping Redis factory test");
        }
    }
}

#[tokio::test]
#[cfg(feature = "redis")]
async fn test_redis_end_to_end() {
    let prefix = format!("prioq_e2e_{}", uuid::Uuid::new_v4().simple());
    let config = QueueConfig::redis(
        RedisConfig::new()
            .with_url("redis://127.0.0.1:6379")
            .with_database(3),
    )
    .with_key_prefix(prefix)
    .with_block_timeout(Duration::from_millis(200))
    .with_scheduler_interval(Duration::from_millis(20));

    let (producer, consumer) = match (Queue::connect(config.clone()).await, Queue::connect(config).await) {
        (Ok(producer), Ok(consumer)) => (producer, consumer),
        _ => {
            println!("Redis not available, skipping Redis end-to-end test");
            return;
        }
    };

    consumer
        .process_job("t", 2, |job: JobHandle, done: Done| async move {
            match serde_json::from_value::<Vec<String>>(job.data.clone()) {
                Ok(words) => done.complete(json!(words.join(" "))),
                Err(e) => done.fail(e),
            }
        })
        .await
        .unwrap();

    let mut job = producer.create_job("t", json!(["a", "b"]));
    job.set_remove_on_complete(false);
    let mut events = job.subscribe();
    job.run().await.unwrap();
    let id = job.id.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(JobEvent::Complete { result }) => return result,
                Ok(JobEvent::Failed { error }) => panic!("job failed: {}", error),
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(result, json!("a b"));
    assert_eq!(producer.complete().await.unwrap(), vec![id]);

    consumer.shutdown(Some(Duration::from_secs(1)), None).await.unwrap();
    producer.remove_job(id).await.unwrap();
}

//! # prioq
//!
//! A distributed, priority-aware job queue on a shared key-value/pub-sub store.
//!
//! Producers enqueue typed jobs; workers in any number of processes compete
//! for jobs of a type, run them, and record completion or failure with
//! bounded retry. Any process can observe the lifecycle events of jobs it
//! did not create.
//!
//! ## Features
//!
//! - **Priority dispatch**: pending jobs of a type are claimed highest priority first
//! - **Atomic state machine**: every transition is one all-or-nothing store batch
//! - **Blocking wake-up**: idle workers sleep on a per-type notification list
//! - **Retry with delay**: failed attempts re-enter pending after the job's timeout
//! - **Cross-process events**: `enqueue`, `start`, `complete`, `failed`, `failed attempt`, `remove`, `error`
//! - **Distributed lock**: expiring set-if-absent locks for cooperative sections
//! - **Two backends**: in-process memory, and Redis (`redis` feature, on by default)
//!
//! ## Producing and processing jobs
//!
//! ```rust
//! use prioq::{Done, JobEvent, JobHandle, Queue, QueueConfig};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let queue = Queue::connect(QueueConfig::new()).await.unwrap();
//!
//! queue
//!     .process_job("join", 1, |job: JobHandle, done: Done| async move {
//!         match serde_json::from_value::<Vec<String>>(job.data.clone()) {
//!             Ok(words) => done.complete(json!(words.join(" "))),
//!             Err(e) => done.fail(e),
//!         }
//!     })
//!     .await
//!     .unwrap();
//!
//! let mut job = queue.create_job("join", json!(["a", "b"]));
//! job.set_priority("high");
//! let mut events = job.subscribe();
//! job.run().await.unwrap();
//!
//! loop {
//!     match events.recv().await.unwrap() {
//!         JobEvent::Complete { result } => {
//!             assert_eq!(result, json!("a b"));
//!             break;
//!         }
//!         JobEvent::Failed { error } => panic!("job failed: {}", error),
//!         _ => {}
//!     }
//! }
//!
//! queue.shutdown(None, None).await.unwrap();
//! # });
//! ```
//!
//! ## Observing every job
//!
//! ```rust
//! use prioq::{Queue, QueueConfig};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let queue = Queue::connect(QueueConfig::new()).await.unwrap();
//! let mut events = queue.subscribe();
//!
//! queue.create_job("email", json!({})).save().await.unwrap();
//!
//! let event = events.recv().await.unwrap();
//! assert_eq!(event.name(), "job enqueue");
//! # });
//! ```
//!
//! ## Redis
//!
//! ```rust,ignore
//! use prioq::{Queue, QueueConfig, RedisConfig};
//! use std::time::Duration;
//!
//! let config = QueueConfig::redis(
//!     RedisConfig::new()
//!         .with_url("redis://localhost:6379")
//!         .with_command_timeout(Duration::from_secs(2)),
//! )
//! .with_key_prefix("myapp");
//! let queue = Queue::connect(config).await?;
//! ```
//!
//! Or from the environment with [`QueueConfig::from_env`].

pub mod core;
pub mod error;
pub mod events;
pub mod lock;
pub mod processing;
pub mod queue;
pub mod storage;

pub use core::{Job, JobDefaults, JobId, JobState, Priority, PriorityInput};
pub use error::{QueueError, Result};
pub use events::{EventMessage, JobEvent, QueueEvent};
pub use lock::{DistributedLock, LockGuard, LockOptions};
pub use processing::{Done, HandlerResult, JobHandler, WorkerInfo, WorkerStatus};
pub use queue::{JobHandle, Queue, QueueConfig, RetryOutcome};
pub use storage::{Backend, MemoryBackend, StorageConfig, StorageError};

#[cfg(feature = "redis")]
pub use storage::{RedisBackend, RedisConfig};

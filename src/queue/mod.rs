//! The queue: composition root for producers, workers and observers.
//!
//! A [`Queue`] is an explicitly constructed, cheaply cloneable handle. It owns
//! the store connection, the process's event bus subscription, the worker
//! pool and the delayed-job scheduler.
//!
//! ```rust
//! use prioq::{Done, JobHandle, Queue, QueueConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let queue = Queue::connect(QueueConfig::new()).await.unwrap();
//!
//! queue
//!     .process_job("greet", 2, |job: JobHandle, done: Done| async move {
//!         done.complete(json!(format!("hello {}", job.data)));
//!     })
//!     .await
//!     .unwrap();
//!
//! let mut job = queue.create_job("greet", json!("world"));
//! job.set_remove_on_complete(false);
//! let mut events = job.subscribe();
//! job.run().await.unwrap();
//!
//! while let Ok(event) = events.recv().await {
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! assert_eq!(queue.complete().await.unwrap(), vec![job.id.unwrap()]);
//!
//! queue.shutdown(Some(Duration::from_secs(1)), None).await.unwrap();
//! # });
//! ```

use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::core::{Job, JobId, JobState};
use crate::error::{QueueError, Result};
use crate::events::QueueEvent;
use crate::lock::DistributedLock;
use crate::processing::worker::{Worker, WorkerSignal};
use crate::processing::{DelayedJobScheduler, JobHandler, WorkerInfo, WorkerStatus};
use crate::storage::{self, Backend, KeySpace};

pub mod config;
pub(crate) mod handle;

pub use config::QueueConfig;
pub use handle::{JobHandle, RetryOutcome};

use handle::JobStore;

struct WorkerEntry {
    id: String,
    job_type: String,
    status: watch::Receiver<WorkerStatus>,
    signal: watch::Sender<WorkerSignal>,
    task: JoinHandle<()>,
}

struct SchedulerTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    id: String,
    config: QueueConfig,
    store: JobStore,
    workers: Mutex<Vec<WorkerEntry>>,
    scheduler: Mutex<Option<SchedulerTask>>,
    next_worker: AtomicUsize,
    shutting_down: AtomicBool,
}

impl Inner {
    fn workers(&self) -> MutexGuard<'_, Vec<WorkerEntry>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scheduler(&self) -> MutexGuard<'_, Option<SchedulerTask>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.workers().iter() {
            entry
                .signal
                .send_replace(WorkerSignal::Draining { deadline: None });
        }
        if let Some(scheduler) = self.scheduler().take() {
            scheduler.stop.send_replace(true);
        }
    }
}

/// Handle to a job queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("key_prefix", &self.inner.config.key_prefix)
            .finish()
    }
}

impl Queue {
    /// Connects to the configured store and subscribes to job events.
    pub async fn connect(config: QueueConfig) -> Result<Self> {
        let backend = storage::connect(&config.storage).await?;
        Self::with_backend(backend, config).await
    }

    /// Builds a queue on an existing backend.
    ///
    /// Queues sharing a backend and key prefix behave like processes sharing
    /// a store: each sees the others' jobs and events.
    pub async fn with_backend(backend: Arc<dyn Backend>, config: QueueConfig) -> Result<Self> {
        let keys = KeySpace::new(config.key_prefix.clone());
        let store = JobStore::new(backend, keys);
        store.events.start().await?;

        let id = format!(
            "{}:{}:{}",
            config.key_prefix,
            uuid::Uuid::new_v4().simple(),
            std::process::id()
        );
        info!(queue_id = %id, "Queue connected");

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                store,
                workers: Mutex::new(Vec::new()),
                scheduler: Mutex::new(None),
                next_worker: AtomicUsize::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Unique identity of this queue instance.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Creates an unsaved job with the queue's job defaults.
    pub fn create_job(&self, job_type: impl Into<String>, data: Value) -> JobHandle {
        let job = Job::with_defaults(job_type, data, &self.inner.config.job_defaults);
        self.inner.store.handle(job)
    }

    /// Loads a job by id.
    ///
    /// A missing job is [`QueueError::JobNotFound`], one without a type is
    /// [`QueueError::HalfBaked`]; either way its dangling index entries are
    /// purged.
    pub async fn get_job(&self, id: JobId) -> Result<JobHandle> {
        self.inner.store.fetch(id).await
    }

    pub async fn remove_job(&self, id: JobId) -> Result<()> {
        self.get_job(id).await?.remove().await
    }

    /// Every job type ever saved.
    pub async fn job_types(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .store
            .backend
            .smembers(&self.inner.store.keys.types())
            .await?)
    }

    /// Ids of jobs in `state`, lowest priority first.
    pub async fn state(&self, state: JobState) -> Result<Vec<JobId>> {
        self.inner.store.ids(state).await
    }

    pub async fn delayed(&self) -> Result<Vec<JobId>> {
        self.state(JobState::Delayed).await
    }

    pub async fn pending(&self) -> Result<Vec<JobId>> {
        self.state(JobState::Pending).await
    }

    pub async fn active(&self) -> Result<Vec<JobId>> {
        self.state(JobState::Active).await
    }

    pub async fn complete(&self) -> Result<Vec<JobId>> {
        self.state(JobState::Complete).await
    }

    pub async fn failed(&self) -> Result<Vec<JobId>> {
        self.state(JobState::Failed).await
    }

    /// Distributed lock bound to this queue's store and key prefix.
    pub fn lock(&self) -> DistributedLock {
        DistributedLock::new(
            Arc::clone(&self.inner.store.backend),
            self.inner.store.keys.clone(),
        )
    }

    /// Queue-level observer: every job event as `job <event>` plus queue
    /// errors. Without subscribers, errors go to the `tracing` error log.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.store.events.subscribe()
    }

    /// Status of every worker started by this queue.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.inner
            .workers()
            .iter()
            .map(|entry| WorkerInfo {
                id: entry.id.clone(),
                job_type: entry.job_type.clone(),
                status: *entry.status.borrow(),
            })
            .collect()
    }

    /// Starts `concurrency` workers (at least one) for `job_type`.
    pub async fn process_job<H>(&self, job_type: &str, concurrency: usize, handler: H) -> Result<()>
    where
        H: JobHandler,
    {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::AlreadyShuttingDown);
        }

        self.ensure_scheduler();

        let handler: Arc<dyn JobHandler> = Arc::new(handler);
        let mut workers = self.inner.workers();
        for _ in 0..concurrency.max(1) {
            let n = self.inner.next_worker.fetch_add(1, Ordering::SeqCst);
            let id = format!("{}:{}:{}", self.inner.id, job_type, n);
            let (signal, signal_rx) = watch::channel(WorkerSignal::Running);
            let (status_tx, status) = watch::channel(WorkerStatus::Idle);

            let task = Worker::new(
                id.clone(),
                job_type.to_string(),
                self.inner.store.clone(),
                Arc::clone(&handler),
                self.inner.config.block_timeout,
                signal_rx,
                status_tx,
            )
            .spawn();

            workers.push(WorkerEntry {
                id,
                job_type: job_type.to_string(),
                status,
                signal,
                task,
            });
        }

        info!(job_type, concurrency = concurrency.max(1), "Workers started");
        Ok(())
    }

    fn ensure_scheduler(&self) {
        let mut scheduler = self.inner.scheduler();
        if scheduler.is_some() {
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(
            DelayedJobScheduler::new(
                self.inner.store.clone(),
                self.inner.config.scheduler_interval,
            )
            .run(stop_rx),
        );
        *scheduler = Some(SchedulerTask { stop, task });
    }

    /// Runs one delayed-job sweep now and returns how many jobs became pending.
    pub async fn promote_delayed(&self) -> Result<usize> {
        DelayedJobScheduler::new(
            self.inner.store.clone(),
            self.inner.config.scheduler_interval,
        )
        .promote_due()
        .await
    }

    /// Stops workers, all of them or those of `job_type`.
    ///
    /// Workers finish their current job. With a `timeout`, a job still
    /// running when it elapses goes through the failure path with a
    /// "shutting down" error and its late completion is ignored. Returns once
    /// every affected worker has stopped. A full shutdown also stops the
    /// delayed-job scheduler; requesting one while another is in progress is
    /// [`QueueError::AlreadyShuttingDown`].
    pub async fn shutdown(&self, timeout: Option<Duration>, job_type: Option<&str>) -> Result<()> {
        let full = job_type.is_none();
        if full && self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyShuttingDown);
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let stopping: Vec<WorkerEntry> = {
            let mut workers = self.inner.workers();
            let (stopping, keep) = workers
                .drain(..)
                .partition(|entry| job_type.map_or(true, |t| entry.job_type == t));
            *workers = keep;
            stopping
        };

        info!(
            job_type = job_type.unwrap_or("*"),
            workers = stopping.len(),
            ?timeout,
            "Shutting down workers"
        );

        for entry in &stopping {
            entry
                .signal
                .send_replace(WorkerSignal::Draining { deadline });
        }

        let results = join_all(stopping.into_iter().map(|entry| {
            let id = entry.id;
            let task = entry.task;
            async move { (id, task.await) }
        }))
        .await;
        for (id, result) in results {
            match result {
                Ok(()) => debug!(worker_id = %id, "Worker joined"),
                Err(e) => error!(worker_id = %id, "Worker task ended abnormally: {}", e),
            }
        }

        if full {
            let scheduler = self.inner.scheduler().take();
            if let Some(scheduler) = scheduler {
                scheduler.stop.send_replace(true);
                if let Err(e) = scheduler.task.await {
                    error!("Scheduler task ended abnormally: {}", e);
                }
            }
            self.inner.shutting_down.store(false, Ordering::SeqCst);
        }

        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Priority;
    use crate::processing::Done;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    async fn queue() -> Queue {
        let config = QueueConfig::new()
            .with_key_prefix("unit")
            .with_block_timeout(Duration::from_millis(50));
        Queue::with_backend(Arc::new(MemoryBackend::new()), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_job_uses_defaults() {
        let mut defaults = crate::core::JobDefaults::default();
        defaults.priority = Priority::HIGH;
        defaults.max_attempts = 4;
        let config = QueueConfig::new().with_job_defaults(defaults);
        let queue = Queue::with_backend(Arc::new(MemoryBackend::new()), config)
            .await
            .unwrap();

        let job = queue.create_job("email", json!({"to": "a@b.c"}));
        assert!(job.id.is_none());
        assert_eq!(job.priority, Priority::HIGH);
        assert_eq!(job.max_attempts, 4);
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_queue_ids_are_unique() {
        let first = queue().await;
        let second = queue().await;
        assert_ne!(first.id(), second.id());
        assert!(first.id().starts_with("unit:"));
    }

    #[tokio::test]
    async fn test_job_types_and_state_listing() {
        let queue = queue().await;
        queue.create_job("email", json!({})).save().await.unwrap();
        queue.create_job("sms", json!({})).save().await.unwrap();

        let mut types = queue.job_types().await.unwrap();
        types.sort();
        assert_eq!(types, vec!["email", "sms"]);
        assert_eq!(queue.pending().await.unwrap().len(), 2);
        assert!(queue.active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_workers_report_status() {
        let queue = queue().await;
        queue
            .process_job("email", 3, |_job: JobHandle, done: Done| async move {
                done.complete(Value::Null);
            })
            .await
            .unwrap();

        let workers = queue.workers();
        assert_eq!(workers.len(), 3);
        assert!(workers.iter().all(|w| w.job_type == "email"));

        queue.shutdown(None, Some("email")).await.unwrap();
        assert!(queue.workers().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_shutdown_keeps_other_types() {
        let queue = queue().await;
        let handler = |_job: JobHandle, done: Done| async move {
            done.complete(Value::Null);
        };
        queue.process_job("email", 1, handler).await.unwrap();
        queue.process_job("sms", 2, handler).await.unwrap();

        queue.shutdown(None, Some("sms")).await.unwrap();
        let workers = queue.workers();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].job_type, "email");

        queue.shutdown(None, None).await.unwrap();
        assert!(queue.workers().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_full_shutdown_is_rejected() {
        let queue = queue().await;
        queue
            .process_job("slow", 1, |_job: JobHandle, done: Done| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                done.complete(Value::Null);
            })
            .await
            .unwrap();
        queue.create_job("slow", json!({})).save().await.unwrap();

        // Let the worker claim the job
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.shutdown(None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            queue.shutdown(None, None).await.unwrap_err(),
            QueueError::AlreadyShuttingDown
        );
        first.await.unwrap().unwrap();
    }
}

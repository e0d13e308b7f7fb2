//! Per-type worker loop
//!
//! A worker blocks on its type's notification list, pops the best-ranked
//! pending job on wake, runs the handler, and routes the outcome to
//! completion or the retry path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Done, HandlerResult, JobHandler};
use crate::core::{parse_job_id, JobId, JobState};
use crate::error::QueueError;
use crate::queue::handle::{JobStore, NOTIFY_TOKEN};
use crate::queue::JobHandle;

/// Error recorded on a job abandoned by a shutdown timeout
pub const SHUTDOWN_ERROR: &str = "shutting down";

/// What a worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "job_id", rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Waiting for a job
    Idle,
    Active(JobId),
    Stopped,
}

/// Snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub job_type: String,
    pub status: WorkerStatus,
}

/// Instruction from the queue to its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerSignal {
    Running,
    /// Finish the current job; give up on it at `deadline`
    Draining { deadline: Option<Instant> },
}

enum Outcome {
    Resolved(HandlerResult),
    /// The handler dropped its `Done` without resolving it
    Dropped,
    TimedOut,
}

pub(crate) struct Worker {
    id: String,
    job_type: String,
    store: JobStore,
    handler: Arc<dyn JobHandler>,
    block_timeout: Duration,
    signal: watch::Receiver<WorkerSignal>,
    signal_closed: bool,
    status: watch::Sender<WorkerStatus>,
}

impl Worker {
    pub(crate) fn new(
        id: String,
        job_type: String,
        store: JobStore,
        handler: Arc<dyn JobHandler>,
        block_timeout: Duration,
        signal: watch::Receiver<WorkerSignal>,
        status: watch::Sender<WorkerStatus>,
    ) -> Self {
        Self {
            id,
            job_type,
            store,
            handler,
            block_timeout,
            signal,
            signal_closed: false,
            status,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn is_running(&self) -> bool {
        matches!(*self.signal.borrow(), WorkerSignal::Running)
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.send_replace(status);
    }

    fn report(&self, err: QueueError) {
        error!(worker_id = %self.id, "Worker error: {}", err);
        self.store.events.report(&err);
    }

    /// Short randomized pause after a wake that found nothing to claim.
    async fn backoff(&self) {
        let pause = Duration::from_millis(fastrand::u64(5..=25));
        tokio::time::sleep(pause).await;
    }

    /// Returns a popped job that could not be claimed to the pending set.
    async fn requeue(&self, id: JobId, score: f64) {
        match self.store.requeue(&self.job_type, id, score).await {
            Ok(()) => debug!(worker_id = %self.id, job_id = id, "Job returned to pending"),
            Err(e) => {
                error!(worker_id = %self.id, job_id = id, "Could not return job to pending: {}", e);
                self.store.events.report(&e);
            }
        }
    }

    /// Hands a consumed wake-up back so another waiter can claim the job.
    async fn return_token(&self, notify_key: &str) {
        if let Err(e) = self.store.backend.lpush(notify_key, NOTIFY_TOKEN).await {
            warn!(worker_id = %self.id, "Could not return notification token: {}", e);
        }
    }

    async fn run(mut self) {
        info!(worker_id = %self.id, job_type = %self.job_type, "Worker started");

        let notify_key = self.store.keys.notify(&self.job_type);
        let pending_key = self
            .store
            .keys
            .type_state(&self.job_type, JobState::Pending);

        while self.is_running() {
            self.set_status(WorkerStatus::Idle);

            match self
                .store
                .backend
                .blocking_pop(&notify_key, self.block_timeout)
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    self.report(e.into());
                    self.backoff().await;
                    continue;
                }
            }

            if !self.is_running() {
                self.return_token(&notify_key).await;
                break;
            }

            let (member, score) = match self.store.backend.zpopmax(&pending_key).await {
                Ok(Some(popped)) => popped,
                Ok(None) => {
                    debug!(worker_id = %self.id, "Woke with nothing pending");
                    self.backoff().await;
                    continue;
                }
                Err(e) => {
                    self.report(e.into());
                    self.return_token(&notify_key).await;
                    self.backoff().await;
                    continue;
                }
            };

            let id = match parse_job_id(&member) {
                Ok(id) => id,
                Err(e) => {
                    self.report(e);
                    continue;
                }
            };
            match self.store.fetch(id).await {
                Ok(job) => self.process(job, score).await,
                Err(e) => {
                    let transient = e.is_storage_error();
                    self.report(e);
                    if transient {
                        self.requeue(id, score).await;
                        self.backoff().await;
                    }
                }
            }
        }

        self.set_status(WorkerStatus::Stopped);
        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&mut self, mut job: JobHandle, score: f64) {
        let Some(id) = job.id else {
            return;
        };
        self.set_status(WorkerStatus::Active(id));

        if let Err(e) = job.activate(&self.id).await {
            error!(worker_id = %self.id, job_id = id, "Could not claim job: {}", e);
            self.store.events.report(&e);
            self.requeue(id, score).await;
            self.backoff().await;
            return;
        }
        debug!(worker_id = %self.id, job_id = id, "Job claimed");

        let (done, receiver) = Done::new();
        let handler = Arc::clone(&self.handler);
        let handler_job = job.clone();
        let task = tokio::spawn(async move { handler.handle(handler_job, done).await });

        let result = match self.await_outcome(receiver).await {
            Outcome::Resolved(Ok(result)) => job.complete(result).await,
            Outcome::Resolved(Err(err)) => job.failed_attempt(&err.to_string()).await.map(|_| ()),
            Outcome::Dropped => {
                let reason = if task.is_finished() {
                    match task.await {
                        Err(e) if e.is_panic() => "job handler panicked",
                        _ => "job handler returned without resolving the job",
                    }
                } else {
                    "job handler dropped its completion handle"
                };
                job.failed_attempt(reason).await.map(|_| ())
            }
            Outcome::TimedOut => {
                warn!(worker_id = %self.id, job_id = id, "Shutdown timeout reached, failing job");
                let result = job.failed_attempt(SHUTDOWN_ERROR).await.map(|_| ());
                job.clear_listeners();
                result
            }
        };

        // Store failures were already emitted as job error events.
        if let Err(e) = result {
            debug!(worker_id = %self.id, job_id = id, "Could not record job outcome: {}", e);
        }
    }

    async fn await_outcome(&mut self, receiver: oneshot::Receiver<HandlerResult>) -> Outcome {
        tokio::pin!(receiver);
        loop {
            let deadline = match *self.signal.borrow() {
                WorkerSignal::Draining { deadline } => deadline,
                WorkerSignal::Running => None,
            };

            tokio::select! {
                resolved = &mut receiver => {
                    return match resolved {
                        Ok(result) => Outcome::Resolved(result),
                        Err(_) => Outcome::Dropped,
                    };
                }
                _ = sleep_until(deadline) => return Outcome::TimedOut,
                changed = self.signal.changed(), if !self.signal_closed => {
                    if changed.is_err() {
                        self.signal_closed = true;
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Job, Priority};
    use crate::storage::testing::FlakyBackend;
    use crate::storage::{Backend, KeySpace, MemoryBackend};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Harness {
        store: JobStore,
        signal: watch::Sender<WorkerSignal>,
        status: watch::Receiver<WorkerStatus>,
        handle: JoinHandle<()>,
    }

    fn start<H: JobHandler>(store: &JobStore, handler: H) -> Harness {
        let (signal, signal_rx) = watch::channel(WorkerSignal::Running);
        let (status_tx, status) = watch::channel(WorkerStatus::Idle);
        let worker = Worker::new(
            "w:test:1".into(),
            "test".into(),
            store.clone(),
            Arc::new(handler),
            Duration::from_millis(50),
            signal_rx,
            status_tx,
        );
        Harness {
            store: store.clone(),
            signal,
            status,
            handle: worker.spawn(),
        }
    }

    fn store() -> JobStore {
        JobStore::new(Arc::new(MemoryBackend::new()), KeySpace::new("w"))
    }

    #[tokio::test]
    async fn test_worker_claims_highest_priority_first() {
        let store = store();
        for priority in [Priority::LOW, Priority::HIGH, Priority::NORMAL] {
            let mut job = store.handle(Job::new("test", json!({})));
            job.set_priority(priority);
            job.save().await.unwrap();
        }

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let harness = start(&store, move |job: JobHandle, done: Done| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(job.priority);
                done.complete(Value::Null);
            }
        });

        let mut order = Vec::new();
        for _ in 0..3 {
            let priority = timeout(Duration::from_secs(2), seen.recv())
                .await
                .unwrap()
                .unwrap();
            order.push(priority);
        }
        assert_eq!(order, vec![Priority::HIGH, Priority::NORMAL, Priority::LOW]);

        harness.signal.send_replace(WorkerSignal::Draining { deadline: None });
        timeout(Duration::from_secs(1), harness.handle).await.unwrap().unwrap();
        assert_eq!(*harness.status.borrow(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stopped_worker_leaves_jobs_pending() {
        let store = store();
        let harness = start(&store, |_job: JobHandle, done: Done| async move {
            done.complete(Value::Null);
        });

        harness.signal.send_replace(WorkerSignal::Draining { deadline: None });
        timeout(Duration::from_secs(1), harness.handle).await.unwrap().unwrap();

        // Nothing was claimed after the stop, so the job is still pending
        let mut job = harness.store.handle(Job::new("test", json!({})));
        job.save().await.unwrap();
        assert_eq!(
            harness.store.ids(JobState::Pending).await.unwrap(),
            vec![job.id.unwrap()]
        );
    }

    #[tokio::test]
    async fn test_dropped_done_fails_attempt() {
        let store = store();
        let mut job = store.handle(Job::new("test", json!({})));
        job.set_remove_on_complete(false);
        job.save().await.unwrap();
        let id = job.id.unwrap();

        let harness = start(&store, |_job: JobHandle, done: Done| async move {
            drop(done);
        });

        let mut failed = Vec::new();
        for _ in 0..100 {
            failed = store.ids(JobState::Failed).await.unwrap();
            if !failed.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(failed, vec![id]);

        let job = store.fetch(id).await.unwrap();
        assert_eq!(job.attempts, 1);
        harness.handle.abort();
    }

    #[tokio::test]
    async fn test_failed_claim_returns_job_to_pending() {
        let backend = Arc::new(FlakyBackend::new());
        let store = JobStore::new(backend.clone(), KeySpace::new("w"));
        let mut job = store.handle(Job::new("test", json!({})));
        job.set_remove_on_complete(false);
        job.save().await.unwrap();
        let id = job.id.unwrap();

        // The first claim batch fails after the job was popped
        backend.fail_next_execs(1);
        let harness = start(&store, |_job: JobHandle, done: Done| async move {
            done.complete(json!("ok"));
        });

        let mut complete = Vec::new();
        for _ in 0..200 {
            complete = store.ids(JobState::Complete).await.unwrap();
            if !complete.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(complete, vec![id]);
        assert!(backend.zrange("w:jobs:test:pending").await.unwrap().is_empty());

        let job = store.fetch(id).await.unwrap();
        assert_eq!(job.result, json!("ok"));
        assert_eq!(job.attempts, 1);
        harness.handle.abort();
    }
}

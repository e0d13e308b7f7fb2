//! Store-backed job handle and its atomic state transitions.

use chrono::Utc;
use serde_json::Value;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::core::job::{fields, now};
use crate::core::{parse_job_id, Job, JobId, JobState};
use crate::error::{QueueError, Result};
use crate::events::{EventBus, EventChannel, JobEvent};
use crate::storage::{Backend, Batch, KeySpace};

/// Placeholder pushed on a type's notification list for each pending job
pub(crate) const NOTIFY_TOKEN: &str = "1";

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The job will become pending again after `delay`
    Retrying { attempts: u32, delay: Duration },
    /// No attempts left; the job stays failed
    Exhausted { attempts: u32 },
}

/// Store access shared by every handle of one queue.
#[derive(Clone)]
pub(crate) struct JobStore {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) keys: KeySpace,
    pub(crate) events: Arc<EventBus>,
}

impl JobStore {
    pub(crate) fn new(backend: Arc<dyn Backend>, keys: KeySpace) -> Self {
        let events = EventBus::new(Arc::clone(&backend), &keys);
        Self {
            backend,
            keys,
            events,
        }
    }

    pub(crate) fn handle(&self, job: Job) -> JobHandle {
        JobHandle {
            job,
            store: self.clone(),
            events: EventChannel::new(),
        }
    }

    /// Loads a job record.
    ///
    /// A missing or half-baked record is reported as such after its dangling
    /// index entries are purged.
    pub(crate) async fn load(&self, id: JobId) -> Result<Job> {
        let record = self.backend.hgetall(&self.keys.job(id)).await?;
        match Job::from_fields(id, &record) {
            Ok(job) => Ok(job),
            Err(err) if err.is_integrity_error() => {
                warn!(job_id = id, "Purging dangling job entries: {}", err);
                self.purge_dangling(id).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn fetch(&self, id: JobId) -> Result<JobHandle> {
        Ok(self.handle(self.load(id).await?))
    }

    async fn purge_dangling(&self, id: JobId) {
        let types = match self.backend.smembers(&self.keys.types()).await {
            Ok(types) => types,
            Err(e) => {
                warn!(job_id = id, "Could not list job types for cleanup: {}", e);
                Vec::new()
            }
        };

        let member = id.to_string();
        let mut batch = Batch::new()
            .zrem(self.keys.all_jobs(), &member)
            .zrem(self.keys.delayed_due(), &member)
            .del(self.keys.job(id));
        for state in JobState::ALL {
            batch = batch.zrem(self.keys.state(state), &member);
            for job_type in &types {
                batch = batch.zrem(self.keys.type_state(job_type, state), &member);
            }
        }

        if let Err(e) = self.backend.exec(batch).await {
            warn!(job_id = id, "Cleanup of dangling job failed: {}", e);
        }
    }

    /// Puts a claimed member back on its type's pending set and re-posts its
    /// wake-up, in one batch.
    pub(crate) async fn requeue(&self, job_type: &str, id: JobId, score: f64) -> Result<()> {
        let batch = Batch::new()
            .zadd(self.keys.type_state(job_type, JobState::Pending), id.to_string(), score)
            .lpush(self.keys.notify(job_type), NOTIFY_TOKEN);
        self.backend.exec(batch).await?;
        Ok(())
    }

    /// Ids in the global collection for `state`, lowest priority first.
    pub(crate) async fn ids(&self, state: JobState) -> Result<Vec<JobId>> {
        let members = self.backend.zrange(&self.keys.state(state)).await?;
        Ok(members
            .iter()
            .filter_map(|member| match parse_job_id(member) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!("Skipping malformed {} entry: {}", state, e);
                    None
                }
            })
            .collect())
    }
}

/// A job bound to the queue's store.
///
/// Dereferences to [`Job`], so fields and setters are available directly;
/// changes reach the store on [`save`](JobHandle::save) or
/// [`apply`](JobHandle::apply). Each handle owns an event channel that
/// receives the job's lifecycle events from every process once the job is
/// saved or subscribed to.
#[derive(Clone)]
pub struct JobHandle {
    job: Job,
    store: JobStore,
    events: EventChannel<JobEvent>,
}

impl Deref for JobHandle {
    type Target = Job;

    fn deref(&self) -> &Job {
        &self.job
    }
}

impl DerefMut for JobHandle {
    fn deref_mut(&mut self) -> &mut Job {
        &mut self.job
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("job", &self.job).finish()
    }
}

impl JobHandle {
    /// Serializable view of every field.
    pub fn snapshot(&self) -> Job {
        self.job.clone()
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// Receives this job's lifecycle events.
    ///
    /// Nothing more is delivered after `complete` or `failed`.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        let receiver = self.events.subscribe();
        if let Some(id) = self.job.id {
            self.store.events.register(id, &self.events);
        }
        receiver
    }

    /// Detaches every listener of this handle.
    pub fn clear_listeners(&self) {
        if let Some(id) = self.job.id {
            self.store.events.unregister(id, &self.events);
        }
        self.events.clear();
    }

    /// Persists the job.
    ///
    /// The first save allocates an id, then writes the whole record,
    /// registers the type and enters the current state in one batch. Later
    /// saves apply the mutable fields and re-enter the current state. A
    /// failed first save leaves the handle unsaved.
    pub async fn save(&mut self) -> Result<()> {
        if self.job.id.is_some() {
            return self.apply().await;
        }

        let raw = self.store.backend.incr(&self.store.keys.ids()).await?;
        let id = JobId::try_from(raw)
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| QueueError::InvalidJobId {
                value: raw.to_string(),
            })?;
        self.job.id = Some(id);
        self.store.events.register(id, &self.events);

        let batch = Batch::new()
            .hset_all(self.store.keys.job(id), self.job.immutable_fields())
            .sadd(self.store.keys.types(), self.job.job_type.as_str());
        if let Err(err) = self.persist(batch, self.job.state).await {
            self.store.events.unregister(id, &self.events);
            self.job.id = None;
            return Err(err);
        }

        info!(job_id = id, job_type = %self.job.job_type, "Job created");
        Ok(())
    }

    /// Saves the job so it runs: pending, or delayed when it has a delay.
    pub async fn run(&mut self) -> Result<()> {
        let target = if self.job.delay > 0 {
            JobState::Delayed
        } else {
            JobState::Pending
        };
        if self.job.id.is_none() {
            self.job.state = target;
            return self.save().await;
        }
        self.apply_as(target).await
    }

    /// Writes the mutable fields and re-enters the current state.
    pub async fn apply(&mut self) -> Result<()> {
        self.apply_as(self.job.state).await
    }

    async fn apply_as(&mut self, target: JobState) -> Result<()> {
        self.persist(Batch::new(), target).await
    }

    /// Adds the mutable fields and the move to `target` to `batch`, then
    /// commits it.
    async fn persist(&mut self, batch: Batch, target: JobState) -> Result<()> {
        let id = self.job.require_id()?;
        let batch = batch
            .hset_all(self.store.keys.job(id), self.job.mutable_fields())
            .zadd(
                self.store.keys.all_jobs(),
                id.to_string(),
                self.job.priority.score(),
            );
        let batch = self.transition(batch, target)?;
        self.commit(batch, target).await
    }

    /// Moves the job to `target` in one atomic batch.
    ///
    /// On a store failure an `error` event is emitted and the in-memory
    /// state is left unchanged.
    pub async fn set_state(&mut self, target: JobState) -> Result<()> {
        let batch = self.transition(Batch::new(), target)?;
        self.commit(batch, target).await
    }

    /// Re-reads every field from the store.
    pub async fn refresh(&mut self) -> Result<()> {
        let id = self.job.require_id()?;
        self.job = self.store.load(id).await?;
        Ok(())
    }

    /// Deletes the record and every index entry, then emits `remove`.
    pub async fn remove(&self) -> Result<()> {
        self.purge().await?;
        self.emit(JobEvent::Remove {
            job_type: self.job.job_type.clone(),
        })
        .await;
        Ok(())
    }

    /// Claims the job for a worker and emits `start`.
    pub(crate) async fn activate(&mut self, worker_id: &str) -> Result<()> {
        let id = self.job.require_id()?;
        let batch = Batch::new().hset(self.store.keys.job(id), fields::WORKER_ID, worker_id);
        let batch = self.transition(batch, JobState::Active)?;
        self.commit(batch, JobState::Active).await?;
        self.job.worker_id = Some(worker_id.to_string());

        self.emit(JobEvent::Start {
            job_type: self.job.job_type.clone(),
        })
        .await;
        Ok(())
    }

    /// Records a successful attempt and emits `complete`.
    ///
    /// A job marked remove-on-complete is deleted before the event goes out.
    pub(crate) async fn complete(&mut self, result: Value) -> Result<()> {
        let id = self.job.require_id()?;
        let finished = now();
        let attempts = self.job.attempts + 1;

        let key = self.store.keys.job(id);
        let batch = Batch::new()
            .hset(&key, fields::RESULT, result.to_string())
            .hset(&key, fields::FINISHED, finished.timestamp_millis().to_string())
            .hset(&key, fields::ATTEMPTS, attempts.to_string());
        let batch = self.transition(batch, JobState::Complete)?;
        self.commit(batch, JobState::Complete).await?;

        self.job.result = result.clone();
        self.job.finished = Some(finished);
        self.job.attempts = attempts;
        info!(job_id = id, job_type = %self.job.job_type, attempts, "Job completed");

        let removed = self.job.remove_on_complete;
        if removed {
            self.purge().await?;
        }
        self.emit(JobEvent::Complete { result }).await;
        if removed {
            self.emit(JobEvent::Remove {
                job_type: self.job.job_type.clone(),
            })
            .await;
        }
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// Emits `error` and counts the attempt. With attempts left the job is
    /// delayed by its timeout and `failed attempt` is emitted; otherwise it
    /// moves to failed and `failed` is emitted. Either way the store is
    /// updated in one batch, and a failed batch leaves the job as it was.
    pub(crate) async fn failed_attempt(&mut self, error: &str) -> Result<RetryOutcome> {
        let id = self.job.require_id()?;
        self.emit(JobEvent::Error {
            message: error.to_string(),
        })
        .await;

        let attempts = self.job.attempts + 1;
        let exhausted = attempts >= self.job.max_attempts;
        let finished = now();

        let key = self.store.keys.job(id);
        let batch = Batch::new().hset(&key, fields::ATTEMPTS, attempts.to_string());

        if exhausted {
            let batch =
                batch.hset(&key, fields::FINISHED, finished.timestamp_millis().to_string());
            let batch = self.transition(batch, JobState::Failed)?;
            self.commit(batch, JobState::Failed).await?;
            self.job.attempts = attempts;
            self.job.finished = Some(finished);
            warn!(job_id = id, attempts, "Job failed: {}", error);
            self.emit(JobEvent::Failed {
                error: error.to_string(),
            })
            .await;
            return Ok(RetryOutcome::Exhausted { attempts });
        }

        // The due score is computed from the retry delay
        let previous_delay = std::mem::replace(&mut self.job.delay, self.job.timeout);
        let batch = batch.hset(&key, fields::DELAY, self.job.delay.to_string());
        let committed = match self.transition(batch, JobState::Delayed) {
            Ok(batch) => self.commit(batch, JobState::Delayed).await,
            Err(err) => Err(err),
        };
        if let Err(err) = committed {
            self.job.delay = previous_delay;
            return Err(err);
        }
        self.job.attempts = attempts;

        let delay = Duration::from_millis(self.job.delay);
        info!(job_id = id, attempts, ?delay, "Job attempt failed, retrying: {}", error);
        self.emit(JobEvent::FailedAttempt {
            error: error.to_string(),
            attempts,
        })
        .await;
        Ok(RetryOutcome::Retrying { attempts, delay })
    }

    /// Appends the index moves for `current -> target` to `batch`.
    fn transition(&self, mut batch: Batch, target: JobState) -> Result<Batch> {
        let id = self.job.require_id()?;
        let keys = &self.store.keys;
        let job_type = self.job.job_type.as_str();
        let member = id.to_string();
        let score = self.job.priority.score();
        let current = self.job.state;

        if current != target {
            batch = batch
                .zrem(keys.state(current), &member)
                .zrem(keys.type_state(job_type, current), &member);
            if current == JobState::Delayed {
                batch = batch.zrem(keys.delayed_due(), &member);
            }
        }

        batch = batch
            .hset(keys.job(id), fields::STATE, target.name())
            .zadd(keys.state(target), &member, score)
            .zadd(keys.type_state(job_type, target), &member, score);

        match target {
            JobState::Pending => {
                batch = batch.lpush(keys.notify(job_type), NOTIFY_TOKEN);
            }
            JobState::Delayed => {
                let delay = i64::try_from(self.job.delay).unwrap_or(i64::MAX);
                let due = Utc::now().timestamp_millis().saturating_add(delay);
                batch = batch.zadd(keys.delayed_due(), &member, due as f64);
            }
            _ => {}
        }

        Ok(batch)
    }

    async fn commit(&mut self, batch: Batch, target: JobState) -> Result<()> {
        let id = self.job.require_id()?;
        if let Err(e) = self.store.backend.exec(batch).await {
            let err = QueueError::from(e);
            error!(job_id = id, "Failed to move job to {}: {}", target, err);
            self.emit(JobEvent::Error {
                message: err.to_string(),
            })
            .await;
            return Err(err);
        }

        let previous = std::mem::replace(&mut self.job.state, target);
        debug!(job_id = id, from = %previous, to = %target, "Job state changed");

        if target == JobState::Pending {
            self.emit(JobEvent::Enqueue {
                job_type: self.job.job_type.clone(),
            })
            .await;
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        let id = self.job.require_id()?;
        let keys = &self.store.keys;
        let member = id.to_string();

        let mut batch = Batch::new()
            .zrem(keys.all_jobs(), &member)
            .zrem(keys.delayed_due(), &member);
        for state in JobState::ALL {
            batch = batch
                .zrem(keys.state(state), &member)
                .zrem(keys.type_state(&self.job.job_type, state), &member);
        }
        batch = batch.del(keys.job(id));

        if let Err(e) = self.store.backend.exec(batch).await {
            let err = QueueError::from(e);
            error!(job_id = id, "Failed to remove job: {}", err);
            self.emit(JobEvent::Error {
                message: err.to_string(),
            })
            .await;
            return Err(err);
        }
        info!(job_id = id, "Job removed");
        Ok(())
    }

    /// Publishes an event, falling back to local delivery when the store
    /// cannot be reached.
    async fn emit(&self, event: JobEvent) {
        let Some(id) = self.job.id else {
            return;
        };
        if let Err(e) = self.store.events.emit(id, &event).await {
            warn!(job_id = id, "Publishing {} event failed, delivering locally: {}", event, e);
            self.store.events.dispatch(id, event);
        }
    }
}

//! Scheduler for delayed jobs
//!
//! Delayed jobs sit in a due set scored by the time they become eligible.
//! The scheduler sweeps that set on an interval and moves every due job to
//! pending. Removing an entry from the due set is the claim: when several
//! processes sweep at once, only the one whose removal succeeds promotes it.
//! When the store fails after the claim, the entry is put back for the next
//! sweep.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::{parse_job_id, JobState};
use crate::error::Result;
use crate::queue::handle::JobStore;

/// Promotes due delayed jobs to pending.
pub struct DelayedJobScheduler {
    store: JobStore,
    poll_interval: Duration,
}

impl DelayedJobScheduler {
    pub(crate) fn new(store: JobStore, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Sweeps until `stop` turns true or its sender is dropped.
    pub(crate) async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            "Starting delayed job scheduler with poll interval: {:?}",
            self.poll_interval
        );

        let mut ticker = interval(self.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.promote_due().await {
                        error!("Error promoting delayed jobs: {}", e);
                        self.store.events.report(&e);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Delayed job scheduler stopped");
    }

    /// Moves every due delayed job to pending and returns how many moved.
    pub async fn promote_due(&self) -> Result<usize> {
        let due_key = self.store.keys.delayed_due();
        let now = Utc::now().timestamp_millis() as f64;
        let due = self.store.backend.zrangebyscore(&due_key, now).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!("Found {} delayed jobs ready for promotion", due.len());

        let mut promoted = 0;
        for member in due {
            if !self.store.backend.zrem(&due_key, &member).await? {
                // Another process claimed it
                continue;
            }

            let id = match parse_job_id(&member) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Dropping malformed delayed entry: {}", e);
                    continue;
                }
            };

            let mut job = match self.store.fetch(id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = id, "Skipping delayed job: {}", e);
                    if e.is_storage_error() {
                        self.unclaim(&due_key, &member, now).await;
                    }
                    continue;
                }
            };

            if job.state != JobState::Delayed {
                debug!(job_id = id, state = %job.state, "Job left delayed state, not promoting");
                continue;
            }

            match job.set_state(JobState::Pending).await {
                Ok(()) => {
                    debug!(job_id = id, "Delayed job promoted");
                    promoted += 1;
                }
                Err(e) => {
                    error!(job_id = id, "Failed to promote delayed job: {}", e);
                    if e.is_storage_error() {
                        self.unclaim(&due_key, &member, now).await;
                    }
                }
            }
        }

        Ok(promoted)
    }

    /// Restores a claimed due entry so a later sweep retries it.
    async fn unclaim(&self, due_key: &str, member: &str, due: f64) {
        if let Err(e) = self.store.backend.zadd(due_key, member, due).await {
            error!(member, "Could not restore delayed entry: {}", e);
            self.store.events.report(&e.into());
        }
    }
}

//! Job Processing Engine
//!
//! This module contains the per-type worker loop, the handler trait user code
//! implements, and the scheduler that promotes delayed jobs once they are due.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use tokio::sync::oneshot;

use crate::error::QueueError;
use crate::queue::JobHandle;

pub mod scheduler;
pub mod worker;

pub use scheduler::DelayedJobScheduler;
pub use worker::{WorkerInfo, WorkerStatus};

/// Outcome reported by a handler
pub type HandlerResult = std::result::Result<Value, QueueError>;

/// Trait for executing jobs
///
/// A worker calls [`handle`](JobHandler::handle) once per claimed job and
/// waits until the [`Done`] handle is resolved. The handle may be passed to
/// spawned tasks; dropping it unresolved fails the attempt.
///
/// Any `Fn(JobHandle, Done) -> impl Future<Output = ()>` closure is a handler:
///
/// ```rust
/// use prioq::processing::{Done, JobHandler};
/// use prioq::JobHandle;
/// use serde_json::json;
///
/// fn assert_handler<H: JobHandler>(_: H) {}
///
/// assert_handler(|job: JobHandle, done: Done| async move {
///     let words: Vec<String> = serde_json::from_value(job.data.clone()).unwrap_or_default();
///     done.complete(json!(words.join(" ")));
/// });
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: JobHandle, done: Done);
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobHandle, Done) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, job: JobHandle, done: Done) {
        (self)(job, done).await
    }
}

/// Completion callback handed to a [`JobHandler`].
///
/// Resolving consumes the handle, so a job is resolved at most once. A
/// resolution that arrives after the worker gave up on the job (shutdown
/// timeout) is ignored.
#[must_use = "a job is only resolved when `Done` is completed or failed"]
pub struct Done {
    sender: oneshot::Sender<HandlerResult>,
}

impl Done {
    pub(crate) fn new() -> (Self, oneshot::Receiver<HandlerResult>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    /// Marks the job complete with `result`.
    pub fn complete(self, result: impl Into<Value>) {
        self.finish(Ok(result.into()));
    }

    /// Fails this attempt; the job is retried while attempts remain.
    pub fn fail(self, error: impl fmt::Display) {
        self.finish(Err(QueueError::handler(error.to_string())));
    }

    pub fn finish(self, result: HandlerResult) {
        // The worker stopped listening; nothing to resolve.
        let _ = self.sender.send(result);
    }

    /// Whether the worker has stopped waiting for this job.
    pub fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_done_delivers_result() {
        let (done, receiver) = Done::new();
        done.complete(json!("a b"));
        assert_eq!(receiver.await.unwrap(), Ok(json!("a b")));
    }

    #[tokio::test]
    async fn test_done_fail_wraps_message() {
        let (done, receiver) = Done::new();
        done.fail("smtp timeout");
        assert_eq!(
            receiver.await.unwrap(),
            Err(QueueError::handler("smtp timeout"))
        );
    }

    #[tokio::test]
    async fn test_dropped_done_closes_channel() {
        let (done, receiver) = Done::new();
        drop(done);
        assert!(receiver.await.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_done_is_ignored() {
        let (done, receiver) = Done::new();
        drop(receiver);
        assert!(done.is_abandoned());
        done.complete(json!(1));
    }
}

//! Cross-process lifecycle event bus.
//!
//! Every lifecycle change is published on the store's shared events channel
//! as an [`EventMessage`]. Each process runs one subscriber that routes
//! incoming messages to:
//!
//! - the job handles registered locally for that job id, in registration
//!   order (a `complete` or `failed` event unregisters them), and
//! - the queue observer, as a [`QueueEvent`] named `job <event>`.
//!
//! Error events nobody observes are written to the `tracing` error log.
//!
//! When the subscription ends, the subscriber reports an error to the queue
//! observer and resubscribes with exponential backoff.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::core::JobId;
use crate::error::{QueueError, Result};
use crate::storage::{Backend, KeySpace, Subscription};

pub mod channel;
pub mod message;

pub use channel::EventChannel;
pub use message::{EventMessage, JobEvent, QueueEvent};

type Registry = HashMap<JobId, Vec<EventChannel<JobEvent>>>;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// Per-process end of the shared events channel.
pub struct EventBus {
    backend: Arc<dyn Backend>,
    channel: String,
    registry: Mutex<Registry>,
    observer: EventChannel<QueueEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(backend: Arc<dyn Backend>, keys: &KeySpace) -> Arc<Self> {
        Arc::new(Self {
            backend,
            channel: keys.events(),
            registry: Mutex::new(HashMap::new()),
            observer: EventChannel::new(),
            listener: Mutex::new(None),
        })
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to the events channel and starts routing messages.
    ///
    /// Returns once the subscription is confirmed, so every event published
    /// afterwards is delivered. Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let messages = self.backend.subscribe(&self.channel).await?;
        let handle = tokio::spawn(listen(
            Arc::downgrade(self),
            Arc::clone(&self.backend),
            self.channel.clone(),
            messages,
        ));

        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        match listener.as_ref() {
            // Lost a race with a concurrent start
            Some(existing) if !existing.is_finished() => handle.abort(),
            _ => *listener = Some(handle),
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops routing messages; registered handles stay registered.
    pub fn stop(&self) {
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Routes future events for `id` to `channel`. Registering the same
    /// channel twice has no effect.
    pub fn register(&self, id: JobId, channel: &EventChannel<JobEvent>) {
        let mut registry = self.registry();
        let handles = registry.entry(id).or_default();
        if !handles.iter().any(|existing| existing.id() == channel.id()) {
            handles.push(channel.clone());
        }
    }

    pub fn unregister(&self, id: JobId, channel: &EventChannel<JobEvent>) {
        let mut registry = self.registry();
        if let Some(handles) = registry.get_mut(&id) {
            handles.retain(|existing| existing.id() != channel.id());
            if handles.is_empty() {
                registry.remove(&id);
            }
        }
    }

    /// Number of local handles waiting on events for `id`.
    pub fn registered(&self, id: JobId) -> usize {
        self.registry().get(&id).map_or(0, Vec::len)
    }

    /// Publishes a job event to every process.
    pub async fn emit(&self, id: JobId, event: &JobEvent) -> Result<()> {
        let payload = event.to_message(id).encode()?;
        self.backend.publish(&self.channel, &payload).await?;
        Ok(())
    }

    /// Queue-level observer receiving every job event as `job <event>`.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.observer.subscribe()
    }

    /// Reports an error not tied to a job to the queue observer.
    pub fn report(&self, err: &QueueError) {
        self.notify_observer(QueueEvent::Error {
            message: err.to_string(),
        });
    }

    fn notify_observer(&self, event: QueueEvent) {
        let is_error = event.is_error();
        let delivered = self.observer.emit(event.clone());
        if delivered == 0 && is_error {
            match &event {
                QueueEvent::Job {
                    id,
                    event: JobEvent::Error { message },
                } => error!(job_id = id, "Job error: {}", message),
                QueueEvent::Error { message } => error!("Queue error: {}", message),
                QueueEvent::Job { .. } => {}
            }
        }
    }

    fn route(&self, payload: &str) {
        let message = match EventMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed event message: {}", e);
                return;
            }
        };
        let event = match JobEvent::from_message(&message) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring event message: {}", e);
                return;
            }
        };
        self.dispatch(message.id, event);
    }

    /// Delivers an event to local handles, then to the queue observer.
    pub(crate) fn dispatch(&self, id: JobId, event: JobEvent) {
        let handles = {
            let mut registry = self.registry();
            if event.is_terminal() {
                registry.remove(&id).unwrap_or_default()
            } else {
                registry.get(&id).cloned().unwrap_or_default()
            }
        };

        debug!(job_id = id, event = event.name(), handles = handles.len(), "Routing job event");
        for handle in &handles {
            handle.emit(event.clone());
        }

        self.notify_observer(QueueEvent::Job { id, event });
    }
}

/// Routes messages until the bus is dropped, resubscribing whenever the
/// subscription ends.
async fn listen(
    bus: Weak<EventBus>,
    backend: Arc<dyn Backend>,
    channel: String,
    mut messages: Subscription,
) {
    let mut backoff = RESUBSCRIBE_BACKOFF;
    loop {
        while let Some(payload) = messages.next().await {
            let Some(live) = bus.upgrade() else {
                return;
            };
            live.route(&payload);
            backoff = RESUBSCRIBE_BACKOFF;
        }

        warn!(channel = %channel, "Event subscription ended, resubscribing");
        match bus.upgrade() {
            Some(live) => live.report(&QueueError::Storage {
                message: format!("subscription to '{}' ended, resubscribing", channel),
            }),
            None => return,
        }

        messages = loop {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_RESUBSCRIBE_BACKOFF);
            if bus.strong_count() == 0 {
                return;
            }
            match backend.subscribe(&channel).await {
                Ok(messages) => break messages,
                Err(e) => match bus.upgrade() {
                    Some(live) => live.report(&e.into()),
                    None => return,
                },
            }
        };
        debug!(channel = %channel, "Event subscription restored");
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::FlakyBackend;
    use crate::storage::MemoryBackend;
    use serde_json::json;
    use tokio::time::timeout;

    async fn started_bus() -> Arc<EventBus> {
        let bus = EventBus::new(Arc::new(MemoryBackend::new()), &KeySpace::new("test"));
        bus.start().await.unwrap();
        bus
    }

    #[tokio::test]
    async fn test_event_reaches_registered_handle_and_observer() {
        let bus = started_bus().await;
        let handle = EventChannel::new();
        let mut job_events = handle.subscribe();
        let mut queue_events = bus.subscribe();
        bus.register(5, &handle);

        bus.emit(5, &JobEvent::Start { job_type: "t".into() })
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), job_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, JobEvent::Start { job_type: "t".into() });

        let observed = timeout(Duration::from_secs(1), queue_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observed.name(), "job start");
        assert_eq!(observed.job_id(), Some(5));
    }

    #[tokio::test]
    async fn test_terminal_event_unregisters() {
        let bus = started_bus().await;
        let handle = EventChannel::new();
        bus.register(8, &handle);
        bus.register(8, &handle);
        assert_eq!(bus.registered(8), 1);

        bus.dispatch(8, JobEvent::Complete { result: json!(1) });
        assert_eq!(bus.registered(8), 0);
    }

    #[tokio::test]
    async fn test_other_jobs_events_are_not_delivered() {
        let bus = started_bus().await;
        let handle = EventChannel::new();
        let mut job_events = handle.subscribe();
        bus.register(1, &handle);

        bus.dispatch(2, JobEvent::Remove { job_type: "t".into() });
        bus.dispatch(1, JobEvent::Remove { job_type: "t".into() });

        assert_eq!(
            job_events.recv().await.unwrap(),
            JobEvent::Remove { job_type: "t".into() }
        );
        assert!(job_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_ends_routing() {
        let bus = started_bus().await;
        bus.start().await.unwrap();
        assert!(bus.is_running());

        bus.stop();
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn test_lost_subscription_is_reported_and_restored() {
        let backend = Arc::new(FlakyBackend::new());
        let bus = EventBus::new(backend.clone(), &KeySpace::new("test"));
        bus.start().await.unwrap();
        let mut queue_events = bus.subscribe();

        backend.end_subscriptions();
        let reported = timeout(Duration::from_secs(1), queue_events.recv())
            .await
            .unwrap()
            .unwrap();
        match reported {
            QueueEvent::Error { message } => assert!(message.contains("resubscribing")),
            other => panic!("expected an error event, got {:?}", other),
        }
        assert!(bus.is_running());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let handle = EventChannel::new();
        let mut job_events = handle.subscribe();
        bus.register(3, &handle);
        bus.emit(3, &JobEvent::Start { job_type: "t".into() })
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), job_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, JobEvent::Start { job_type: "t".into() });
    }
}

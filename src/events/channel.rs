use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_CAPACITY: usize = 256;

/// Typed fan-out channel owned by a job handle or a queue.
///
/// Clones share the same listeners. Listeners receive events in emission
/// order; a listener that falls more than the channel capacity behind loses
/// the oldest events.
#[derive(Debug)]
pub struct EventChannel<E: Clone> {
    id: u64,
    sender: Arc<Mutex<broadcast::Sender<E>>>,
    capacity: usize,
}

impl<E: Clone> Clone for EventChannel<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: Arc::clone(&self.sender),
            capacity: self.capacity,
        }
    }
}

impl<E: Clone> EventChannel<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            sender: Arc::new(Mutex::new(sender)),
            capacity,
        }
    }

    /// Identity shared by all clones of this channel
    pub fn id(&self) -> u64 {
        self.id
    }

    fn sender(&self) -> broadcast::Sender<E> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender().subscribe()
    }

    /// Delivers an event to current listeners and returns how many got it.
    pub fn emit(&self, event: E) -> usize {
        self.sender().send(event).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.sender().receiver_count()
    }

    /// Detaches every current listener; their receivers end once drained.
    pub fn clear(&self) {
        let (sender, _) = broadcast::channel(self.capacity);
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }
}

impl<E: Clone> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_listener() {
        let channel = EventChannel::new();
        let mut first = channel.subscribe();
        let mut second = channel.clone().subscribe();

        assert_eq!(channel.emit("enqueue"), 2);
        assert_eq!(first.recv().await.unwrap(), "enqueue");
        assert_eq!(second.recv().await.unwrap(), "enqueue");
    }

    #[tokio::test]
    async fn test_emit_without_listeners() {
        let channel: EventChannel<u32> = EventChannel::new();
        assert_eq!(channel.emit(1), 0);
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_detaches_listeners() {
        let channel = EventChannel::new();
        let mut listener = channel.subscribe();

        channel.clear();
        assert_eq!(channel.emit(7), 0);
        assert!(matches!(
            listener.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn test_clones_share_identity() {
        let channel: EventChannel<u8> = EventChannel::new();
        let other: EventChannel<u8> = EventChannel::new();
        assert_eq!(channel.id(), channel.clone().id());
        assert_ne!(channel.id(), other.id());
    }
}

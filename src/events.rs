use std::fmt::Debug;

use tokio::sync::broadcast;
use tracing::trace;

/// A typed event broadcaster.
///
/// Every component owns one of these per event type.
/// Publishing never fails: having no subscribers is normal.
#[derive(Debug)]
pub struct Publisher<T> {
    tx: broadcast::Sender<T>,
}

impl<T> Publisher<T>
where
    T: Clone + Debug,
{
    /// Create a publisher which buffers at most `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Send an event to all current subscribers.
    pub fn publish(&self, event: T) {
        match self.tx.send(event) {
            Ok(listeners) => trace!("Broadcasted event to {listeners} listener(s)"),
            Err(broadcast::error::SendError(event)) => {
                trace!(?event, "No listeners for event")
            }
        }
    }

    /// How many subscribers are alive.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T> Default for Publisher<T>
where
    T: Clone + Debug,
{
    fn default() -> Self {
        Self::new(1024)
    }
}

use tokio::sync::broadcast;
use tracing::{trace, warn};

use herald_core::events::SystemEvent;

/// Fan-out of system events to connected observers.
///
/// Delivery is at-most-once and never blocks the publisher. Nothing is
/// persisted or replayed; a new observer starts from a snapshot.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<SystemEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current observer. Returns how many received it.
    pub fn broadcast(&self, event: SystemEvent) -> usize {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(n) => {
                trace!(event_type, observers = n, "event broadcast");
                n
            }
            // No observers connected.
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receive the next event, skipping over anything a slow observer missed.
/// Returns `None` once the channel is closed.
pub async fn next_event(rx: &mut broadcast::Receiver<SystemEvent>) -> Option<SystemEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "observer lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

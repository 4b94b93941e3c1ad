//! Core event bus
//!
//! Fan-out of [`CoreEvent`]s over `tokio::sync::broadcast`. Publishing never
//! blocks and never fails; with no subscribers the event is dropped.

use tokio::sync::broadcast;

use crate::models::CoreEvent;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        log::debug!("Publishing {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

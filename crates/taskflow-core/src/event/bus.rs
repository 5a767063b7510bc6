//! Broadcast event sink for distributing execution events to any number of
//! subscribers.
//!
//! Built on `tokio::sync::broadcast`. Emitting with no active subscribers is
//! a no-op; slow subscribers lag and lose the oldest events.

use taskflow_types::event::{EngineEvent, EventEnvelope};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::sink::EventSink;

pub struct BroadcastEventSink {
    sender: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, execution_id: Uuid, event: EngineEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(EventEnvelope::new(execution_id, event));
    }
}

impl Clone for BroadcastEventSink {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for BroadcastEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEventSink")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

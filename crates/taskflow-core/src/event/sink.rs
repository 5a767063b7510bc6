//! Event sink boundary.
//!
//! The scheduler pushes lifecycle notifications through an [`EventSink`].
//! Emitting is fire-and-forget: a slow, full or closed sink drops the event
//! and logs, it never blocks or fails the execution.

use taskflow_types::event::{EngineEvent, EventEnvelope};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

pub trait EventSink: Send + Sync {
    /// Must return immediately.
    fn emit(&self, execution_id: Uuid, event: EngineEvent);
}

/// Forwards envelopes into a bounded `mpsc` channel with `try_send`.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<EventEnvelope>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, execution_id: Uuid, event: EngineEvent) {
        let event_type = event.event_type();
        match self.sender.try_send(EventEnvelope::new(execution_id, event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%execution_id, event_type, "event sink full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(%execution_id, event_type, "event sink closed, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(task_id: &str) -> EngineEvent {
        EngineEvent::TaskReady {
            task_id: task_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelEventSink::new(8);
        let id = Uuid::now_v7();
        sink.emit(id, ready("a"));
        sink.emit(id, ready("b"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.execution_id, id);
        assert_eq!(first.event.task_id(), Some("a"));
        assert_eq!(rx.recv().await.unwrap().event.task_id(), Some("b"));
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (sink, mut rx) = ChannelEventSink::new(1);
        let id = Uuid::now_v7();
        sink.emit(id, ready("a"));
        sink.emit(id, ready("b"));
        assert_eq!(rx.try_recv().unwrap().event.task_id(), Some("a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (sink, rx) = ChannelEventSink::new(1);
        drop(rx);
        sink.emit(Uuid::now_v7(), ready("a"));
    }
}

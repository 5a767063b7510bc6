//! Lifecycle events pushed to the event sink.
//!
//! `EngineEvent` is what the scheduler announces while driving an execution.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ExecutionStatus, TaskError};

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The scheduler picked up a new (or restored) execution.
    ExecutionStarted {
        definition_id: String,
        definition_version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restored_from: Option<Uuid>,
    },

    ExecutionStatusChanged {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// All dependencies and gates satisfied; waiting for admission.
    TaskReady { task_id: String },

    TaskStarted { task_id: String, attempt: u32 },

    TaskCompleted {
        task_id: String,
        attempt: u32,
        duration_ms: u64,
    },

    TaskFailed {
        task_id: String,
        attempt: u32,
        error: TaskError,
        will_retry: bool,
    },

    TaskRetryScheduled {
        task_id: String,
        next_attempt: u32,
        delay_ms: u64,
    },

    TaskSkipped { task_id: String, reason: String },

    TransitionTaken { from: String, to: String },

    /// Global scope keys changed, by a task's `publish` block or an
    /// external `update_state` call.
    StateUpdated { keys: Vec<String> },

    CheckpointCreated { checkpoint_id: Uuid },

    /// Terminal status reached.
    ExecutionFinished {
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl EngineEvent {
    /// Wire name of the event, matching the serde tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::ExecutionStarted { .. } => "execution_started",
            EngineEvent::ExecutionStatusChanged { .. } => "execution_status_changed",
            EngineEvent::TaskReady { .. } => "task_ready",
            EngineEvent::TaskStarted { .. } => "task_started",
            EngineEvent::TaskCompleted { .. } => "task_completed",
            EngineEvent::TaskFailed { .. } => "task_failed",
            EngineEvent::TaskRetryScheduled { .. } => "task_retry_scheduled",
            EngineEvent::TaskSkipped { .. } => "task_skipped",
            EngineEvent::TransitionTaken { .. } => "transition_taken",
            EngineEvent::StateUpdated { .. } => "state_updated",
            EngineEvent::CheckpointCreated { .. } => "checkpoint_created",
            EngineEvent::ExecutionFinished { .. } => "execution_finished",
        }
    }

    /// Task id for task-scoped variants.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            EngineEvent::TaskReady { task_id }
            | EngineEvent::TaskStarted { task_id, .. }
            | EngineEvent::TaskCompleted { task_id, .. }
            | EngineEvent::TaskFailed { task_id, .. }
            | EngineEvent::TaskRetryScheduled { task_id, .. }
            | EngineEvent::TaskSkipped { task_id, .. } => Some(task_id),

            EngineEvent::ExecutionStarted { .. }
            | EngineEvent::ExecutionStatusChanged { .. }
            | EngineEvent::TransitionTaken { .. }
            | EngineEvent::StateUpdated { .. }
            | EngineEvent::CheckpointCreated { .. }
            | EngineEvent::ExecutionFinished { .. } => None,
        }
    }
}

/// An event tagged with the execution it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub execution_id: Uuid,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

impl EventEnvelope {
    pub fn new(execution_id: Uuid, event: EngineEvent) -> Self {
        Self {
            execution_id,
            emitted_at: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ErrorKind;

    #[test]
    fn test_event_type_matches_serde_tag() {
        let events = vec![
            EngineEvent::TaskReady {
                task_id: "a".to_string(),
            },
            EngineEvent::TaskFailed {
                task_id: "a".to_string(),
                attempt: 2,
                error: TaskError::new(ErrorKind::TaskTimeout, "slow"),
                will_retry: true,
            },
            EngineEvent::ExecutionFinished {
                status: ExecutionStatus::Completed,
                error: None,
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[test]
    fn test_envelope_flattens_event() {
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            EngineEvent::TransitionTaken {
                from: "fetch".to_string(),
                to: "process".to_string(),
            },
        );
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"transition_taken\""));
        let parsed: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event, envelope.event);
    }

    #[test]
    fn test_task_id_accessor() {
        let started = EngineEvent::TaskStarted {
            task_id: "fetch".to_string(),
            attempt: 1,
        };
        assert_eq!(started.task_id(), Some("fetch"));
        let updated = EngineEvent::StateUpdated { keys: vec![] };
        assert_eq!(updated.task_id(), None);
    }
}

//! Per-execution state and checkpoint records.
//!
//! `WorkflowState` is owned by exactly one execution. The engine only ever
//! mutates it through the state manager; everything else sees deep copies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{ErrorKind, ExecutionStatus, TaskRunState};

/// Key under which the per-task scopes appear in the `state` namespace.
pub const TASKS_KEY: &str = "tasks";

/// Key inside a task scope that holds the task's output.
pub const OUTPUT_KEY: &str = "output";

/// Global scope, per-task scope and the append-only history of one
/// execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Mutable by any task (via `publish`) and by external `update_state`.
    #[serde(default)]
    pub global: BTreeMap<String, Value>,
    /// Task id -> scope. Only written by that task's completion.
    #[serde(default)]
    pub tasks: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
}

impl WorkflowState {
    /// Output recorded in a task's scope, if any.
    pub fn task_output(&self, task_id: &str) -> Option<&Value> {
        self.tasks.get(task_id).and_then(|scope| scope.get(OUTPUT_KEY))
    }

    /// The JSON value exposed to expressions as the `state` root:
    /// global keys at the top level plus `tasks.<id>.<key>`.
    pub fn to_namespace(&self) -> Value {
        let mut root = serde_json::Map::new();
        for (key, value) in &self.global {
            root.insert(key.clone(), value.clone());
        }
        let tasks = self
            .tasks
            .iter()
            .map(|(id, scope)| {
                let scope: serde_json::Map<String, Value> =
                    scope.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                (id.clone(), Value::Object(scope))
            })
            .collect();
        root.insert(TASKS_KEY.to_string(), Value::Object(tasks));
        Value::Object(root)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One entry of the execution history. Sequence numbers are assigned by the
/// state manager and are strictly increasing per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub sequence: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: HistoryEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEventKind {
    TaskStarted {
        task_id: String,
        attempt: u32,
    },
    TaskCompleted {
        task_id: String,
        attempt: u32,
    },
    TaskFailed {
        task_id: String,
        attempt: u32,
        kind: ErrorKind,
        message: String,
    },
    TaskSkipped {
        task_id: String,
        reason: String,
    },
    TransitionTaken {
        from: String,
        to: String,
    },
    ErrorRouted {
        task_id: String,
        target: String,
        via: String,
    },
    StateUpdated {
        keys: Vec<String>,
    },
    ExecutionStatusChanged {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    CheckpointCreated {
        checkpoint_id: Uuid,
    },
    RestoredFromCheckpoint {
        checkpoint_id: Uuid,
        source_execution: Uuid,
    },
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Durable snapshot of an execution: enough to rebuild its state manager
/// and graph position in a fresh execution.
///
/// Immutable once created. `digest` is the SHA-256 of the record with an
/// empty digest field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub definition_id: String,
    pub definition_version: String,
    pub created_at: DateTime<Utc>,
    /// Execution status at capture time (informational).
    pub status: ExecutionStatus,
    /// The instant `now()` is bound to for this execution.
    pub execution_time: DateTime<Utc>,
    pub input: Value,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub state: WorkflowState,
    pub tasks: BTreeMap<String, TaskRunState>,
    #[serde(default)]
    pub digest: String,
}

//! Checkpoint manager: durable snapshots of an execution and the plan for
//! continuing one in a fresh execution.
//!
//! A checkpoint is a deep copy of the state manager's contents plus the
//! values an execution was started with. Records are sealed with a SHA-256
//! digest over their JSON form (digest field empty) and verified on load, so
//! a damaged record fails the restore instead of seeding a broken run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use taskflow_types::error::StorageError;
use taskflow_types::state::{Checkpoint, HistoryEvent, HistoryEventKind};
use taskflow_types::workflow::{
    ExecutionStatus, SkipCause, TaskRunState, TaskRunStatus, WorkflowExecution,
};
use uuid::Uuid;

use crate::store::{RecordFilter, RecordKind, StorageAdapter};

use super::scheduler::RunInputs;
use super::state::{StateSeed, StateSnapshot};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(Uuid),

    #[error("checkpoint {id} is corrupt: {reason}")]
    Corrupt { id: Uuid, reason: String },

    #[error("checkpoint {id} is inconsistent: {reason}")]
    Inconsistent { id: Uuid, reason: String },

    #[error("workflow definition {0} is not registered")]
    DefinitionMissing(String),

    #[error("checkpoint storage error: {0}")]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Listing entry; the full record is fetched with `load_checkpoint`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: ExecutionStatus,
}

/// Everything needed to start a new execution from a checkpoint.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub checkpoint: Checkpoint,
    pub seed: StateSeed,
    pub inputs: RunInputs,
}

/// Build a sealed checkpoint from a snapshot.
pub fn capture(
    checkpoint_id: Uuid,
    snapshot: &StateSnapshot,
    inputs: &RunInputs,
) -> Result<Checkpoint, CheckpointError> {
    let env = match &inputs.env {
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    };
    let mut checkpoint = Checkpoint {
        id: checkpoint_id,
        execution_id: snapshot.execution.id,
        definition_id: snapshot.execution.definition_id.clone(),
        definition_version: snapshot.execution.definition_version.clone(),
        created_at: Utc::now(),
        status: snapshot.execution.status,
        execution_time: inputs.execution_time,
        input: inputs.input.clone(),
        parameters: inputs.parameters.clone(),
        env,
        state: snapshot.state.clone(),
        tasks: snapshot.tasks.clone(),
        digest: String::new(),
    };
    check_consistency(&checkpoint)?;
    checkpoint.digest = digest(&checkpoint)?;
    Ok(checkpoint)
}

/// Hex SHA-256 over the record with an empty digest field.
pub fn digest(checkpoint: &Checkpoint) -> Result<String, CheckpointError> {
    let mut unsealed = checkpoint.clone();
    unsealed.digest.clear();
    let bytes = serde_json::to_vec(&unsealed).map_err(|e| CheckpointError::Corrupt {
        id: checkpoint.id,
        reason: e.to_string(),
    })?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Every Completed task must have its output in its task scope.
fn check_consistency(checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    for (task_id, run) in &checkpoint.tasks {
        if run.status == TaskRunStatus::Completed && checkpoint.state.task_output(task_id).is_none()
        {
            return Err(CheckpointError::Inconsistent {
                id: checkpoint.id,
                reason: format!("task '{task_id}' is completed but has no recorded output"),
            });
        }
    }
    Ok(())
}

/// Run state a task resumes with in the restored execution.
fn restored_task(run: &TaskRunState) -> TaskRunState {
    match run.status {
        TaskRunStatus::Completed => run.clone(),
        TaskRunStatus::Skipped
            if !run.blocked && !run.skip_cause.is_some_and(SkipCause::is_interrupted) =>
        {
            run.clone()
        }
        TaskRunStatus::Failed if run.error_handled => run.clone(),
        TaskRunStatus::Pending => run.clone(),
        // The interrupted attempt does not count against the retry budget.
        TaskRunStatus::Ready | TaskRunStatus::Running => TaskRunState {
            status: TaskRunStatus::Ready,
            attempt: if run.status == TaskRunStatus::Running {
                run.attempt.saturating_sub(1)
            } else {
                run.attempt
            },
            activated: run.activated,
            ..TaskRunState::default()
        },
        TaskRunStatus::Retrying => TaskRunState {
            status: TaskRunStatus::Retrying,
            attempt: run.attempt,
            error: run.error.clone(),
            activated: run.activated,
            ..TaskRunState::default()
        },
        // Unhandled failures, everything they blocked and tasks that were
        // skipped before they got their turn run again.
        TaskRunStatus::Failed | TaskRunStatus::Skipped => TaskRunState {
            activated: run.activated,
            ..TaskRunState::default()
        },
    }
}

/// Derive the seed of a new execution from a verified checkpoint.
///
/// Completed tasks keep their outputs and are never re-run. Tasks that were
/// dispatched but unfinished come back Ready; unhandled failures, the tasks
/// they blocked and tasks skipped by a cancel or halt start over from
/// Pending.
pub fn restore_plan(checkpoint: Checkpoint, execution: WorkflowExecution) -> RestorePlan {
    let mut state = checkpoint.state.clone();
    let mut tasks = BTreeMap::new();
    for (task_id, run) in &checkpoint.tasks {
        let restored = restored_task(run);
        if restored.status != TaskRunStatus::Completed {
            state.tasks.remove(task_id);
        }
        tasks.insert(task_id.clone(), restored);
    }
    let sequence = state.history.last().map_or(1, |e| e.sequence + 1);
    state.history.push(HistoryEvent {
        sequence,
        at: Utc::now(),
        kind: HistoryEventKind::RestoredFromCheckpoint {
            checkpoint_id: checkpoint.id,
            source_execution: checkpoint.execution_id,
        },
    });

    let mut execution = execution;
    execution.restored_from = Some(checkpoint.id);

    let env = checkpoint
        .env
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let inputs = RunInputs {
        input: checkpoint.input.clone(),
        parameters: checkpoint.parameters.clone(),
        env: Value::Object(env),
        execution_time: checkpoint.execution_time,
    };

    tracing::info!(
        checkpoint_id = %checkpoint.id,
        source_execution = %checkpoint.execution_id,
        execution_id = %execution.id,
        "restore planned"
    );
    RestorePlan {
        seed: StateSeed {
            execution,
            state,
            tasks,
        },
        checkpoint,
        inputs,
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists and loads checkpoints through a storage adapter.
pub struct CheckpointManager<S> {
    storage: S,
}

impl<S: StorageAdapter> CheckpointManager<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Seal a snapshot and persist it. Returns the stored record.
    pub async fn create_checkpoint(
        &self,
        snapshot: &StateSnapshot,
        inputs: &RunInputs,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = capture(Uuid::now_v7(), snapshot, inputs)?;
        let record = serde_json::to_value(&checkpoint).map_err(StorageError::from)?;
        self.storage
            .save(RecordKind::Checkpoint, &checkpoint.id.to_string(), &record)
            .await?;
        tracing::info!(
            checkpoint_id = %checkpoint.id,
            execution_id = %checkpoint.execution_id,
            status = %checkpoint.status,
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Load and verify a checkpoint.
    pub async fn load_checkpoint(&self, id: Uuid) -> Result<Checkpoint, CheckpointError> {
        let record = self
            .storage
            .load(RecordKind::Checkpoint, &id.to_string())
            .await?
            .ok_or(CheckpointError::NotFound(id))?;
        let checkpoint: Checkpoint =
            serde_json::from_value(record).map_err(|e| CheckpointError::Corrupt {
                id,
                reason: e.to_string(),
            })?;
        if checkpoint.id != id {
            return Err(CheckpointError::Corrupt {
                id,
                reason: format!("record carries id {}", checkpoint.id),
            });
        }
        let expected = digest(&checkpoint)?;
        if checkpoint.digest != expected {
            tracing::warn!(checkpoint_id = %id, "checkpoint digest mismatch");
            return Err(CheckpointError::Corrupt {
                id,
                reason: "digest mismatch".to_string(),
            });
        }
        check_consistency(&checkpoint)?;
        Ok(checkpoint)
    }

    /// Checkpoints of one execution, oldest first.
    pub async fn list_checkpoints(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let filter = RecordFilter::new().field("execution_id", execution_id.to_string());
        let records = self.storage.list(RecordKind::Checkpoint, &filter).await?;
        let mut summaries: Vec<CheckpointSummary> = records
            .into_iter()
            .filter_map(|record| match serde_json::from_value::<Checkpoint>(record) {
                Ok(cp) => Some(CheckpointSummary {
                    id: cp.id,
                    execution_id: cp.execution_id,
                    created_at: cp.created_at,
                    status: cp.status,
                }),
                Err(e) => {
                    tracing::warn!(%execution_id, error = %e, "skipping unreadable checkpoint record");
                    None
                }
            })
            .collect();
        summaries.sort_by_key(|s| (s.created_at, s.id));
        Ok(summaries)
    }

    pub async fn delete_checkpoint(&self, id: Uuid) -> Result<(), CheckpointError> {
        if self
            .storage
            .delete(RecordKind::Checkpoint, &id.to_string())
            .await?
        {
            tracing::debug!(checkpoint_id = %id, "checkpoint deleted");
            Ok(())
        } else {
            Err(CheckpointError::NotFound(id))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStorage;
    use crate::workflow::test_support::{definition, task};
    use serde_json::json;
    use std::sync::Arc;
    use taskflow_types::state::{OUTPUT_KEY, WorkflowState};
    use taskflow_types::workflow::TaskError;

    fn inputs() -> RunInputs {
        RunInputs {
            input: json!({"data_url": "https://x/y.csv"}),
            parameters: json!({}),
            env: json!({"REGION": "eu"}),
            execution_time: Utc::now(),
        }
    }

    fn run(status: TaskRunStatus, attempt: u32) -> TaskRunState {
        TaskRunState {
            status,
            attempt,
            ..TaskRunState::default()
        }
    }

    /// fetch_data Completed with output, process_data Running.
    fn mid_flight() -> StateSnapshot {
        let def = definition(vec![
            task("fetch_data", &[]),
            task("process_data", &["fetch_data"]),
        ]);
        let mut execution = WorkflowExecution::new(&def);
        execution.status = ExecutionStatus::Running;

        let mut state = WorkflowState::default();
        state.tasks.insert(
            "fetch_data".to_string(),
            BTreeMap::from([(OUTPUT_KEY.to_string(), json!({"rows": [1, 2, 3], "ratio": 2.346}))]),
        );
        state.global.insert("stage".to_string(), json!("fetched"));

        let mut fetch = run(TaskRunStatus::Completed, 1);
        fetch.output = Some(json!({"rows": [1, 2, 3], "ratio": 2.346}));
        StateSnapshot {
            execution,
            state,
            tasks: BTreeMap::from([
                ("fetch_data".to_string(), fetch),
                ("process_data".to_string(), run(TaskRunStatus::Running, 1)),
            ]),
        }
    }

    fn manager() -> CheckpointManager<Arc<InMemoryStorage>> {
        CheckpointManager::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_round_trip_keeps_completed_outputs() {
        let manager = manager();
        let snapshot = mid_flight();
        let created = manager.create_checkpoint(&snapshot, &inputs()).await.unwrap();

        let loaded = manager.load_checkpoint(created.id).await.unwrap();
        assert_eq!(loaded, created);

        let target = WorkflowExecution::new(&definition(vec![]));
        let plan = restore_plan(loaded, target.clone());

        assert_ne!(plan.seed.execution.id, snapshot.execution.id);
        assert_eq!(plan.seed.execution.id, target.id);
        assert_eq!(plan.seed.execution.restored_from, Some(created.id));

        let original = serde_json::to_vec(snapshot.state.task_output("fetch_data").unwrap()).unwrap();
        let restored = serde_json::to_vec(plan.seed.state.task_output("fetch_data").unwrap()).unwrap();
        assert_eq!(original, restored);

        let process = &plan.seed.tasks["process_data"];
        assert_eq!(process.status, TaskRunStatus::Ready);
        assert_eq!(process.attempt, 0);
        assert!(plan.seed.state.task_output("process_data").is_none());
        assert_eq!(plan.seed.state.global["stage"], json!("fetched"));
        assert_eq!(plan.inputs.env, json!({"REGION": "eu"}));
        assert!(matches!(
            plan.seed.state.history.last().map(|e| &e.kind),
            Some(HistoryEventKind::RestoredFromCheckpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_record_is_corrupt() {
        let manager = manager();
        let created = manager.create_checkpoint(&mid_flight(), &inputs()).await.unwrap();

        let mut record = serde_json::to_value(&created).unwrap();
        record["state"]["global"]["stage"] = json!("tampered");
        manager
            .storage()
            .save(RecordKind::Checkpoint, &created.id.to_string(), &record)
            .await
            .unwrap();

        let err = manager.load_checkpoint(created.id).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_missing_checkpoint() {
        let manager = manager();
        let id = Uuid::now_v7();
        assert!(matches!(
            manager.load_checkpoint(id).await,
            Err(CheckpointError::NotFound(missing)) if missing == id
        ));
        assert!(matches!(
            manager.delete_checkpoint(id).await,
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[test]
    fn test_completed_without_output_is_inconsistent() {
        let mut snapshot = mid_flight();
        snapshot.state.tasks.clear();
        let err = capture(Uuid::now_v7(), &snapshot, &inputs()).unwrap_err();
        assert!(matches!(err, CheckpointError::Inconsistent { .. }));
    }

    #[test]
    fn test_failed_run_restarts_failed_branch() {
        let mut failed = run(TaskRunStatus::Failed, 3);
        failed.error = Some(TaskError::execution("boom"));
        let restored = restored_task(&failed);
        assert_eq!(restored.status, TaskRunStatus::Pending);
        assert_eq!(restored.attempt, 0);
        assert!(restored.error.is_none());

        let mut handled = failed.clone();
        handled.error_handled = true;
        assert_eq!(restored_task(&handled), handled);

        let mut blocked = run(TaskRunStatus::Skipped, 0);
        blocked.blocked = true;
        assert_eq!(restored_task(&blocked).status, TaskRunStatus::Pending);
    }

    #[test]
    fn test_skip_cause_decides_restore() {
        let skipped = |cause| TaskRunState {
            skip_cause: Some(cause),
            skip_reason: Some("skipped".to_string()),
            ..run(TaskRunStatus::Skipped, 0)
        };
        for cause in [SkipCause::Cancelled, SkipCause::NotDispatched, SkipCause::Handler] {
            let restored = restored_task(&skipped(cause));
            assert_eq!(restored.status, TaskRunStatus::Pending, "{cause:?}");
            assert!(restored.skip_cause.is_none());
        }
        for cause in [SkipCause::Condition, SkipCause::AnyJoin] {
            assert_eq!(restored_task(&skipped(cause)), skipped(cause), "{cause:?}");
        }
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let manager = manager();
        let snapshot = mid_flight();
        let first = manager.create_checkpoint(&snapshot, &inputs()).await.unwrap();
        let second = manager.create_checkpoint(&snapshot, &inputs()).await.unwrap();

        let listed = manager.list_checkpoints(snapshot.execution.id).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(manager.list_checkpoints(Uuid::now_v7()).await.unwrap().is_empty());

        manager.delete_checkpoint(first.id).await.unwrap();
        let listed = manager.list_checkpoints(snapshot.execution.id).await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}

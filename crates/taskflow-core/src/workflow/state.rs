//! Single-writer state manager for one execution.
//!
//! All mutations of `WorkflowState`, `TaskRunState` and the execution record
//! travel as commands through a bounded `mpsc` mailbox to one actor task,
//! which applies them in receipt order and answers on a `oneshot`. Readers get
//! point-in-time deep copies via [`StateManager::snapshot`]; no lock is ever
//! held across caller logic.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde_json::{Map, Value};
use taskflow_types::state::{HistoryEvent, HistoryEventKind, OUTPUT_KEY, TASKS_KEY, WorkflowState};
use taskflow_types::workflow::{
    ExecutionStatus, SkipCause, TaskError, TaskRunState, TaskRunStatus, WorkflowExecution,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("state manager mailbox is closed")]
    MailboxClosed,

    #[error("task '{task_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskRunStatus,
        to: TaskRunStatus,
    },

    #[error("execution cannot move from {from} to {to}")]
    InvalidExecutionTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("'{0}' is reserved and cannot be written to the global scope")]
    ReservedKey(String),

    #[error("scope of task '{task_id}' already written for attempt {attempt}")]
    ScopeAlreadyWritten { task_id: String, attempt: u32 },

    #[error("execution is {0}; state can no longer change")]
    ExecutionClosed(ExecutionStatus),
}

// ---------------------------------------------------------------------------
// Snapshot & seed
// ---------------------------------------------------------------------------

/// Immutable deep copy of everything the state manager owns.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub execution: WorkflowExecution,
    pub state: WorkflowState,
    pub tasks: BTreeMap<String, TaskRunState>,
}

impl StateSnapshot {
    pub fn task(&self, task_id: &str) -> Option<&TaskRunState> {
        self.tasks.get(task_id)
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskRunStatus> {
        self.tasks.get(task_id).map(|t| t.status)
    }
}

/// Initial contents for a new state manager: fresh for a submit, copied
/// from a checkpoint for a restore.
#[derive(Debug, Clone)]
pub struct StateSeed {
    pub execution: WorkflowExecution,
    pub state: WorkflowState,
    pub tasks: BTreeMap<String, TaskRunState>,
}

impl StateSeed {
    /// Every task Pending, empty state.
    pub fn fresh<'a>(
        execution: WorkflowExecution,
        task_ids: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            execution,
            state: WorkflowState::default(),
            tasks: task_ids
                .into_iter()
                .map(|id| (id.to_string(), TaskRunState::default()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, StateError>>;

enum Command {
    UpdateGlobal {
        delta: Map<String, Value>,
        reply: Reply<Vec<String>>,
    },
    SetTaskOutput {
        task_id: String,
        output: Value,
        reply: Reply<()>,
    },
    RecordEvent {
        kind: HistoryEventKind,
        reply: Reply<u64>,
    },
    Snapshot {
        reply: oneshot::Sender<StateSnapshot>,
    },
    MarkReady {
        task_id: String,
        reply: Reply<()>,
    },
    MarkRunning {
        task_id: String,
        reply: Reply<u32>,
    },
    CompleteTask {
        task_id: String,
        published: BTreeMap<String, Value>,
        taken: Vec<String>,
        reply: Reply<()>,
    },
    FailTask {
        task_id: String,
        error: TaskError,
        reply: Reply<()>,
    },
    MarkRetrying {
        task_id: String,
        reply: Reply<()>,
    },
    MarkSkipped {
        task_id: String,
        cause: SkipCause,
        reason: String,
        blocked: bool,
        reply: Reply<()>,
    },
    RouteError {
        task_id: String,
        target: String,
        via: String,
        reply: Reply<()>,
    },
    SetExecutionStatus {
        status: ExecutionStatus,
        error: Option<String>,
        reply: Reply<WorkflowExecution>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to an execution's state actor. The actor stops once the
/// last handle is dropped.
#[derive(Debug, Clone)]
pub struct StateManager {
    tx: mpsc::Sender<Command>,
}

/// Reference to the actor that does not keep it running.
#[cfg(test)]
pub(crate) struct WeakStateManager(mpsc::WeakSender<Command>);

#[cfg(test)]
impl WeakStateManager {
    pub(crate) fn is_alive(&self) -> bool {
        self.0.upgrade().is_some()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Command")
    }
}

impl StateManager {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(seed: StateSeed, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let actor = StateActor::new(seed);
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> WeakStateManager {
        WeakStateManager(self.tx.downgrade())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, StateError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| StateError::MailboxClosed)?;
        rx.await.map_err(|_| StateError::MailboxClosed)?
    }

    /// Merge `delta` into the global scope. Returns the written keys.
    pub async fn update_global(&self, delta: Map<String, Value>) -> Result<Vec<String>, StateError> {
        self.request(|reply| Command::UpdateGlobal { delta, reply }).await
    }

    /// Write a running task's output into its own scope, replacing whatever
    /// an earlier attempt left there.
    pub async fn set_task_output(&self, task_id: &str, output: Value) -> Result<(), StateError> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::SetTaskOutput {
            task_id,
            output,
            reply,
        })
        .await
    }

    /// Append a history entry; returns its sequence number.
    pub async fn record_event(&self, kind: HistoryEventKind) -> Result<u64, StateError> {
        self.request(|reply| Command::RecordEvent { kind, reply }).await
    }

    pub async fn snapshot(&self) -> Result<StateSnapshot, StateError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| StateError::MailboxClosed)?;
        rx.await.map_err(|_| StateError::MailboxClosed)
    }

    pub async fn mark_ready(&self, task_id: &str) -> Result<(), StateError> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::MarkReady { task_id, reply }).await
    }

    /// Start the next attempt. Returns the attempt number (1-based).
    pub async fn mark_running(&self, task_id: &str) -> Result<u32, StateError> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::MarkRunning { task_id, reply }).await
    }

    /// Mark a task Completed, write its published globals and take the
    /// given transitions, all in one step.
    pub async fn complete_task(
        &self,
        task_id: &str,
        published: BTreeMap<String, Value>,
        taken: Vec<String>,
    ) -> Result<(), StateError> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::CompleteTask {
            task_id,
            published,
            taken,
            reply,
        })
        .await
    }

    pub async fn fail_task(&self, task_id: &str, error: TaskError) -> Result<(), StateError> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::FailTask {
            task_id,
            error,
            reply,
        })
        .await
    }

    pub async fn mark_retrying(&self, task_id: &str) -> Result<(), StateError> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::MarkRetrying { task_id, reply }).await
    }

    pub async fn mark_skipped(
        &self,
        task_id: &str,
        cause: SkipCause,
        reason: impl Into<String>,
        blocked: bool,
    ) -> Result<(), StateError> {
        let task_id = task_id.to_string();
        let reason = reason.into();
        self.request(|reply| Command::MarkSkipped {
            task_id,
            cause,
            reason,
            blocked,
            reply,
        })
        .await
    }

    /// Mark a failed task as handled and release the recovery task.
    pub async fn route_error(
        &self,
        task_id: &str,
        target: &str,
        via: &str,
    ) -> Result<(), StateError> {
        let task_id = task_id.to_string();
        let target = target.to_string();
        let via = via.to_string();
        self.request(|reply| Command::RouteError {
            task_id,
            target,
            via,
            reply,
        })
        .await
    }

    /// Move the execution status; returns the updated record.
    pub async fn set_execution_status(
        &self,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<WorkflowExecution, StateError> {
        self.request(|reply| Command::SetExecutionStatus {
            status,
            error,
            reply,
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct StateActor {
    execution: WorkflowExecution,
    state: WorkflowState,
    tasks: BTreeMap<String, TaskRunState>,
    next_sequence: u64,
    /// Attempt whose output is currently in each task's scope.
    written: HashMap<String, u32>,
}

impl StateActor {
    fn new(seed: StateSeed) -> Self {
        let next_sequence = seed
            .state
            .history
            .last()
            .map_or(1, |event| event.sequence + 1);
        Self {
            execution: seed.execution,
            state: seed.state,
            tasks: seed.tasks,
            next_sequence,
            written: HashMap::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!(execution_id = %self.execution.id, "state manager stopped");
    }

    fn handle(&mut self, command: Command) {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::UpdateGlobal { delta, reply } => {
                let _ = reply.send(self.update_global(delta));
            }
            Command::SetTaskOutput {
                task_id,
                output,
                reply,
            } => {
                let _ = reply.send(self.set_task_output(&task_id, output));
            }
            Command::RecordEvent { kind, reply } => {
                let _ = reply.send(Ok(self.record(kind)));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(StateSnapshot {
                    execution: self.execution.clone(),
                    state: self.state.clone(),
                    tasks: self.tasks.clone(),
                });
            }
            Command::MarkReady { task_id, reply } => {
                let _ = reply.send(self.transition(&task_id, TaskRunStatus::Ready).map(|_| ()));
            }
            Command::MarkRunning { task_id, reply } => {
                let _ = reply.send(self.mark_running(&task_id));
            }
            Command::CompleteTask {
                task_id,
                published,
                taken,
                reply,
            } => {
                let _ = reply.send(self.complete_task(&task_id, published, taken));
            }
            Command::FailTask {
                task_id,
                error,
                reply,
            } => {
                let _ = reply.send(self.fail_task(&task_id, error));
            }
            Command::MarkRetrying { task_id, reply } => {
                let _ = reply.send(self.transition(&task_id, TaskRunStatus::Retrying).map(|_| ()));
            }
            Command::MarkSkipped {
                task_id,
                cause,
                reason,
                blocked,
                reply,
            } => {
                let _ = reply.send(self.mark_skipped(&task_id, cause, reason, blocked));
            }
            Command::RouteError {
                task_id,
                target,
                via,
                reply,
            } => {
                let _ = reply.send(self.route_error(task_id, target, via));
            }
            Command::SetExecutionStatus {
                status,
                error,
                reply,
            } => {
                let _ = reply.send(self.set_execution_status(status, error));
            }
        }
    }

    fn record(&mut self, kind: HistoryEventKind) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.state.history.push(HistoryEvent {
            sequence,
            at: Utc::now(),
            kind,
        });
        sequence
    }

    fn task_mut(&mut self, task_id: &str) -> Result<&mut TaskRunState, StateError> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| StateError::UnknownTask(task_id.to_string()))
    }

    /// Validated status move; returns the task for further edits.
    fn transition(
        &mut self,
        task_id: &str,
        to: TaskRunStatus,
    ) -> Result<&mut TaskRunState, StateError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StateError::UnknownTask(task_id.to_string()))?;
        if !task.status.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to,
            });
        }
        debug!(task_id, from = %task.status, to = %to, "task status");
        task.status = to;
        Ok(task)
    }

    fn ensure_open(&self) -> Result<(), StateError> {
        if self.execution.status.is_terminal() {
            return Err(StateError::ExecutionClosed(self.execution.status));
        }
        Ok(())
    }

    fn update_global(&mut self, delta: Map<String, Value>) -> Result<Vec<String>, StateError> {
        self.ensure_open()?;
        if delta.contains_key(TASKS_KEY) {
            return Err(StateError::ReservedKey(TASKS_KEY.to_string()));
        }
        let keys: Vec<String> = delta.keys().cloned().collect();
        self.state.global.extend(delta);
        self.record(HistoryEventKind::StateUpdated { keys: keys.clone() });
        Ok(keys)
    }

    fn set_task_output(&mut self, task_id: &str, output: Value) -> Result<(), StateError> {
        let already = self.written.get(task_id).copied();
        let task = self.task_mut(task_id)?;
        if task.status != TaskRunStatus::Running {
            return Err(StateError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: TaskRunStatus::Completed,
            });
        }
        let attempt = task.attempt;
        if already == Some(attempt) {
            return Err(StateError::ScopeAlreadyWritten {
                task_id: task_id.to_string(),
                attempt,
            });
        }
        task.output = Some(output.clone());
        self.state.tasks.insert(
            task_id.to_string(),
            BTreeMap::from([(OUTPUT_KEY.to_string(), output)]),
        );
        self.written.insert(task_id.to_string(), attempt);
        Ok(())
    }

    fn mark_running(&mut self, task_id: &str) -> Result<u32, StateError> {
        let task = self.transition(task_id, TaskRunStatus::Running)?;
        task.attempt += 1;
        task.started_at = Some(Utc::now());
        task.ended_at = None;
        task.error = None;
        let attempt = task.attempt;
        self.record(HistoryEventKind::TaskStarted {
            task_id: task_id.to_string(),
            attempt,
        });
        Ok(attempt)
    }

    fn complete_task(
        &mut self,
        task_id: &str,
        published: BTreeMap<String, Value>,
        taken: Vec<String>,
    ) -> Result<(), StateError> {
        if published.contains_key(TASKS_KEY) {
            return Err(StateError::ReservedKey(TASKS_KEY.to_string()));
        }
        for target in &taken {
            if !self.tasks.contains_key(target) {
                return Err(StateError::UnknownTask(target.clone()));
            }
        }

        let task = self.transition(task_id, TaskRunStatus::Completed)?;
        task.ended_at = Some(Utc::now());
        let attempt = task.attempt;
        self.record(HistoryEventKind::TaskCompleted {
            task_id: task_id.to_string(),
            attempt,
        });

        if !published.is_empty() {
            let keys: Vec<String> = published.keys().cloned().collect();
            self.state.global.extend(published);
            self.record(HistoryEventKind::StateUpdated { keys });
        }

        for target in taken {
            if let Some(next) = self.tasks.get_mut(&target) {
                next.activated = true;
            }
            self.record(HistoryEventKind::TransitionTaken {
                from: task_id.to_string(),
                to: target,
            });
        }
        Ok(())
    }

    fn fail_task(&mut self, task_id: &str, error: TaskError) -> Result<(), StateError> {
        let task = self.transition(task_id, TaskRunStatus::Failed)?;
        task.ended_at = Some(Utc::now());
        let attempt = task.attempt;
        let kind = error.kind;
        let message = error.message.clone();
        task.error = Some(error);
        self.record(HistoryEventKind::TaskFailed {
            task_id: task_id.to_string(),
            attempt,
            kind,
            message,
        });
        Ok(())
    }

    fn mark_skipped(
        &mut self,
        task_id: &str,
        cause: SkipCause,
        reason: String,
        blocked: bool,
    ) -> Result<(), StateError> {
        let task = self.transition(task_id, TaskRunStatus::Skipped)?;
        task.ended_at = Some(Utc::now());
        task.skip_reason = Some(reason.clone());
        task.skip_cause = Some(cause);
        task.blocked = blocked;
        self.record(HistoryEventKind::TaskSkipped {
            task_id: task_id.to_string(),
            reason,
        });
        Ok(())
    }

    fn route_error(&mut self, task_id: String, target: String, via: String) -> Result<(), StateError> {
        if !self.tasks.contains_key(&target) {
            return Err(StateError::UnknownTask(target));
        }
        let task = self.task_mut(&task_id)?;
        if task.status != TaskRunStatus::Failed {
            return Err(StateError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskRunStatus::Failed,
            });
        }
        task.error_handled = true;
        if let Some(next) = self.tasks.get_mut(&target) {
            next.activated = true;
        }
        self.record(HistoryEventKind::ErrorRouted {
            task_id,
            target,
            via,
        });
        Ok(())
    }

    fn set_execution_status(
        &mut self,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<WorkflowExecution, StateError> {
        let from = self.execution.status;
        if !from.can_transition_to(status) {
            return Err(StateError::InvalidExecutionTransition { from, to: status });
        }
        let now = Utc::now();
        self.execution.status = status;
        if status == ExecutionStatus::Running && self.execution.started_at.is_none() {
            self.execution.started_at = Some(now);
        }
        if status.is_terminal() {
            self.execution.completed_at = Some(now);
        }
        if error.is_some() {
            self.execution.error = error;
        }
        self.record(HistoryEventKind::ExecutionStatusChanged { from, to: status });
        Ok(self.execution.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_support::{definition, task};
    use serde_json::json;

    fn manager(ids: &[&str]) -> StateManager {
        let def = definition(ids.iter().map(|id| task(id, &[])).collect());
        let seed = StateSeed::fresh(WorkflowExecution::new(&def), ids.iter().copied());
        StateManager::spawn(seed, 8)
    }

    async fn run_once(state: &StateManager, id: &str) -> u32 {
        state.mark_ready(id).await.unwrap();
        state.mark_running(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_task_lifecycle_and_history_order() {
        let state = manager(&["fetch", "report"]);
        assert_eq!(run_once(&state, "fetch").await, 1);
        state.set_task_output("fetch", json!({"rows": 3})).await.unwrap();
        state
            .complete_task(
                "fetch",
                BTreeMap::from([("row_count".to_string(), json!(3))]),
                vec!["report".to_string()],
            )
            .await
            .unwrap();

        let snap = state.snapshot().await.unwrap();
        assert_eq!(snap.status_of("fetch"), Some(TaskRunStatus::Completed));
        assert!(snap.task("report").unwrap().activated);
        assert_eq!(snap.state.task_output("fetch"), Some(&json!({"rows": 3})));
        assert_eq!(snap.state.global["row_count"], json!(3));

        let kinds: Vec<_> = snap
            .state
            .history
            .iter()
            .map(|e| serde_json::to_value(&e.kind).unwrap()["event"].clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                json!("task_started"),
                json!("task_completed"),
                json!("state_updated"),
                json!("transition_taken")
            ]
        );
        let sequences: Vec<u64> = snap.state.history.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_backward_move_rejected() {
        let state = manager(&["a"]);
        run_once(&state, "a").await;
        state.set_task_output("a", json!(1)).await.unwrap();
        state.complete_task("a", BTreeMap::new(), vec![]).await.unwrap();
        let err = state.mark_running("a").await.unwrap_err();
        assert!(matches!(
            err,
            StateError::InvalidTransition {
                from: TaskRunStatus::Completed,
                to: TaskRunStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_scope_write_once_per_attempt() {
        let state = manager(&["a"]);
        run_once(&state, "a").await;
        state.set_task_output("a", json!("first")).await.unwrap();
        assert_eq!(
            state.set_task_output("a", json!("again")).await,
            Err(StateError::ScopeAlreadyWritten {
                task_id: "a".to_string(),
                attempt: 1
            })
        );

        state.fail_task("a", TaskError::execution("boom")).await.unwrap();
        state.mark_retrying("a").await.unwrap();
        assert_eq!(state.mark_running("a").await.unwrap(), 2);
        state.set_task_output("a", json!("second")).await.unwrap();
        let snap = state.snapshot().await.unwrap();
        assert_eq!(snap.state.task_output("a"), Some(&json!("second")));
        assert!(snap.task("a").unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_global_updates_and_reserved_key() {
        let state = manager(&["a"]);
        let mut delta = Map::new();
        delta.insert("approved".to_string(), json!(true));
        assert_eq!(state.update_global(delta).await.unwrap(), vec!["approved"]);

        let mut reserved = Map::new();
        reserved.insert("tasks".to_string(), json!({}));
        assert_eq!(
            state.update_global(reserved).await,
            Err(StateError::ReservedKey("tasks".to_string()))
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() {
        let state = manager(&["a"]);
        let before = state.snapshot().await.unwrap();
        let mut delta = Map::new();
        delta.insert("k".to_string(), json!(1));
        state.update_global(delta).await.unwrap();
        assert!(before.state.global.is_empty());
        assert_eq!(state.snapshot().await.unwrap().state.global.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_serialized() {
        let state = manager(&["a"]);
        let mut handles = Vec::new();
        for i in 0..20 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let mut delta = Map::new();
                delta.insert(format!("k{i}"), json!(i));
                state.update_global(delta).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let snap = state.snapshot().await.unwrap();
        assert_eq!(snap.state.global.len(), 20);
        let sequences: Vec<u64> = snap.state.history.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_execution_status_and_closed_state() {
        let state = manager(&["a"]);
        let exec = state
            .set_execution_status(ExecutionStatus::Running, None)
            .await
            .unwrap();
        assert!(exec.started_at.is_some());

        assert!(matches!(
            state.set_execution_status(ExecutionStatus::Cancelled, None).await,
            Err(StateError::InvalidExecutionTransition { .. })
        ));

        let exec = state
            .set_execution_status(ExecutionStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();
        assert_eq!(exec.error.as_deref(), Some("boom"));
        assert!(exec.completed_at.is_some());

        assert_eq!(
            state.update_global(Map::new()).await,
            Err(StateError::ExecutionClosed(ExecutionStatus::Failed))
        );
    }

    #[tokio::test]
    async fn test_route_error_marks_handled() {
        let state = manager(&["a", "recover"]);
        run_once(&state, "a").await;
        state.fail_task("a", TaskError::timeout("slow")).await.unwrap();
        state.route_error("a", "recover", "handler").await.unwrap();

        let snap = state.snapshot().await.unwrap();
        assert!(snap.task("a").unwrap().error_handled);
        assert!(snap.task("a").unwrap().is_settled());
        assert!(snap.task("recover").unwrap().activated);
    }

    #[tokio::test]
    async fn test_sequence_continues_from_seed_history() {
        let def = definition(vec![task("a", &[])]);
        let mut seed = StateSeed::fresh(WorkflowExecution::new(&def), ["a"]);
        seed.state.history.push(HistoryEvent {
            sequence: 41,
            at: Utc::now(),
            kind: HistoryEventKind::StateUpdated { keys: vec![] },
        });
        let state = StateManager::spawn(seed, 4);
        let seq = state
            .record_event(HistoryEventKind::StateUpdated { keys: vec![] })
            .await
            .unwrap();
        assert_eq!(seq, 42);
    }
}

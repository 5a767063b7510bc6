//! `WorkflowEngine`: the public surface of the execution engine.
//!
//! Holds registered definitions (as validated graphs), one handle per
//! execution started in this process, the shared dispatcher and the event
//! sink. Every execution runs as its own tokio task driving an
//! [`ExecutionRun`]; the engine talks to it only through its state manager,
//! its cancellation token and its pause channel. Once a run ends its state
//! actor stops and the handle keeps the final snapshot; the oldest finished
//! handles are evicted past `retained_executions`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use taskflow_types::config::EngineConfig;
use taskflow_types::error::StorageError;
use taskflow_types::event::{EngineEvent, EventEnvelope};
use taskflow_types::state::{Checkpoint, HistoryEvent, HistoryEventKind, WorkflowState};
use taskflow_types::workflow::{
    ExecutionStatus, TaskRunState, TaskRunStatus, WorkflowDefinition, WorkflowExecution,
    definition_key,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::action::ActionRegistry;
use crate::event::{BroadcastEventSink, EventSink};
use crate::store::{RecordKind, StorageAdapter};
use crate::workflow::checkpoint::{
    CheckpointError, CheckpointManager, CheckpointSummary, restore_plan,
};
use crate::workflow::definition::DefinitionError;
use crate::workflow::dispatcher::{ExecutionGate, TaskDispatcher};
use crate::workflow::expression::ExpressionEvaluator;
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::input::{ValidationError, validate_input};
use crate::workflow::scheduler::{ExecutionRun, RunControl, RunInputs, RunSetup};
use crate::workflow::state::{StateError, StateManager, StateSeed, StateSnapshot};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {id} is already {status}")]
    ExecutionFinished { id: Uuid, status: ExecutionStatus },
}

// ---------------------------------------------------------------------------
// Options & reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Exposed to expressions as `parameters`.
    pub parameters: Option<Value>,
    /// Overrides the definition's per-execution concurrency cap.
    pub max_concurrency: Option<usize>,
    /// Overrides the definition's wall-clock limit.
    pub timeout_secs: Option<u64>,
    /// Start in the Paused status; nothing dispatches until `resume`.
    pub start_paused: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub max_concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub start_paused: bool,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Progress {
    fn from_tasks(tasks: &BTreeMap<String, TaskRunState>) -> Self {
        let mut progress = Progress {
            total: tasks.len(),
            ..Progress::default()
        };
        for run in tasks.values() {
            match run.status {
                TaskRunStatus::Pending => progress.pending += 1,
                TaskRunStatus::Ready | TaskRunStatus::Running | TaskRunStatus::Retrying => {
                    progress.active += 1
                }
                TaskRunStatus::Completed => progress.completed += 1,
                TaskRunStatus::Failed => progress.failed += 1,
                TaskRunStatus::Skipped => progress.skipped += 1,
            }
        }
        progress
    }
}

/// Answer to `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub execution: WorkflowExecution,
    /// Empty when the execution is only known from storage.
    pub tasks: BTreeMap<String, TaskRunState>,
    pub state: Option<WorkflowState>,
    pub progress: Progress,
}

// ---------------------------------------------------------------------------
// Execution handles
// ---------------------------------------------------------------------------

/// An execution whose run task is still driving it.
struct LiveExecution {
    state: StateManager,
    inputs: Arc<RunInputs>,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    finished: watch::Receiver<Option<WorkflowExecution>>,
}

impl LiveExecution {
    fn final_record(&self) -> Option<WorkflowExecution> {
        self.finished.borrow().clone()
    }
}

/// Final state of an execution whose state actor has stopped.
#[derive(Clone)]
struct FinishedExecution {
    snapshot: StateSnapshot,
    inputs: Arc<RunInputs>,
}

#[derive(Clone)]
enum ExecutionHandle {
    Live(Arc<LiveExecution>),
    Finished(FinishedExecution),
}

impl From<StateSnapshot> for ExecutionReport {
    fn from(snapshot: StateSnapshot) -> Self {
        Self {
            progress: Progress::from_tasks(&snapshot.tasks),
            execution: snapshot.execution,
            tasks: snapshot.tasks,
            state: Some(snapshot.state),
        }
    }
}

/// Drop the oldest finished handles beyond `keep`.
fn evict_finished(executions: &DashMap<Uuid, ExecutionHandle>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = executions
        .iter()
        .filter_map(|entry| match entry.value() {
            ExecutionHandle::Finished(done) => {
                let execution = &done.snapshot.execution;
                Some((execution.completed_at.unwrap_or(execution.created_at), *entry.key()))
            }
            ExecutionHandle::Live(_) => None,
        })
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, execution_id) in finished.into_iter().take(excess) {
        executions.remove(&execution_id);
        debug!(%execution_id, "finished execution evicted");
    }
}

type EnvReader = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine<S: StorageAdapter + 'static> {
    config: EngineConfig,
    storage: Arc<S>,
    checkpoints: CheckpointManager<Arc<S>>,
    evaluator: Arc<ExpressionEvaluator>,
    dispatcher: Arc<TaskDispatcher>,
    events: Arc<dyn EventSink>,
    broadcast: Option<BroadcastEventSink>,
    env_reader: EnvReader,
    definitions: DashMap<String, Arc<WorkflowGraph>>,
    executions: Arc<DashMap<Uuid, ExecutionHandle>>,
}

impl<S: StorageAdapter + 'static> WorkflowEngine<S> {
    /// Engine emitting to a broadcast sink (see [`WorkflowEngine::subscribe`])
    /// and reading `env` from the process environment.
    pub fn new(config: EngineConfig, storage: Arc<S>, actions: ActionRegistry) -> Self {
        let dispatcher = TaskDispatcher::new(
            Arc::new(actions),
            config.max_concurrent_tasks,
            Duration::from_secs(config.default_task_timeout_secs),
        );
        let broadcast = BroadcastEventSink::new(config.event_buffer);
        Self {
            checkpoints: CheckpointManager::new(Arc::clone(&storage)),
            storage,
            evaluator: Arc::new(ExpressionEvaluator::new()),
            dispatcher: Arc::new(dispatcher),
            events: Arc::new(broadcast.clone()),
            broadcast: Some(broadcast),
            env_reader: Arc::new(|name| std::env::var(name).ok()),
            definitions: DashMap::new(),
            executions: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Replace the broadcast sink. `subscribe` returns `None` afterwards.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self.broadcast = None;
        self
    }

    pub fn with_env_reader(
        mut self,
        reader: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env_reader = Arc::new(reader);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<EventEnvelope>> {
        self.broadcast.as_ref().map(BroadcastEventSink::subscribe)
    }

    // -- definitions -------------------------------------------------------

    /// Validate and store a definition. Returns its `id@version` key.
    pub async fn register_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<String, EngineError> {
        let graph = WorkflowGraph::build(&definition, &self.evaluator)?;
        let key = definition.key();
        let record = serde_json::to_value(&definition).map_err(StorageError::from)?;
        self.storage
            .save(RecordKind::Definition, &key, &record)
            .await?;
        self.definitions.insert(key.clone(), Arc::new(graph));
        info!(definition = %key, tasks = definition.tasks.len(), "workflow definition registered");
        Ok(key)
    }

    /// Registered graph for `id@version`, loading it from storage if this
    /// process has not seen it yet.
    async fn graph_for(&self, id: &str, version: &str) -> Result<Option<Arc<WorkflowGraph>>, EngineError> {
        let key = definition_key(id, version);
        if let Some(graph) = self.definitions.get(&key) {
            return Ok(Some(Arc::clone(graph.value())));
        }
        let Some(record) = self.storage.load(RecordKind::Definition, &key).await? else {
            return Ok(None);
        };
        let definition: WorkflowDefinition = serde_json::from_value(record)
            .map_err(|e| DefinitionError::Parse(e.to_string()))?;
        let graph = Arc::new(WorkflowGraph::build(&definition, &self.evaluator)?);
        self.definitions.insert(key, Arc::clone(&graph));
        Ok(Some(graph))
    }

    // -- submit ------------------------------------------------------------

    /// Validate `definition` and `input`, then start an execution.
    pub async fn submit(
        &self,
        definition: WorkflowDefinition,
        input: Value,
        options: SubmitOptions,
    ) -> Result<Uuid, EngineError> {
        let graph = Arc::new(WorkflowGraph::build(&definition, &self.evaluator)?);
        self.start_new(graph, input, options).await
    }

    /// Start an execution of a registered definition.
    pub async fn submit_registered(
        &self,
        id: &str,
        version: &str,
        input: Value,
        options: SubmitOptions,
    ) -> Result<Uuid, EngineError> {
        let graph = self
            .graph_for(id, version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_key(id, version)))?;
        self.start_new(graph, input, options).await
    }

    async fn start_new(
        &self,
        graph: Arc<WorkflowGraph>,
        input: Value,
        options: SubmitOptions,
    ) -> Result<Uuid, EngineError> {
        let definition = Arc::clone(graph.definition());
        let input = validate_input(&definition.input_schema, &input)?;

        let inputs = RunInputs {
            input,
            parameters: options.parameters.unwrap_or_else(|| Value::Object(Map::new())),
            env: self.read_env(),
            execution_time: Utc::now(),
        };
        let execution = WorkflowExecution::new(&definition);
        let seed = StateSeed::fresh(execution, definition.tasks.iter().map(|t| t.id.as_str()));

        let concurrency = options.max_concurrency.or(definition.max_concurrency);
        let timeout = options.timeout_secs.or(definition.timeout_secs);
        self.launch(graph, seed, inputs, concurrency, timeout, options.start_paused)
            .await
    }

    fn read_env(&self) -> Value {
        let vars: Map<String, Value> = self
            .config
            .env_allowlist
            .iter()
            .filter_map(|name| (self.env_reader)(name).map(|v| (name.clone(), Value::String(v))))
            .collect();
        Value::Object(vars)
    }

    async fn launch(
        &self,
        graph: Arc<WorkflowGraph>,
        seed: StateSeed,
        inputs: RunInputs,
        max_concurrency: Option<usize>,
        timeout_secs: Option<u64>,
        start_paused: bool,
    ) -> Result<Uuid, EngineError> {
        let execution_id = seed.execution.id;
        let restored_from = seed.execution.restored_from;
        let record = serde_json::to_value(&seed.execution).map_err(StorageError::from)?;
        self.storage
            .save(RecordKind::Execution, &execution_id.to_string(), &record)
            .await?;

        let state = StateManager::spawn(seed, self.config.state_mailbox_capacity);
        let inputs = Arc::new(inputs);
        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(start_paused);
        let (finished_tx, finished_rx) = watch::channel(None);

        let gate = ExecutionGate::new(max_concurrency.or(self.config.default_execution_concurrency));
        let workflow_timeout = timeout_secs
            .or(self.config.workflow_timeout_secs)
            .map(Duration::from_secs);

        let run = ExecutionRun::new(RunSetup {
            execution_id,
            graph,
            state: state.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            evaluator: Arc::clone(&self.evaluator),
            events: Arc::clone(&self.events),
            storage: Arc::clone(&self.storage),
            inputs: Arc::clone(&inputs),
            gate,
            control: RunControl {
                cancel: cancel.clone(),
                pause: pause_rx,
            },
            workflow_timeout,
            restored_from,
        });

        self.executions.insert(
            execution_id,
            ExecutionHandle::Live(Arc::new(LiveExecution {
                state,
                inputs: Arc::clone(&inputs),
                cancel,
                pause: pause_tx,
                finished: finished_rx,
            })),
        );

        let executions = Arc::clone(&self.executions);
        let keep = self.config.retained_executions;
        tokio::spawn(async move {
            let snapshot = run.run().await;
            let execution = snapshot.execution.clone();
            // Replacing the live handle drops the last state manager handle.
            executions.insert(
                execution_id,
                ExecutionHandle::Finished(FinishedExecution { snapshot, inputs }),
            );
            finished_tx.send_replace(Some(execution));
            evict_finished(&executions, keep);
        });
        debug!(%execution_id, "execution launched");
        Ok(execution_id)
    }

    // -- inspection & control ----------------------------------------------

    fn handle(&self, execution_id: Uuid) -> Option<ExecutionHandle> {
        self.executions.get(&execution_id).map(|h| h.value().clone())
    }

    /// Persisted record of an execution this engine holds no handle for.
    async fn stored_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let record = self
            .storage
            .load(RecordKind::Execution, &execution_id.to_string())
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        Ok(serde_json::from_value(record).map_err(StorageError::from)?)
    }

    /// Error for a control request on an execution without a live handle.
    async fn not_controllable(&self, execution_id: Uuid) -> EngineError {
        match self.stored_execution(execution_id).await {
            Ok(execution) if execution.status.is_terminal() => EngineError::ExecutionFinished {
                id: execution_id,
                status: execution.status,
            },
            Ok(_) => EngineError::ExecutionNotFound(execution_id),
            Err(e) => e,
        }
    }

    /// A live handle whose execution has not reached a terminal status.
    async fn open_handle(&self, execution_id: Uuid) -> Result<Arc<LiveExecution>, EngineError> {
        let live = match self.handle(execution_id) {
            Some(ExecutionHandle::Live(live)) => live,
            Some(ExecutionHandle::Finished(done)) => {
                return Err(EngineError::ExecutionFinished {
                    id: execution_id,
                    status: done.snapshot.execution.status,
                });
            }
            None => return Err(self.not_controllable(execution_id).await),
        };
        let status = match live.final_record() {
            Some(execution) => execution.status,
            None => live.state.snapshot().await?.execution.status,
        };
        if status.is_terminal() {
            return Err(EngineError::ExecutionFinished {
                id: execution_id,
                status,
            });
        }
        Ok(live)
    }

    /// Current status, per-task states and state of an execution. Executions
    /// evicted from memory or started by another process are answered from
    /// storage.
    pub async fn get_status(&self, execution_id: Uuid) -> Result<ExecutionReport, EngineError> {
        match self.handle(execution_id) {
            Some(ExecutionHandle::Live(live)) => Ok(live.state.snapshot().await?.into()),
            Some(ExecutionHandle::Finished(done)) => Ok(done.snapshot.into()),
            None => Ok(ExecutionReport {
                execution: self.stored_execution(execution_id).await?,
                tasks: BTreeMap::new(),
                state: None,
                progress: Progress::default(),
            }),
        }
    }

    /// Merge `delta` into the global scope. Returns the keys written.
    pub async fn update_state(
        &self,
        execution_id: Uuid,
        delta: Map<String, Value>,
    ) -> Result<Vec<String>, EngineError> {
        let keys = match self.handle(execution_id) {
            Some(ExecutionHandle::Live(live)) => live.state.update_global(delta).await?,
            Some(ExecutionHandle::Finished(done)) => {
                return Err(StateError::ExecutionClosed(done.snapshot.execution.status).into());
            }
            None => return Err(self.not_controllable(execution_id).await),
        };
        self.events
            .emit(execution_id, EngineEvent::StateUpdated { keys: keys.clone() });
        Ok(keys)
    }

    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let handle = self.open_handle(execution_id).await?;
        info!(%execution_id, "cancel requested");
        handle.cancel.cancel();
        Ok(())
    }

    pub async fn pause(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let handle = self.open_handle(execution_id).await?;
        info!(%execution_id, "pause requested");
        handle.pause.send_replace(true);
        Ok(())
    }

    pub async fn resume(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let handle = self.open_handle(execution_id).await?;
        info!(%execution_id, "resume requested");
        handle.pause.send_replace(false);
        Ok(())
    }

    /// Wait until the execution reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        execution_id: Uuid,
    ) -> Result<WorkflowExecution, EngineError> {
        let live = match self.handle(execution_id) {
            Some(ExecutionHandle::Live(live)) => live,
            Some(ExecutionHandle::Finished(done)) => return Ok(done.snapshot.execution),
            None => {
                let execution = self.stored_execution(execution_id).await?;
                if execution.status.is_terminal() {
                    return Ok(execution);
                }
                return Err(EngineError::ExecutionNotFound(execution_id));
            }
        };
        let mut finished = live.finished.clone();
        drop(live);
        let execution = finished
            .wait_for(Option::is_some)
            .await
            .map_err(|_| StateError::MailboxClosed)?
            .clone();
        execution.ok_or(EngineError::State(StateError::MailboxClosed))
    }

    // -- checkpoints -------------------------------------------------------

    /// Persist a checkpoint of a live or retained finished execution.
    pub async fn create_checkpoint(&self, execution_id: Uuid) -> Result<Uuid, EngineError> {
        let handle = self
            .handle(execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let (snapshot, inputs) = match &handle {
            ExecutionHandle::Live(live) => (live.state.snapshot().await?, Arc::clone(&live.inputs)),
            ExecutionHandle::Finished(done) => (done.snapshot.clone(), Arc::clone(&done.inputs)),
        };
        let checkpoint = self
            .checkpoints
            .create_checkpoint(&snapshot, &inputs)
            .await?;
        let kind = HistoryEventKind::CheckpointCreated {
            checkpoint_id: checkpoint.id,
        };
        match handle {
            ExecutionHandle::Live(live) => {
                live.state.record_event(kind).await?;
            }
            ExecutionHandle::Finished(_) => self.record_finished(execution_id, kind),
        }
        self.events.emit(
            execution_id,
            EngineEvent::CheckpointCreated {
                checkpoint_id: checkpoint.id,
            },
        );
        Ok(checkpoint.id)
    }

    /// Append to the history kept for a finished execution.
    fn record_finished(&self, execution_id: Uuid, kind: HistoryEventKind) {
        if let Some(mut entry) = self.executions.get_mut(&execution_id) {
            if let ExecutionHandle::Finished(done) = entry.value_mut() {
                let history = &mut done.snapshot.state.history;
                let sequence = history.last().map_or(1, |e| e.sequence + 1);
                history.push(HistoryEvent {
                    sequence,
                    at: Utc::now(),
                    kind,
                });
            }
        }
    }

    /// Start a new, independent execution from a checkpoint.
    pub async fn restore(
        &self,
        checkpoint_id: Uuid,
        options: RestoreOptions,
    ) -> Result<Uuid, EngineError> {
        let checkpoint: Checkpoint = self.checkpoints.load_checkpoint(checkpoint_id).await?;
        let key = definition_key(&checkpoint.definition_id, &checkpoint.definition_version);
        let graph = self
            .graph_for(&checkpoint.definition_id, &checkpoint.definition_version)
            .await?
            .ok_or(CheckpointError::DefinitionMissing(key))?;

        let known: Vec<&str> = graph.nodes().iter().map(|n| n.id.as_str()).collect();
        let matches = known.len() == checkpoint.tasks.len()
            && known.iter().all(|id| checkpoint.tasks.contains_key(*id));
        if !matches {
            return Err(CheckpointError::Inconsistent {
                id: checkpoint_id,
                reason: "task set does not match the workflow definition".to_string(),
            }
            .into());
        }

        let definition = Arc::clone(graph.definition());
        let plan = restore_plan(checkpoint, WorkflowExecution::new(&definition));
        info!(
            %checkpoint_id,
            source_execution = %plan.checkpoint.execution_id,
            execution_id = %plan.seed.execution.id,
            "restoring execution from checkpoint"
        );
        let concurrency = options.max_concurrency.or(definition.max_concurrency);
        let timeout = options.timeout_secs.or(definition.timeout_secs);
        self.launch(
            graph,
            plan.seed,
            plan.inputs,
            concurrency,
            timeout,
            options.start_paused,
        )
        .await
    }

    pub async fn list_checkpoints(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<CheckpointSummary>, EngineError> {
        Ok(self.checkpoints.list_checkpoints(execution_id).await?)
    }

    pub async fn delete_checkpoint(&self, checkpoint_id: Uuid) -> Result<(), EngineError> {
        Ok(self.checkpoints.delete_checkpoint(checkpoint_id).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

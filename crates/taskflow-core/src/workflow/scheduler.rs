//! Scheduler: drives one execution from Pending to a terminal status.
//!
//! The run loop owns a `JoinSet` of task workers. Each pass it scans the
//! graph in topological order for tasks whose dependencies and incoming
//! transitions allow them to run, marks them Ready and spawns a worker. A
//! worker waits out any retry delay, passes the admission gate, renders its
//! input from a fresh snapshot and calls the dispatcher. Results come back to
//! the loop, which records them through the state manager, evaluates
//! `publish` values and outgoing transitions against a snapshot that already
//! holds the task's output, and consults the error policy on failure.
//!
//! Pause stops new dispatch; cancel additionally cancels in-flight work.
//! The loop ends when nothing is running and nothing can become ready.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::Value;
use taskflow_types::event::EngineEvent;
use taskflow_types::state::WorkflowState;
use taskflow_types::workflow::{
    ErrorKind, ExecutionStatus, JoinType, SkipCause, TaskError, TaskRunState, TaskRunStatus,
    WorkflowExecution,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::event::EventSink;
use crate::store::{RecordKind, StorageAdapter};

use super::dispatcher::{DispatchRequest, ExecutionGate, TaskDispatcher};
use super::expression::{EvalContext, ExpressionError, ExpressionEvaluator};
use super::graph::{TaskNode, WorkflowGraph};
use super::retry::{ErrorPolicy, PolicyDecision};
use super::state::{StateError, StateManager, StateSnapshot};

// ---------------------------------------------------------------------------
// Run inputs & control
// ---------------------------------------------------------------------------

/// Read-only namespaces of an execution besides `state`.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub input: Value,
    pub parameters: Value,
    pub env: Value,
    /// Instant `now()` evaluates to for the whole execution.
    pub execution_time: DateTime<Utc>,
}

impl RunInputs {
    pub fn context<'a>(&'a self, state: &'a Value) -> EvalContext<'a> {
        EvalContext::new(
            state,
            &self.input,
            &self.parameters,
            &self.env,
            self.execution_time,
        )
    }
}

/// External control of a running execution.
#[derive(Debug, Clone)]
pub struct RunControl {
    pub cancel: CancellationToken,
    /// `true` while paused.
    pub pause: watch::Receiver<bool>,
}

/// Everything a run needs, assembled by the engine.
pub struct RunSetup<S> {
    pub execution_id: Uuid,
    pub graph: Arc<WorkflowGraph>,
    pub state: StateManager,
    pub dispatcher: Arc<TaskDispatcher>,
    pub evaluator: Arc<ExpressionEvaluator>,
    pub events: Arc<dyn EventSink>,
    pub storage: Arc<S>,
    pub inputs: Arc<RunInputs>,
    pub gate: ExecutionGate,
    pub control: RunControl,
    pub workflow_timeout: Option<Duration>,
    /// Set when the run continues from a checkpoint.
    pub restored_from: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// What the scan decides for one Pending task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Readiness {
    Wait,
    /// Eligible. For an `any` join, `release` lists the unfinished
    /// dependencies to skip before it starts.
    Ready { release: Vec<usize> },
    Skip {
        cause: SkipCause,
        reason: String,
        blocked: bool,
    },
}

fn terminal(run: &TaskRunState) -> bool {
    run.status.is_final() || run.is_dead()
}

/// Readiness rule over per-index task states.
pub(crate) fn readiness(graph: &WorkflowGraph, index: usize, runs: &[TaskRunState]) -> Readiness {
    let node = graph.node(index);
    let me = &runs[index];
    let deps = &node.dependencies;

    // A handled failure that released this very task does not block it.
    let satisfied = |d: usize| {
        let dep = &runs[d];
        match dep.status {
            TaskRunStatus::Completed => true,
            TaskRunStatus::Skipped => !dep.blocked,
            TaskRunStatus::Failed => me.activated && dep.error_handled,
            _ => false,
        }
    };
    let blocking = |d: usize| runs[d].is_dead() && !satisfied(d);

    let mut release = Vec::new();
    match node.join {
        JoinType::All => {
            if let Some(&dead) = deps.iter().find(|&&d| blocking(d)) {
                return Readiness::Skip {
                    cause: SkipCause::Upstream,
                    reason: format!("dependency '{}' failed", graph.node(dead).id),
                    blocked: true,
                };
            }
            if !deps.iter().all(|&d| satisfied(d)) {
                return Readiness::Wait;
            }
        }
        JoinType::Any => {
            if let Some(&winner) = deps
                .iter()
                .find(|&&d| runs[d].status == TaskRunStatus::Completed)
            {
                release = deps
                    .iter()
                    .copied()
                    .filter(|&d| d != winner && !terminal(&runs[d]))
                    .collect();
            } else if deps.iter().all(|&d| terminal(&runs[d])) {
                if deps.iter().any(|&d| blocking(d)) {
                    return Readiness::Skip {
                        cause: SkipCause::Upstream,
                        reason: "no dependency of the 'any' join completed".to_string(),
                        blocked: true,
                    };
                }
            } else {
                return Readiness::Wait;
            }
        }
    }

    if node.is_gated() && !me.activated {
        if node.handler_target {
            return Readiness::Wait;
        }
        if node.transition_sources.iter().all(|&s| terminal(&runs[s])) {
            return Readiness::Skip {
                cause: SkipCause::Condition,
                reason: "no incoming transition was taken".to_string(),
                blocked: node.transition_sources.iter().any(|&s| runs[s].is_dead()),
            };
        }
        return Readiness::Wait;
    }

    Readiness::Ready { release }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

struct Shared {
    execution_id: Uuid,
    graph: Arc<WorkflowGraph>,
    state: StateManager,
    dispatcher: Arc<TaskDispatcher>,
    evaluator: Arc<ExpressionEvaluator>,
    events: Arc<dyn EventSink>,
    inputs: Arc<RunInputs>,
    gate: ExecutionGate,
}

/// Cancellation handles of one worker.
#[derive(Clone)]
struct WorkerTokens {
    /// Stops a worker that has not reached its action yet.
    start: CancellationToken,
    /// Cancels the action call itself.
    task: CancellationToken,
}

impl WorkerTokens {
    fn cancel(&self) {
        self.start.cancel();
        self.task.cancel();
    }
}

enum WorkerOutcome {
    /// Stopped before the action was called.
    NotStarted,
    Finished {
        attempt: u32,
        result: Result<Value, TaskError>,
        elapsed: Duration,
    },
    Panicked,
}

impl Shared {
    fn emit(&self, event: EngineEvent) {
        self.events.emit(self.execution_id, event);
    }

    async fn render_input(&self, index: usize) -> Result<Value, TaskError> {
        let snapshot = self
            .state
            .snapshot()
            .await
            .map_err(|e| TaskError::execution(e.to_string()))?;
        let namespace = snapshot.state.to_namespace();
        let ctx = self.inputs.context(&namespace);
        self.evaluator
            .render(&self.graph.task(index).input, &ctx)
            .map_err(expression_failure)
    }

    async fn work(self: Arc<Self>, index: usize, delay: Duration, tokens: WorkerTokens) -> WorkerOutcome {
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = tokens.start.cancelled() => return WorkerOutcome::NotStarted,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let Some(_permit) = self.dispatcher.admit(&self.gate, &tokens.start).await else {
            return WorkerOutcome::NotStarted;
        };
        if tokens.start.is_cancelled() {
            return WorkerOutcome::NotStarted;
        }

        let task = self.graph.task(index);
        let attempt = match self.state.mark_running(&task.id).await {
            Ok(attempt) => attempt,
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "task no longer runnable");
                return WorkerOutcome::NotStarted;
            }
        };
        self.emit(EngineEvent::TaskStarted {
            task_id: task.id.clone(),
            attempt,
        });
        debug!(
            execution_id = %self.execution_id,
            task_id = %task.id,
            attempt,
            action = %task.action,
            "dispatching task"
        );

        let started = Instant::now();
        let result = match self.render_input(index).await {
            Ok(input) => {
                let request = DispatchRequest {
                    task_id: task.id.clone(),
                    action: task.action.clone(),
                    input,
                    timeout: task.timeout_secs.map(Duration::from_secs),
                };
                self.dispatcher.invoke(request, &tokens.task).await
            }
            Err(e) => Err(e),
        };
        WorkerOutcome::Finished {
            attempt,
            result,
            elapsed: started.elapsed(),
        }
    }
}

fn expression_failure(err: ExpressionError) -> TaskError {
    TaskError::new(ErrorKind::Expression, err.to_string())
}

/// Error a task ends with when its pending retry is abandoned.
fn abandoned_retry(run: Option<&TaskRunState>) -> TaskError {
    run.and_then(|r| r.error.clone())
        .unwrap_or_else(TaskError::cancelled)
}

// ---------------------------------------------------------------------------
// ExecutionRun
// ---------------------------------------------------------------------------

pub struct ExecutionRun<S> {
    shared: Arc<Shared>,
    storage: Arc<S>,
    control: RunControl,
    workflow_timeout: Option<Duration>,
    restored_from: Option<Uuid>,

    status: ExecutionStatus,
    /// Parent of every worker token; cancelled on cancel and timeout.
    run_token: CancellationToken,
    /// Parent of every start token; cancelled when the execution halts.
    halt_token: CancellationToken,
    workers: JoinSet<(usize, WorkerOutcome)>,
    tokens: HashMap<usize, WorkerTokens>,
    /// Tasks skipped while a worker was still attached; their results are
    /// dropped.
    superseded: HashSet<usize>,
    /// Reason the execution will end Failed once in-flight work drains.
    halt: Option<String>,
    pause_open: bool,
}

impl<S: StorageAdapter + 'static> ExecutionRun<S> {
    pub fn new(setup: RunSetup<S>) -> Self {
        let run_token = setup.control.cancel.child_token();
        let halt_token = run_token.child_token();
        Self {
            shared: Arc::new(Shared {
                execution_id: setup.execution_id,
                graph: setup.graph,
                state: setup.state,
                dispatcher: setup.dispatcher,
                evaluator: setup.evaluator,
                events: setup.events,
                inputs: setup.inputs,
                gate: setup.gate,
            }),
            storage: setup.storage,
            control: setup.control,
            workflow_timeout: setup.workflow_timeout,
            restored_from: setup.restored_from,
            status: ExecutionStatus::Pending,
            run_token,
            halt_token,
            workers: JoinSet::new(),
            tokens: HashMap::new(),
            superseded: HashSet::new(),
            halt: None,
            pause_open: true,
        }
    }

    /// Drive the execution to a terminal status and return its final state.
    pub async fn run(mut self) -> StateSnapshot {
        let execution_id = self.shared.execution_id;
        if let Err(e) = self.drive().await {
            error!(%execution_id, error = %e, "execution aborted by state error");
            self.workers.abort_all();
            if !self.status.is_terminal() {
                let target = if self.status == ExecutionStatus::Cancelling {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                let _ = self.set_status(target, Some(e.to_string())).await;
            }
        }

        let snapshot = match self.shared.state.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                let mut execution = WorkflowExecution::new(self.shared.graph.definition());
                execution.id = execution_id;
                execution.status = self.status;
                StateSnapshot {
                    execution,
                    state: WorkflowState::default(),
                    tasks: BTreeMap::new(),
                }
            }
        };
        self.shared.emit(EngineEvent::ExecutionFinished {
            status: snapshot.execution.status,
            error: snapshot.execution.error.clone(),
        });
        info!(%execution_id, status = %snapshot.execution.status, "execution finished");
        snapshot
    }

    async fn drive(&mut self) -> Result<(), StateError> {
        let definition = Arc::clone(self.shared.graph.definition());
        self.shared.emit(EngineEvent::ExecutionStarted {
            definition_id: definition.id.clone(),
            definition_version: definition.version.clone(),
            restored_from: self.restored_from,
        });
        self.set_status(ExecutionStatus::Running, None).await?;
        info!(
            execution_id = %self.shared.execution_id,
            workflow = %definition.id,
            version = %definition.version,
            tasks = self.shared.graph.len(),
            restored_from = ?self.restored_from,
            "execution started"
        );

        // Tasks restored mid-dispatch or mid-retry get a worker right away.
        self.resume_active().await?;

        let deadline = self.workflow_timeout.map(|t| Instant::now() + t);
        let mut cancelling = false;
        let mut timed_out = false;

        loop {
            if self.control.cancel.is_cancelled() && !cancelling {
                cancelling = true;
                self.begin_cancel().await?;
            }

            let paused = *self.control.pause.borrow();
            if !cancelling {
                self.sync_pause(paused).await?;
            }

            let dispatching = !cancelling && !paused && self.halt.is_none();
            if dispatching {
                self.scan().await?;
            }

            if self.workers.is_empty() {
                if cancelling || self.halt.is_some() {
                    break;
                }
                if dispatching {
                    if self.release_untriggered_handlers().await? {
                        continue;
                    }
                    break;
                }
                if !self.pause_open {
                    warn!(execution_id = %self.shared.execution_id, "pause control dropped while paused");
                    break;
                }
            }

            let wake_at = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                Some(joined) = self.workers.join_next() => match joined {
                    Ok((index, outcome)) => self.on_worker(index, outcome, cancelling).await?,
                    Err(e) => {
                        error!(execution_id = %self.shared.execution_id, error = %e, "task worker failed");
                        self.halt_with(format!("task worker failed: {e}"));
                    }
                },
                _ = self.control.cancel.cancelled(), if !cancelling => {}
                changed = self.control.pause.changed(), if self.pause_open && !cancelling => {
                    if changed.is_err() {
                        self.pause_open = false;
                    }
                }
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() && !timed_out => {
                    timed_out = true;
                    let limit = self.workflow_timeout.unwrap_or_default();
                    warn!(execution_id = %self.shared.execution_id, timeout_secs = limit.as_secs(), "execution timed out");
                    self.halt_with(format!("execution timed out after {}s", limit.as_secs()));
                    self.run_token.cancel();
                }
            }
        }

        self.finish(cancelling).await
    }

    async fn finish(&mut self, cancelling: bool) -> Result<(), StateError> {
        let snapshot = self.shared.state.snapshot().await?;

        // Leftover retries never got to run again.
        for (id, run) in &snapshot.tasks {
            if run.status == TaskRunStatus::Retrying {
                self.shared
                    .state
                    .fail_task(id, abandoned_retry(Some(run)))
                    .await?;
            }
        }

        if cancelling {
            return self.set_status(ExecutionStatus::Cancelled, None).await;
        }
        if let Some(reason) = self.halt.take() {
            return self.set_status(ExecutionStatus::Failed, Some(reason)).await;
        }

        let unfinished: Vec<&str> = snapshot
            .tasks
            .iter()
            .filter(|(_, run)| !run.is_settled())
            .map(|(id, _)| id.as_str())
            .collect();
        if unfinished.is_empty() {
            self.set_status(ExecutionStatus::Completed, None).await
        } else {
            let reason = format!("tasks did not finish: {}", unfinished.join(", "));
            self.set_status(ExecutionStatus::Failed, Some(reason)).await
        }
    }

    // -- status ------------------------------------------------------------

    async fn set_status(&mut self, to: ExecutionStatus, error: Option<String>) -> Result<(), StateError> {
        let from = self.status;
        let execution = self.shared.state.set_execution_status(to, error).await?;
        self.status = to;
        self.shared.emit(EngineEvent::ExecutionStatusChanged { from, to });
        self.persist(&execution).await;
        Ok(())
    }

    async fn persist(&self, execution: &WorkflowExecution) {
        let record = match serde_json::to_value(execution) {
            Ok(record) => record,
            Err(e) => {
                warn!(execution_id = %execution.id, error = %e, "failed to serialize execution record");
                return;
            }
        };
        if let Err(e) = self
            .storage
            .save(RecordKind::Execution, &execution.id.to_string(), &record)
            .await
        {
            warn!(execution_id = %execution.id, error = %e, "failed to persist execution record");
        }
    }

    async fn sync_pause(&mut self, paused: bool) -> Result<(), StateError> {
        match (paused, self.status) {
            (true, ExecutionStatus::Running) => {
                info!(execution_id = %self.shared.execution_id, "execution paused");
                self.set_status(ExecutionStatus::Paused, None).await
            }
            (false, ExecutionStatus::Paused) => {
                info!(execution_id = %self.shared.execution_id, "execution resumed");
                self.set_status(ExecutionStatus::Running, None).await
            }
            _ => Ok(()),
        }
    }

    async fn begin_cancel(&mut self) -> Result<(), StateError> {
        info!(execution_id = %self.shared.execution_id, "cancelling execution");
        self.run_token.cancel();
        self.set_status(ExecutionStatus::Cancelling, None).await?;

        // Ready tasks have not reached their action yet.
        let snapshot = self.shared.state.snapshot().await?;
        for (id, run) in &snapshot.tasks {
            if run.status == TaskRunStatus::Ready {
                self.skip(id, SkipCause::Cancelled, "execution cancelled", false)
                    .await?;
                if let Some(index) = self.shared.graph.index_of(id) {
                    if self.tokens.contains_key(&index) {
                        self.superseded.insert(index);
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop dispatching. Workers still waiting for their start are stopped;
    /// actions already running drain.
    fn halt_with(&mut self, reason: String) {
        if self.halt.is_none() {
            self.halt = Some(reason);
        }
        self.halt_token.cancel();
    }

    // -- dispatch ----------------------------------------------------------

    fn spawn_worker(&mut self, index: usize, delay: Duration) {
        let tokens = WorkerTokens {
            start: self.halt_token.child_token(),
            task: self.run_token.child_token(),
        };
        self.tokens.insert(index, tokens.clone());
        let shared = Arc::clone(&self.shared);
        self.workers.spawn(async move {
            let outcome = AssertUnwindSafe(shared.work(index, delay, tokens))
                .catch_unwind()
                .await
                .unwrap_or(WorkerOutcome::Panicked);
            (index, outcome)
        });
    }

    async fn resume_active(&mut self) -> Result<(), StateError> {
        let snapshot = self.shared.state.snapshot().await?;
        let graph = Arc::clone(&self.shared.graph);
        for &index in graph.topological_order() {
            let id = &graph.node(index).id;
            match snapshot.status_of(id) {
                Some(TaskRunStatus::Ready) => {
                    self.shared.emit(EngineEvent::TaskReady { task_id: id.clone() });
                    self.spawn_worker(index, Duration::ZERO);
                }
                Some(TaskRunStatus::Retrying) => self.spawn_worker(index, Duration::ZERO),
                _ => {}
            }
        }
        Ok(())
    }

    fn runs_by_index(&self, snapshot: &StateSnapshot) -> Vec<TaskRunState> {
        self.shared
            .graph
            .nodes()
            .iter()
            .map(|node| snapshot.task(&node.id).cloned().unwrap_or_default())
            .collect()
    }

    /// One readiness pass in topological order. Decisions made earlier in
    /// the pass are visible to later tasks.
    async fn scan(&mut self) -> Result<usize, StateError> {
        let snapshot = self.shared.state.snapshot().await?;
        let mut runs = self.runs_by_index(&snapshot);
        let graph = Arc::clone(&self.shared.graph);
        let mut dispatched = 0;

        for &index in graph.topological_order() {
            if runs[index].status != TaskRunStatus::Pending {
                continue;
            }
            match readiness(&graph, index, &runs) {
                Readiness::Wait => {}
                Readiness::Skip {
                    cause,
                    reason,
                    blocked,
                } => {
                    self.skip(&graph.node(index).id, cause, &reason, blocked)
                        .await?;
                    runs[index].status = TaskRunStatus::Skipped;
                    runs[index].blocked = blocked;
                }
                Readiness::Ready { release } => {
                    let id = &graph.node(index).id;
                    for other in release {
                        let reason = format!("'any' join of '{id}' already satisfied");
                        self.supersede(other, &reason).await?;
                        runs[other].status = TaskRunStatus::Skipped;
                    }
                    self.shared.state.mark_ready(id).await?;
                    runs[index].status = TaskRunStatus::Ready;
                    self.shared.emit(EngineEvent::TaskReady { task_id: id.clone() });
                    self.spawn_worker(index, Duration::ZERO);
                    dispatched += 1;
                }
            }
        }

        if dispatched > 0 {
            debug!(execution_id = %self.shared.execution_id, dispatched, "readiness scan");
        }
        Ok(dispatched)
    }

    async fn skip(
        &self,
        task_id: &str,
        cause: SkipCause,
        reason: &str,
        blocked: bool,
    ) -> Result<(), StateError> {
        self.shared
            .state
            .mark_skipped(task_id, cause, reason, blocked)
            .await?;
        debug!(execution_id = %self.shared.execution_id, task_id, reason, "task skipped");
        self.shared.emit(EngineEvent::TaskSkipped {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Skip a task that may already have a worker, cancelling that worker.
    async fn supersede(&mut self, index: usize, reason: &str) -> Result<(), StateError> {
        if let Some(tokens) = self.tokens.get(&index) {
            tokens.cancel();
            self.superseded.insert(index);
        }
        let id = self.shared.graph.node(index).id.clone();
        self.skip(&id, SkipCause::AnyJoin, reason, false).await
    }

    /// At quiescence, handler targets nobody routed to are skipped so their
    /// dependents can settle. Returns whether anything changed.
    async fn release_untriggered_handlers(&mut self) -> Result<bool, StateError> {
        let snapshot = self.shared.state.snapshot().await?;
        let mut changed = false;
        for node in self.shared.graph.nodes() {
            if !node.handler_target {
                continue;
            }
            if let Some(run) = snapshot.task(&node.id) {
                if run.status == TaskRunStatus::Pending && !run.activated {
                    self.skip(
                        &node.id,
                        SkipCause::Handler,
                        "error handler was not triggered",
                        false,
                    )
                    .await?;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    // -- results -----------------------------------------------------------

    async fn on_worker(&mut self, index: usize, outcome: WorkerOutcome, cancelling: bool) -> Result<(), StateError> {
        self.tokens.remove(&index);
        if self.superseded.remove(&index) {
            return Ok(());
        }
        let task_id = self.shared.graph.node(index).id.clone();

        match outcome {
            WorkerOutcome::Finished {
                attempt,
                result: Ok(output),
                elapsed,
            } => self.on_success(index, attempt, output, elapsed).await,
            WorkerOutcome::Finished {
                attempt,
                result: Err(err),
                ..
            } => self.on_failure(index, attempt, err, cancelling).await,
            WorkerOutcome::Panicked | WorkerOutcome::NotStarted => {
                let snapshot = self.shared.state.snapshot().await?;
                let run = snapshot.task(&task_id);
                match run.map(|r| r.status) {
                    Some(TaskRunStatus::Running) => {
                        error!(execution_id = %self.shared.execution_id, task_id = %task_id, "task worker panicked");
                        let attempt = run.map_or(0, |r| r.attempt);
                        let err = TaskError::execution("task worker panicked");
                        self.on_failure(index, attempt, err, cancelling).await
                    }
                    Some(TaskRunStatus::Ready) => {
                        self.skip(&task_id, SkipCause::NotDispatched, "not dispatched", false)
                            .await
                    }
                    Some(TaskRunStatus::Retrying) => {
                        self.shared
                            .state
                            .fail_task(&task_id, abandoned_retry(run))
                            .await
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// `publish` values and the ids of non-error transitions whose guards
    /// hold, evaluated against a context that includes the task's output.
    fn evaluate_completion(
        &self,
        node: &TaskNode,
        ctx: &EvalContext<'_>,
    ) -> Result<(BTreeMap<String, Value>, Vec<String>), ExpressionError> {
        let mut published = BTreeMap::new();
        for (key, expr) in &node.publish {
            published.insert(key.clone(), expr.evaluate(ctx)?.into_json());
        }
        let mut taken = Vec::new();
        for edge in node.transitions.iter().filter(|e| !e.on_error) {
            let take = match &edge.guard {
                None => true,
                Some(guard) => guard.evaluate(ctx)?.truthy(),
            };
            if take {
                taken.push(self.shared.graph.node(edge.target).id.clone());
            }
        }
        Ok((published, taken))
    }

    async fn on_success(
        &mut self,
        index: usize,
        attempt: u32,
        output: Value,
        elapsed: Duration,
    ) -> Result<(), StateError> {
        let graph = Arc::clone(&self.shared.graph);
        let node = graph.node(index);
        self.shared.state.set_task_output(&node.id, output).await?;

        let snapshot = self.shared.state.snapshot().await?;
        let namespace = snapshot.state.to_namespace();
        let ctx = self.shared.inputs.context(&namespace);
        let (published, taken) = match self.evaluate_completion(node, &ctx) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(execution_id = %self.shared.execution_id, task_id = %node.id, error = %e, "completion expressions failed");
                return self
                    .on_failure(index, attempt, expression_failure(e), false)
                    .await;
            }
        };

        let keys: Vec<String> = published.keys().cloned().collect();
        self.shared
            .state
            .complete_task(&node.id, published, taken.clone())
            .await?;
        let duration_ms = elapsed.as_millis() as u64;
        info!(
            execution_id = %self.shared.execution_id,
            task_id = %node.id,
            attempt,
            duration_ms,
            "task completed"
        );
        self.shared.emit(EngineEvent::TaskCompleted {
            task_id: node.id.clone(),
            attempt,
            duration_ms,
        });
        if !keys.is_empty() {
            self.shared.emit(EngineEvent::StateUpdated { keys });
        }
        for to in taken {
            self.shared.emit(EngineEvent::TransitionTaken {
                from: node.id.clone(),
                to,
            });
        }
        Ok(())
    }

    async fn on_failure(
        &mut self,
        index: usize,
        attempt: u32,
        err: TaskError,
        cancelling: bool,
    ) -> Result<(), StateError> {
        let graph = Arc::clone(&self.shared.graph);
        let task_id = &graph.node(index).id;
        self.shared.state.fail_task(task_id, err.clone()).await?;

        // No recovery while the execution is winding down.
        if cancelling || self.halt.is_some() {
            self.shared.emit(EngineEvent::TaskFailed {
                task_id: task_id.clone(),
                attempt,
                error: err,
                will_retry: false,
            });
            return Ok(());
        }

        let snapshot = self.shared.state.snapshot().await?;
        let namespace = snapshot.state.to_namespace();
        let ctx = self.shared.inputs.context(&namespace);
        let failed = snapshot.task(task_id).cloned().unwrap_or_default();
        let decision = ErrorPolicy::new(&graph).decide(index, &failed, &ctx);

        let will_retry = matches!(decision, Ok(PolicyDecision::Retry { .. }));
        warn!(
            execution_id = %self.shared.execution_id,
            task_id = %task_id,
            attempt,
            kind = %err.kind,
            error = %err.message,
            will_retry,
            "task failed"
        );
        self.shared.emit(EngineEvent::TaskFailed {
            task_id: task_id.clone(),
            attempt,
            error: err.clone(),
            will_retry,
        });

        match decision {
            Ok(PolicyDecision::Retry {
                delay,
                next_attempt,
            }) => {
                self.shared.state.mark_retrying(task_id).await?;
                debug!(task_id = %task_id, next_attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
                self.shared.emit(EngineEvent::TaskRetryScheduled {
                    task_id: task_id.clone(),
                    next_attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                self.spawn_worker(index, delay);
            }
            Ok(PolicyDecision::Route { target, via }) => {
                let target_id = &graph.node(target).id;
                info!(
                    execution_id = %self.shared.execution_id,
                    task_id = %task_id,
                    target = %target_id,
                    via = %via,
                    "failure routed"
                );
                self.shared
                    .state
                    .route_error(task_id, target_id, via.as_str())
                    .await?;
            }
            Ok(PolicyDecision::Fail) => {
                self.halt_with(format!("task '{task_id}' failed: {err}"));
            }
            Err(e) => {
                self.halt_with(format!(
                    "task '{task_id}' failed: {err}; error transition could not be evaluated: {e}"
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::ExpressionEvaluator;
    use crate::workflow::test_support::{definition, task};
    use taskflow_types::workflow::{ErrorHandler, Transition};

    fn runs(graph: &WorkflowGraph, states: &[(&str, TaskRunStatus)]) -> Vec<TaskRunState> {
        let mut runs = vec![TaskRunState::default(); graph.len()];
        for (id, status) in states {
            runs[graph.index_of(id).unwrap()].status = *status;
        }
        runs
    }

    fn fork(join: JoinType) -> WorkflowGraph {
        let mut join_task = task("join", &["p1", "p2", "p3"]);
        join_task.join = join;
        let def = definition(vec![
            task("fork", &[]),
            task("p1", &["fork"]),
            task("p2", &["fork"]),
            task("p3", &["fork"]),
            join_task,
        ]);
        WorkflowGraph::build(&def, &ExpressionEvaluator::new()).unwrap()
    }

    #[test]
    fn test_all_join_waits_for_every_branch() {
        let graph = fork(JoinType::All);
        let join = graph.index_of("join").unwrap();
        let partial = runs(
            &graph,
            &[
                ("fork", TaskRunStatus::Completed),
                ("p1", TaskRunStatus::Completed),
                ("p2", TaskRunStatus::Running),
                ("p3", TaskRunStatus::Completed),
            ],
        );
        assert_eq!(readiness(&graph, join, &partial), Readiness::Wait);

        let done = runs(
            &graph,
            &[
                ("fork", TaskRunStatus::Completed),
                ("p1", TaskRunStatus::Completed),
                ("p2", TaskRunStatus::Skipped),
                ("p3", TaskRunStatus::Completed),
            ],
        );
        assert_eq!(
            readiness(&graph, join, &done),
            Readiness::Ready { release: vec![] }
        );
    }

    #[test]
    fn test_all_join_blocked_by_failure() {
        let graph = fork(JoinType::All);
        let join = graph.index_of("join").unwrap();
        let failed = runs(
            &graph,
            &[
                ("fork", TaskRunStatus::Completed),
                ("p1", TaskRunStatus::Completed),
                ("p2", TaskRunStatus::Failed),
                ("p3", TaskRunStatus::Running),
            ],
        );
        assert!(matches!(
            readiness(&graph, join, &failed),
            Readiness::Skip { blocked: true, .. }
        ));
    }

    #[test]
    fn test_any_join_releases_remaining_branches() {
        let graph = fork(JoinType::Any);
        let join = graph.index_of("join").unwrap();
        let first = runs(
            &graph,
            &[
                ("fork", TaskRunStatus::Completed),
                ("p1", TaskRunStatus::Running),
                ("p2", TaskRunStatus::Completed),
                ("p3", TaskRunStatus::Ready),
            ],
        );
        let p1 = graph.index_of("p1").unwrap();
        let p3 = graph.index_of("p3").unwrap();
        assert_eq!(
            readiness(&graph, join, &first),
            Readiness::Ready {
                release: vec![p1, p3]
            }
        );
    }

    #[test]
    fn test_gated_task_skipped_when_no_transition_taken() {
        let mut check = task("check", &[]);
        check.transitions.push(Transition {
            target: "big".to_string(),
            guard: Some("state.tasks.check.output > 10".to_string()),
            automatic: false,
        });
        let def = definition(vec![check, task("big", &[])]);
        let graph = WorkflowGraph::build(&def, &ExpressionEvaluator::new()).unwrap();
        let big = graph.index_of("big").unwrap();

        let running = runs(&graph, &[("check", TaskRunStatus::Running)]);
        assert_eq!(readiness(&graph, big, &running), Readiness::Wait);

        let mut done = runs(&graph, &[("check", TaskRunStatus::Completed)]);
        assert!(matches!(
            readiness(&graph, big, &done),
            Readiness::Skip { blocked: false, .. }
        ));

        done[big].activated = true;
        assert_eq!(
            readiness(&graph, big, &done),
            Readiness::Ready { release: vec![] }
        );
    }

    #[test]
    fn test_handler_target_waits_until_activated() {
        let mut def = definition(vec![task("work", &[]), task("notify", &[])]);
        def.error_handlers.push(ErrorHandler {
            error_kind: None,
            task: "notify".to_string(),
        });
        let graph = WorkflowGraph::build(&def, &ExpressionEvaluator::new()).unwrap();
        let notify = graph.index_of("notify").unwrap();
        let mut state = runs(&graph, &[("work", TaskRunStatus::Completed)]);
        assert_eq!(readiness(&graph, notify, &state), Readiness::Wait);
        state[notify].activated = true;
        assert_eq!(
            readiness(&graph, notify, &state),
            Readiness::Ready { release: vec![] }
        );
    }
}

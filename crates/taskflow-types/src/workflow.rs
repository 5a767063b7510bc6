//! Workflow domain types for taskflow.
//!
//! `WorkflowDefinition` is the immutable, declarative task graph an execution
//! is bound to. This module also holds the execution tracking types
//! (`WorkflowExecution`, `TaskRunState`) and the status state machines that
//! the scheduler and state manager enforce.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative workflow: an ordered set of tasks plus the schema of the
/// input an execution must be submitted with.
///
/// Read-only to the engine. Identity is the `(id, version)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier (e.g. "data-pipeline").
    pub id: String,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered task definitions; ids must be unique.
    pub tasks: Vec<TaskDefinition>,
    /// Schema the execution input is validated against at submit time.
    #[serde(default)]
    pub input_schema: InputSchema,
    /// Workflow-wide error handlers, consulted after a task's own error
    /// transitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_handlers: Vec<ErrorHandler>,
    /// Explicit entry points. When empty, every task without incoming
    /// edges is a start task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub start_tasks: Vec<String>,
    /// Per-execution concurrency cap (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Wall-clock limit for a whole execution in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl WorkflowDefinition {
    /// Storage key for this definition: `id@version`.
    pub fn key(&self) -> String {
        definition_key(&self.id, &self.version)
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Storage key for a definition reference.
pub fn definition_key(id: &str, version: &str) -> String {
    format!("{id}@{version}")
}

// ---------------------------------------------------------------------------
// Task Definition
// ---------------------------------------------------------------------------

/// A single task in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique within a workflow (e.g. "fetch_data").
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The component action this task invokes.
    pub action: ActionRef,
    /// Input template. String leaves may contain `${...}` expressions.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Task ids that must finish before this task becomes eligible.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// How `depends_on` is combined.
    #[serde(default)]
    pub join: JoinType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-task timeout in seconds (engine default applies when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Outgoing transitions, evaluated in order after completion (or on
    /// failure for guards that reference `error`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    /// Global-scope keys to set from expressions once the task completes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub publish: BTreeMap<String, String>,
}

/// Reference to an external component action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionRef {
    pub component: String,
    pub action: String,
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component, self.action)
    }
}

/// How a task waits on its dependencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Every dependency must reach Completed or Skipped.
    #[default]
    All,
    /// The first dependency to complete releases the task; the rest are
    /// skipped.
    Any,
}

/// A directed edge to another task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub target: String,
    /// Boolean guard expression. A guard that references `error` makes this
    /// an error transition, evaluated only when the source task fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    /// Unconditional transition; the guard is ignored.
    #[serde(default)]
    pub automatic: bool,
}

/// Workflow-wide routing of failures by error kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandler {
    /// Kind matched by this handler; `None` catches every kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Task to activate when the handler matches.
    pub task: String,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Longest delay a retry may wait, in seconds (one day).
pub const MAX_RETRY_DELAY_SECS: f64 = 86_400.0;

/// Retry configuration for a task.
///
/// The delay before attempt `n + 1` is
/// `base_delay_secs * backoff_multiplier^(n - 1)`, capped by `max_delay_secs`
/// and never longer than [`MAX_RETRY_DELAY_SECS`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs", alias = "base_delay")]
    pub base_delay_secs: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_secs: Option<f64>,
    /// Error kinds that may be retried; `None` means every retriable kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retriable: Option<Vec<ErrorKind>>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_secs: None,
            retriable: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut secs = self.base_delay_secs * self.backoff_multiplier.powi(exponent);
        if let Some(cap) = self.max_delay_secs {
            secs = secs.min(cap);
        }
        if secs.is_nan() || secs <= 0.0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::try_from_secs_f64(secs.min(MAX_RETRY_DELAY_SECS))
            .unwrap_or(std::time::Duration::ZERO)
    }

    /// Whether errors of `kind` are eligible for another attempt.
    pub fn retries_kind(&self, kind: ErrorKind) -> bool {
        if !kind.is_retriable() {
            return false;
        }
        match &self.retriable {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Fixed classification of task failures.
///
/// The first three kinds are assigned by the dispatch boundary; the engine
/// only adds `expression` (failed transition evaluation) and `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TaskExecution,
    TaskTimeout,
    ComponentUnavailable,
    Expression,
    Cancelled,
}

impl ErrorKind {
    /// Expression and cancellation failures are never retried.
    pub fn is_retriable(self) -> bool {
        !matches!(self, ErrorKind::Expression | ErrorKind::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TaskExecution => "task_execution",
            ErrorKind::TaskTimeout => "task_timeout",
            ErrorKind::ComponentUnavailable => "component_unavailable",
            ErrorKind::Expression => "expression",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_execution" => Ok(ErrorKind::TaskExecution),
            "task_timeout" => Ok(ErrorKind::TaskTimeout),
            "component_unavailable" => Ok(ErrorKind::ComponentUnavailable),
            "expression" => Ok(ErrorKind::Expression),
            "cancelled" => Ok(ErrorKind::Cancelled),
            other => Err(format!("unknown error kind: '{other}'")),
        }
    }
}

/// A classified task failure, as captured in `TaskRunState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TaskExecution, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TaskTimeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ComponentUnavailable, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "task cancelled")
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// JSON shape exposed to error-transition guards as the `error` root.
    pub fn to_expression_value(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind.as_str(),
            "message": self.message,
            "details": self.details.clone().unwrap_or(serde_json::Value::Null),
        })
    }
}

// ---------------------------------------------------------------------------
// Input Schema
// ---------------------------------------------------------------------------

/// Shape of the execution input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, InputField>,
    /// Reject input keys that are not declared in `fields`.
    #[serde(default)]
    pub deny_unknown: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl FieldType {
    pub fn matches(self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => !matches!(value, Value::Null),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Cancelled | ExecutionStatus::Completed | ExecutionStatus::Failed
        )
    }

    /// Legal moves of the execution state machine.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelling)
                | (Running, Paused)
                | (Running, Cancelling)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Cancelling)
                | (Paused, Failed)
                | (Cancelling, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Cancelling => "cancelling",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Status of one task within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl TaskRunStatus {
    /// Completed and Skipped never change again. Failed may still move to
    /// Retrying.
    pub fn is_final(self) -> bool {
        matches!(self, TaskRunStatus::Completed | TaskRunStatus::Skipped)
    }

    /// Dispatched or waiting to be re-dispatched.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskRunStatus::Ready | TaskRunStatus::Running | TaskRunStatus::Retrying
        )
    }

    /// Legal moves of the task state machine. Status only moves forward,
    /// except Failed -> Retrying -> Running for another attempt.
    pub fn can_transition_to(self, next: TaskRunStatus) -> bool {
        use TaskRunStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Skipped)
                | (Failed, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
                | (Retrying, Skipped)
        )
    }
}

impl fmt::Display for TaskRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskRunStatus::Pending => "pending",
            TaskRunStatus::Ready => "ready",
            TaskRunStatus::Running => "running",
            TaskRunStatus::Retrying => "retrying",
            TaskRunStatus::Completed => "completed",
            TaskRunStatus::Failed => "failed",
            TaskRunStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// A single execution of a workflow definition. Persisted through the
/// storage adapter on every status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution id.
    pub id: Uuid,
    pub definition_id: String,
    pub definition_version: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Checkpoint this execution was restored from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<Uuid>,
    /// Reason for a Failed status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(definition: &WorkflowDefinition) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_id: definition.id.clone(),
            definition_version: definition.version.clone(),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            restored_from: None,
            error: None,
        }
    }
}

/// Why a task ended Skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    /// No incoming transition was taken.
    Condition,
    /// A dependency failed or was itself blocked.
    Upstream,
    /// Another dependency already satisfied an `any` join.
    AnyJoin,
    /// Error handler target that no failure routed to.
    Handler,
    /// Still waiting for dispatch when the execution was cancelled.
    Cancelled,
    /// Still waiting for dispatch when the execution halted.
    NotDispatched,
}

impl SkipCause {
    /// The task never got its turn, so a restored run should schedule it
    /// again.
    pub fn is_interrupted(self) -> bool {
        matches!(
            self,
            SkipCause::Cancelled | SkipCause::NotDispatched | SkipCause::Handler
        )
    }
}

/// Runtime state of one task within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunState {
    pub status: TaskRunStatus,
    /// Number of attempts started so far (1-based once running).
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// An incoming transition or error handler has released this task.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub activated: bool,
    /// The failure was routed to a transition or handler and does not fail
    /// the execution.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error_handled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_cause: Option<SkipCause>,
    /// Skipped because an upstream task failed; dependents are skipped too.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
}

impl Default for TaskRunState {
    fn default() -> Self {
        Self {
            status: TaskRunStatus::Pending,
            attempt: 0,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
            activated: false,
            error_handled: false,
            skip_reason: None,
            skip_cause: None,
            blocked: false,
        }
    }
}

impl TaskRunState {
    /// Counts toward a Completed execution.
    pub fn is_settled(&self) -> bool {
        self.status.is_final() || (self.status == TaskRunStatus::Failed && self.error_handled)
    }

    /// Failed, or skipped because of an upstream failure.
    pub fn is_dead(&self) -> bool {
        self.status == TaskRunStatus::Failed || (self.status == TaskRunStatus::Skipped && self.blocked)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

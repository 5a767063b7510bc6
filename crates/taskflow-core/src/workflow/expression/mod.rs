//! Sandboxed expression language for transition guards, `publish` values
//! and `${...}` input templates.
//!
//! Expressions read from five roots: `state`, `input`, `parameters`, `env`
//! and, inside error transitions, `error`. They can call only the built-ins
//! in the built-in table, never mutate anything, and see time only through
//! `now()`, which is bound to the execution's start time so checkpoint
//! replays evaluate identically.
//!
//! **Security note:** values always arrive through the context, never by
//! splicing text into an expression string.

mod eval;
mod functions;
mod lexer;
mod parser;
mod template;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

pub use eval::ExprValue;

use parser::Expr;
use template::Segment;

/// Entries kept in the compiled-expression cache before it is flushed.
const CACHE_LIMIT: usize = 4096;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("parse error in `{expression}` at offset {position}: {message}")]
    Parse {
        expression: String,
        position: usize,
        message: String,
    },

    #[error("evaluation error in `{expression}`{}: {message}", at_path(.path))]
    Eval {
        expression: String,
        path: Option<String>,
        message: String,
    },
}

fn at_path(path: &Option<String>) -> String {
    path.as_deref()
        .map(|p| format!(" at `{p}`"))
        .unwrap_or_default()
}

impl ExpressionError {
    pub fn expression(&self) -> &str {
        match self {
            ExpressionError::Parse { expression, .. } | ExpressionError::Eval { expression, .. } => {
                expression
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// Read-only view an expression is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub state: &'a Value,
    pub input: &'a Value,
    pub parameters: &'a Value,
    pub env: &'a Value,
    pub error: Option<&'a Value>,
    /// Execution time returned by `now()`.
    pub now: DateTime<Utc>,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        state: &'a Value,
        input: &'a Value,
        parameters: &'a Value,
        env: &'a Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state,
            input,
            parameters,
            env,
            error: None,
            now,
        }
    }

    /// Expose a failure under the `error` root.
    pub fn with_error(mut self, error: &'a Value) -> Self {
        self.error = Some(error);
        self
    }

    fn root(&self, name: &str) -> Option<&'a Value> {
        match name {
            "state" => Some(self.state),
            "input" => Some(self.input),
            "parameters" => Some(self.parameters),
            "env" => Some(self.env),
            "error" => self.error,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled expressions
// ---------------------------------------------------------------------------

/// A parsed expression, cheap to clone and safe to share across tasks.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: Arc<str>,
    expr: Arc<Expr>,
}

impl CompiledExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the expression reads from the given root (e.g. `error`).
    pub fn references_root(&self, root: &str) -> bool {
        self.expr.references_root(root)
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<ExprValue, ExpressionError> {
        eval::evaluate(&self.expr, ctx).map_err(|failure| ExpressionError::Eval {
            expression: self.source.to_string(),
            path: failure.path,
            message: failure.message,
        })
    }
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// Compiles and evaluates expressions, caching parse trees by source text.
///
/// Used for:
/// - Transition guards (e.g. `state.tasks.fetch.output.rows > 0`)
/// - Error transitions (e.g. `error.kind == 'task_timeout'`)
/// - `publish` values and `${...}` task input templates
#[derive(Debug, Default)]
pub struct ExpressionEvaluator {
    cache: DashMap<String, Arc<Expr>>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an expression, reusing a cached tree when available.
    pub fn compile(&self, source: &str) -> Result<CompiledExpression, ExpressionError> {
        if let Some(expr) = self.cache.get(source) {
            return Ok(CompiledExpression {
                source: Arc::from(source),
                expr: Arc::clone(expr.value()),
            });
        }

        let expr = Arc::new(parser::parse(source).map_err(|e| ExpressionError::Parse {
            expression: source.to_string(),
            position: e.position,
            message: e.message,
        })?);

        if self.cache.len() >= CACHE_LIMIT {
            self.cache.clear();
        }
        self.cache.insert(source.to_string(), Arc::clone(&expr));

        Ok(CompiledExpression {
            source: Arc::from(source),
            expr,
        })
    }

    /// Evaluate an expression to a typed value.
    pub fn evaluate(
        &self,
        source: &str,
        ctx: &EvalContext<'_>,
    ) -> Result<ExprValue, ExpressionError> {
        self.compile(source)?.evaluate(ctx)
    }

    /// Evaluate a condition. Non-boolean results are coerced; undefined is
    /// false.
    pub fn evaluate_bool(&self, source: &str, ctx: &EvalContext<'_>) -> Result<bool, ExpressionError> {
        Ok(self.evaluate(source, ctx)?.truthy())
    }

    /// Whether a guard reads from the `error` root.
    pub fn references_root(&self, source: &str, root: &str) -> Result<bool, ExpressionError> {
        Ok(self.compile(source)?.references_root(root))
    }

    /// Render a value template: every string leaf containing `${...}` is
    /// interpolated, everything else is copied.
    pub fn render(&self, value: &Value, ctx: &EvalContext<'_>) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) if template::has_interpolation(s) => self.interpolate(s, ctx),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render(item, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), self.render(value, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Check every expression embedded in a template without evaluating.
    pub fn validate_template(&self, value: &Value) -> Result<(), ExpressionError> {
        match value {
            Value::String(s) if template::has_interpolation(s) => {
                for segment in self.segments(s)? {
                    if let Segment::Expr { source, offset } = segment {
                        self.compile(&source).map_err(|e| shift(e, s, offset))?;
                    }
                }
                Ok(())
            }
            Value::Array(items) => items.iter().try_for_each(|item| self.validate_template(item)),
            Value::Object(map) => map.values().try_for_each(|v| self.validate_template(v)),
            _ => Ok(()),
        }
    }

    fn segments(&self, source: &str) -> Result<Vec<Segment>, ExpressionError> {
        template::segments(source).map_err(|e| ExpressionError::Parse {
            expression: source.to_string(),
            position: e.position,
            message: e.message,
        })
    }

    fn interpolate(&self, template: &str, ctx: &EvalContext<'_>) -> Result<Value, ExpressionError> {
        let segments = self.segments(template)?;

        // A lone expression keeps its type.
        if let [Segment::Expr { source, offset }] = segments.as_slice() {
            let compiled = self.compile(source).map_err(|e| shift(e, template, *offset))?;
            return Ok(compiled.evaluate(ctx)?.into_json());
        }

        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Text(text) => out.push_str(&text),
                Segment::Expr { source, offset } => {
                    let compiled = self.compile(&source).map_err(|e| shift(e, template, offset))?;
                    match compiled.evaluate(ctx)? {
                        // Missing optional values render as nothing.
                        ExprValue::Undefined => {}
                        ExprValue::Json(value) => out.push_str(&functions::display(&value)),
                    }
                }
            }
        }
        Ok(Value::String(out))
    }
}

/// Re-anchor a parse error from an embedded expression onto its template.
fn shift(err: ExpressionError, template: &str, offset: usize) -> ExpressionError {
    match err {
        ExpressionError::Parse {
            position, message, ..
        } => ExpressionError::Parse {
            expression: template.to_string(),
            position: offset + position,
            message,
        },
        other => other,
    }
}

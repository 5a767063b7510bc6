//! Tree-walking evaluation against a read-only context.
//!
//! Paths that do not resolve produce `ExprValue::Undefined`. Undefined is
//! falsy, never equal to a defined value and never ordered; arithmetic on
//! it is an evaluation error.

use serde_json::{Number, Value};

use super::functions::{self, CallContext};
use super::parser::{BinaryOp, Expr, UnaryOp};
use super::EvalContext;

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    /// A path that did not resolve, or the `undefined` literal.
    Undefined,
    Json(Value),
}

impl ExprValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, ExprValue::Undefined)
    }

    /// Boolean coercion: undefined, null, false, 0, "" are falsy.
    pub fn truthy(&self) -> bool {
        match self {
            ExprValue::Undefined => false,
            ExprValue::Json(value) => json_truthy(value),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ExprValue::Undefined => None,
            ExprValue::Json(value) => Some(value),
        }
    }

    /// Convert to JSON; undefined becomes `null`.
    pub fn into_json(self) -> Value {
        match self {
            ExprValue::Undefined => Value::Null,
            ExprValue::Json(value) => value,
        }
    }
}

impl From<Value> for ExprValue {
    fn from(value: Value) -> Self {
        ExprValue::Json(value)
    }
}

pub(crate) fn json_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Structural equality where numbers compare by value (`1 == 1.0`).
pub(crate) fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| json_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Evaluation failure before it is attached to the expression text.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EvalFailure {
    pub path: Option<String>,
    pub message: String,
}

impl EvalFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            path: None,
            message: message.into(),
        }
    }

    fn at(expr: &Expr, message: impl Into<String>) -> Self {
        Self {
            path: expr.path(),
            message: message.into(),
        }
    }
}

/// A value reached by path navigation: borrowed from the context where
/// possible so large state snapshots are not cloned per step.
enum Place<'a> {
    Borrowed(&'a Value),
    Owned(Value),
    Undefined,
}

impl Place<'_> {
    fn child(self, key: &Value) -> Self {
        fn get<'v>(value: &'v Value, key: &Value) -> Option<&'v Value> {
            match (value, key) {
                (Value::Object(map), Value::String(k)) => map.get(k),
                (Value::Array(items), Value::Number(n)) => {
                    n.as_u64().and_then(|i| items.get(i as usize))
                }
                _ => None,
            }
        }
        match self {
            Place::Borrowed(value) => get(value, key).map_or(Place::Undefined, Place::Borrowed),
            Place::Owned(value) => get(&value, key)
                .cloned()
                .map_or(Place::Undefined, Place::Owned),
            Place::Undefined => Place::Undefined,
        }
    }

    fn into_value(self) -> ExprValue {
        match self {
            Place::Borrowed(value) => ExprValue::Json(value.clone()),
            Place::Owned(value) => ExprValue::Json(value),
            Place::Undefined => ExprValue::Undefined,
        }
    }
}

pub(crate) fn evaluate(expr: &Expr, ctx: &EvalContext<'_>) -> Result<ExprValue, EvalFailure> {
    match expr {
        Expr::Literal(value) => Ok(ExprValue::Json(value.clone())),
        Expr::Undefined => Ok(ExprValue::Undefined),
        Expr::Variable(_) | Expr::Member { .. } | Expr::Index { .. } => {
            Ok(place(expr, ctx)?.into_value())
        }
        Expr::Array(items) => {
            let values = items
                .iter()
                .map(|item| evaluate(item, ctx).map(ExprValue::into_json))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ExprValue::Json(Value::Array(values)))
        }
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, ctx)?;
            match op {
                UnaryOp::Not => Ok(ExprValue::Json(Value::Bool(!value.truthy()))),
                UnaryOp::Neg => match value {
                    ExprValue::Undefined => {
                        Err(EvalFailure::at(operand, "cannot negate an undefined value"))
                    }
                    ExprValue::Json(Value::Number(n)) => {
                        let negated = match n.as_i64() {
                            Some(i) if i != i64::MIN => Value::from(-i),
                            _ => functions::number_value(-n.as_f64().unwrap_or(0.0))
                                .map_err(|m| EvalFailure::at(operand, m))?,
                        };
                        Ok(ExprValue::Json(negated))
                    }
                    ExprValue::Json(other) => Err(EvalFailure::at(
                        operand,
                        format!("cannot negate {}", describe(&other)),
                    )),
                },
            }
        }
        Expr::Binary { op, left, right } => binary(*op, left, right, ctx),
        Expr::Conditional {
            condition,
            then_branch,
            else_branch,
        } => {
            if evaluate(condition, ctx)?.truthy() {
                evaluate(then_branch, ctx)
            } else {
                evaluate(else_branch, ctx)
            }
        }
        Expr::Call { name, args } => call(name, args, ctx),
    }
}

fn place<'a>(expr: &Expr, ctx: &'a EvalContext<'_>) -> Result<Place<'a>, EvalFailure> {
    match expr {
        Expr::Variable(name) => Ok(ctx.root(name).map_or(Place::Undefined, Place::Borrowed)),
        Expr::Member { object, property } => {
            Ok(place(object, ctx)?.child(&Value::String(property.clone())))
        }
        Expr::Index { object, index } => {
            let base = place(object, ctx)?;
            match evaluate(index, ctx)? {
                ExprValue::Undefined => Ok(Place::Undefined),
                ExprValue::Json(key @ (Value::String(_) | Value::Number(_))) => Ok(base.child(&key)),
                ExprValue::Json(other) => Err(EvalFailure::at(
                    expr,
                    format!("cannot index with {}", describe(&other)),
                )),
            }
        }
        other => Ok(match evaluate(other, ctx)? {
            ExprValue::Undefined => Place::Undefined,
            ExprValue::Json(value) => Place::Owned(value),
        }),
    }
}

fn binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &EvalContext<'_>,
) -> Result<ExprValue, EvalFailure> {
    // Short-circuit forms evaluate the right side lazily.
    match op {
        BinaryOp::And => {
            let result = evaluate(left, ctx)?.truthy() && evaluate(right, ctx)?.truthy();
            return Ok(ExprValue::Json(Value::Bool(result)));
        }
        BinaryOp::Or => {
            let result = evaluate(left, ctx)?.truthy() || evaluate(right, ctx)?.truthy();
            return Ok(ExprValue::Json(Value::Bool(result)));
        }
        _ => {}
    }

    let lhs = evaluate(left, ctx)?;
    let rhs = evaluate(right, ctx)?;

    match op {
        BinaryOp::Eq => Ok(bool_value(values_equal(&lhs, &rhs))),
        BinaryOp::NotEq => Ok(bool_value(!values_equal(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            compare(op, &lhs, &rhs, left, right)
        }
        BinaryOp::In => membership(&lhs, &rhs, right),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, lhs, rhs, left, right)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn bool_value(b: bool) -> ExprValue {
    ExprValue::Json(Value::Bool(b))
}

fn values_equal(a: &ExprValue, b: &ExprValue) -> bool {
    match (a, b) {
        (ExprValue::Undefined, ExprValue::Undefined) => true,
        (ExprValue::Json(x), ExprValue::Json(y)) => json_equal(x, y),
        _ => false,
    }
}

fn compare(
    op: BinaryOp,
    lhs: &ExprValue,
    rhs: &ExprValue,
    left: &Expr,
    right: &Expr,
) -> Result<ExprValue, EvalFailure> {
    use std::cmp::Ordering;

    let ordering = match (lhs, rhs) {
        (ExprValue::Undefined, _)
        | (_, ExprValue::Undefined)
        | (ExprValue::Json(Value::Null), _)
        | (_, ExprValue::Json(Value::Null)) => return Ok(bool_value(false)),
        (ExprValue::Json(Value::Number(a)), ExprValue::Json(Value::Number(b))) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            match a.partial_cmp(&b) {
                Some(ordering) => ordering,
                None => return Ok(bool_value(false)),
            }
        }
        (ExprValue::Json(Value::String(a)), ExprValue::Json(Value::String(b))) => a.cmp(b),
        (ExprValue::Json(a), ExprValue::Json(b)) => {
            let culprit = if matches!(a, Value::Number(_) | Value::String(_)) {
                right
            } else {
                left
            };
            return Err(EvalFailure::at(
                culprit,
                format!(
                    "cannot compare {} with {} using '{}'",
                    describe(a),
                    describe(b),
                    op.symbol()
                ),
            ));
        }
    };

    let result = match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::LtEq => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    };
    Ok(bool_value(result))
}

fn membership(lhs: &ExprValue, rhs: &ExprValue, right: &Expr) -> Result<ExprValue, EvalFailure> {
    let ExprValue::Json(needle) = lhs else {
        return Ok(bool_value(false));
    };
    match rhs {
        ExprValue::Undefined | ExprValue::Json(Value::Null) => Ok(bool_value(false)),
        ExprValue::Json(Value::Array(items)) => {
            Ok(bool_value(items.iter().any(|item| json_equal(item, needle))))
        }
        ExprValue::Json(Value::String(hay)) => match needle {
            Value::String(n) => Ok(bool_value(hay.contains(n.as_str()))),
            other => Err(EvalFailure::at(
                right,
                format!("cannot search a string for {}", describe(other)),
            )),
        },
        ExprValue::Json(Value::Object(map)) => match needle {
            Value::String(key) => Ok(bool_value(map.contains_key(key))),
            other => Err(EvalFailure::at(
                right,
                format!("object keys are strings, got {}", describe(other)),
            )),
        },
        ExprValue::Json(other) => Err(EvalFailure::at(
            right,
            format!("'in' is not defined for {}", describe(other)),
        )),
    }
}

fn arithmetic(
    op: BinaryOp,
    lhs: ExprValue,
    rhs: ExprValue,
    left: &Expr,
    right: &Expr,
) -> Result<ExprValue, EvalFailure> {
    let lhs = match lhs {
        ExprValue::Undefined => {
            return Err(EvalFailure::at(
                left,
                format!("arithmetic '{}' on an undefined value", op.symbol()),
            ));
        }
        ExprValue::Json(value) => value,
    };
    let rhs = match rhs {
        ExprValue::Undefined => {
            return Err(EvalFailure::at(
                right,
                format!("arithmetic '{}' on an undefined value", op.symbol()),
            ));
        }
        ExprValue::Json(value) => value,
    };

    match (&lhs, &rhs) {
        (Value::Number(a), Value::Number(b)) => number_op(op, a, b)
            .map(ExprValue::Json)
            .map_err(|m| EvalFailure::at(right, m)),
        (Value::String(_), _) | (_, Value::String(_)) if op == BinaryOp::Add => {
            let joined = functions::display(&lhs) + &functions::display(&rhs);
            Ok(ExprValue::Json(Value::String(joined)))
        }
        (Value::Array(a), Value::Array(b)) if op == BinaryOp::Add => {
            let mut items = a.clone();
            items.extend(b.iter().cloned());
            Ok(ExprValue::Json(Value::Array(items)))
        }
        _ => {
            let culprit = if lhs.is_number() { right } else { left };
            Err(EvalFailure::at(
                culprit,
                format!(
                    "cannot apply '{}' to {} and {}",
                    op.symbol(),
                    describe(&lhs),
                    describe(&rhs)
                ),
            ))
        }
    }
}

fn number_op(op: BinaryOp, a: &Number, b: &Number) -> Result<Value, String> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Rem if y != 0 => x.checked_rem(y),
            _ => None,
        };
        if let Some(result) = exact {
            return Ok(Value::from(result));
        }
    }

    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => {
            if y == 0.0 {
                return Err("division by zero".to_string());
            }
            x / y
        }
        BinaryOp::Rem => {
            if y == 0.0 {
                return Err("remainder by zero".to_string());
            }
            x % y
        }
        other => return Err(format!("'{}' is not arithmetic", other.symbol())),
    };
    functions::number_value(result)
}

fn call(name: &str, args: &[Expr], ctx: &EvalContext<'_>) -> Result<ExprValue, EvalFailure> {
    let builtin = functions::lookup(name)
        .ok_or_else(|| EvalFailure::new(format!("unknown function '{name}'")))?;

    let mut values = Vec::with_capacity(args.len());
    for (index, arg) in args.iter().enumerate() {
        let value = evaluate(arg, ctx)?;
        if value.is_undefined() && !builtin.accepts_undefined {
            return Err(EvalFailure::at(
                arg,
                format!("argument {} of {name}() is undefined", index + 1),
            ));
        }
        values.push(value);
    }

    let call_ctx = CallContext { now: ctx.now };
    (builtin.call)(&values, &call_ctx)
        .map(ExprValue::Json)
        .map_err(|message| EvalFailure::new(format!("{name}(): {message}")))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) if s.len() <= 32 => format!("string '{s}'"),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

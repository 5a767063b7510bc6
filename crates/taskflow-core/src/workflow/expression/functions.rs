//! Whitelisted built-in functions.
//!
//! This table is the only way an expression can call code. Every entry is
//! pure: no I/O, no randomness, and `now()` reads the execution time from
//! the call context rather than the wall clock.

use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use serde_json::{Number, Value};

use super::eval::ExprValue;

/// Values a built-in can see besides its arguments.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallContext {
    pub now: DateTime<Utc>,
}

type BuiltinFn = fn(&[ExprValue], &CallContext) -> Result<Value, String>;

pub(crate) struct Builtin {
    pub name: &'static str,
    pub min_args: usize,
    /// `None` for variadic functions.
    pub max_args: Option<usize>,
    /// Whether `undefined` may be passed; otherwise the evaluator rejects
    /// the call before invoking it.
    pub accepts_undefined: bool,
    pub call: BuiltinFn,
}

const fn builtin(name: &'static str, min: usize, max: Option<usize>, call: BuiltinFn) -> Builtin {
    Builtin {
        name,
        min_args: min,
        max_args: max,
        accepts_undefined: false,
        call,
    }
}

const fn lenient(name: &'static str, min: usize, max: Option<usize>, call: BuiltinFn) -> Builtin {
    Builtin {
        name,
        min_args: min,
        max_args: max,
        accepts_undefined: true,
        call,
    }
}

static BUILTINS: &[Builtin] = &[
    // strings
    builtin("upper", 1, Some(1), upper),
    builtin("lower", 1, Some(1), lower),
    builtin("trim", 1, Some(1), trim),
    builtin("length", 1, Some(1), length),
    builtin("contains", 2, Some(2), contains),
    builtin("starts_with", 2, Some(2), starts_with),
    builtin("ends_with", 2, Some(2), ends_with),
    builtin("split", 2, Some(2), split),
    builtin("join", 2, Some(2), join),
    builtin("replace", 3, Some(3), replace),
    builtin("substring", 2, Some(3), substring),
    builtin("concat", 1, None, concat),
    builtin("to_string", 1, Some(1), to_string),
    builtin("keys", 1, Some(1), keys),
    // math
    builtin("to_number", 1, Some(1), to_number),
    builtin("abs", 1, Some(1), abs),
    builtin("min", 1, None, min),
    builtin("max", 1, None, max),
    builtin("round", 1, Some(2), round),
    builtin("floor", 1, Some(1), floor),
    builtin("ceil", 1, Some(1), ceil),
    // presence
    lenient("is_defined", 1, Some(1), is_defined),
    lenient("is_null", 1, Some(1), is_null),
    lenient("default", 2, Some(2), default),
    lenient("coalesce", 1, None, coalesce),
    // dates
    builtin("now", 0, Some(0), now),
    builtin("format_date", 2, Some(2), format_date),
    builtin("parse_date", 1, Some(2), parse_date),
    builtin("add_seconds", 2, Some(2), add_seconds),
    builtin("diff_seconds", 2, Some(2), diff_seconds),
];

pub(crate) fn lookup(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

// ---------------------------------------------------------------------------
// Shared conversions
// ---------------------------------------------------------------------------

fn arg(args: &[ExprValue], index: usize) -> &Value {
    static NULL: Value = Value::Null;
    match args.get(index) {
        Some(ExprValue::Json(value)) => value,
        _ => &NULL,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn string_arg<'a>(args: &'a [ExprValue], index: usize) -> Result<&'a str, String> {
    let value = arg(args, index);
    value
        .as_str()
        .ok_or_else(|| format!("argument {} must be a string, got {}", index + 1, type_name(value)))
}

fn number_arg(args: &[ExprValue], index: usize) -> Result<f64, String> {
    let value = arg(args, index);
    value
        .as_f64()
        .ok_or_else(|| format!("argument {} must be a number, got {}", index + 1, type_name(value)))
}

/// Render a value for string contexts: strings as-is, everything else as
/// compact JSON.
pub(crate) fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Wrap an f64 result, keeping integral values as JSON integers.
pub(crate) fn number_value(n: f64) -> Result<Value, String> {
    if !n.is_finite() {
        return Err("result is not a finite number".to_string());
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Ok(Value::Number(Number::from(n as i64)));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| "result is not a finite number".to_string())
}

fn timestamp_arg(args: &[ExprValue], index: usize) -> Result<DateTime<Utc>, String> {
    match arg(args, index) {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("argument {} is not an RFC 3339 timestamp: {e}", index + 1)),
        Value::Number(n) => {
            let secs = n.as_f64().unwrap_or(f64::NAN);
            if !secs.is_finite() {
                return Err(format!("argument {} is not a valid epoch timestamp", index + 1));
            }
            DateTime::from_timestamp_millis((secs * 1000.0) as i64)
                .ok_or_else(|| format!("argument {} is out of range", index + 1))
        }
        other => Err(format!(
            "argument {} must be a timestamp, got {}",
            index + 1,
            type_name(other)
        )),
    }
}

fn timestamp_value(dt: DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

fn upper(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    Ok(Value::String(string_arg(args, 0)?.to_uppercase()))
}

fn lower(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    Ok(Value::String(string_arg(args, 0)?.to_lowercase()))
}

fn trim(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    Ok(Value::String(string_arg(args, 0)?.trim().to_string()))
}

fn length(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let len = match arg(args, 0) {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => return Err(format!("length() is not defined for {}", type_name(other))),
    };
    Ok(Value::from(len))
}

fn contains(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let needle = arg(args, 1);
    let found = match arg(args, 0) {
        Value::String(hay) => hay.contains(string_arg(args, 1)?),
        Value::Array(items) => items.iter().any(|item| super::eval::json_equal(item, needle)),
        Value::Object(map) => map.contains_key(string_arg(args, 1)?),
        other => return Err(format!("contains() is not defined for {}", type_name(other))),
    };
    Ok(Value::Bool(found))
}

fn starts_with(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    Ok(Value::Bool(string_arg(args, 0)?.starts_with(string_arg(args, 1)?)))
}

fn ends_with(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    Ok(Value::Bool(string_arg(args, 0)?.ends_with(string_arg(args, 1)?)))
}

fn split(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let subject = string_arg(args, 0)?;
    let delimiter = string_arg(args, 1)?;
    if delimiter.is_empty() {
        return Ok(Value::Array(
            subject.chars().map(|c| Value::String(c.to_string())).collect(),
        ));
    }
    Ok(Value::Array(
        subject
            .split(delimiter)
            .map(|part| Value::String(part.to_string()))
            .collect(),
    ))
}

fn join(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let Value::Array(items) = arg(args, 0) else {
        return Err(format!(
            "argument 1 must be an array, got {}",
            type_name(arg(args, 0))
        ));
    };
    let separator = string_arg(args, 1)?;
    let parts: Vec<String> = items.iter().map(display).collect();
    Ok(Value::String(parts.join(separator)))
}

fn replace(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let subject = string_arg(args, 0)?;
    let from = string_arg(args, 1)?;
    let to = string_arg(args, 2)?;
    if from.is_empty() {
        return Ok(Value::String(subject.to_string()));
    }
    Ok(Value::String(subject.replace(from, to)))
}

fn substring(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let subject = string_arg(args, 0)?;
    let len = subject.chars().count();
    let start = (number_arg(args, 1)?.max(0.0) as usize).min(len);
    let end = if args.len() > 2 {
        (number_arg(args, 2)?.max(0.0) as usize).min(len)
    } else {
        len
    };
    if end <= start {
        return Ok(Value::String(String::new()));
    }
    Ok(Value::String(
        subject.chars().skip(start).take(end - start).collect(),
    ))
}

fn concat(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let mut out = String::new();
    for index in 0..args.len() {
        out.push_str(&display(arg(args, index)));
    }
    Ok(Value::String(out))
}

fn to_string(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    Ok(Value::String(display(arg(args, 0))))
}

fn keys(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    match arg(args, 0) {
        Value::Object(map) => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        other => Err(format!("keys() is not defined for {}", type_name(other))),
    }
}

// ---------------------------------------------------------------------------
// Math
// ---------------------------------------------------------------------------

fn to_number(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    match arg(args, 0) {
        Value::Number(n) => Ok(Value::Number(n.clone())),
        Value::Bool(b) => Ok(Value::from(u8::from(*b))),
        Value::String(s) => {
            let parsed: f64 = s
                .trim()
                .parse()
                .map_err(|_| format!("'{s}' is not a number"))?;
            number_value(parsed)
        }
        other => Err(format!("cannot convert {} to a number", type_name(other))),
    }
}

fn abs(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    number_value(number_arg(args, 0)?.abs())
}

fn numbers(args: &[ExprValue]) -> Result<Vec<f64>, String> {
    // A single array argument is spread.
    if let [ExprValue::Json(Value::Array(items))] = args {
        return items
            .iter()
            .map(|item| {
                item.as_f64()
                    .ok_or_else(|| format!("array element must be a number, got {}", type_name(item)))
            })
            .collect();
    }
    (0..args.len()).map(|i| number_arg(args, i)).collect()
}

fn min(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let values = numbers(args)?;
    let smallest = values
        .into_iter()
        .reduce(f64::min)
        .ok_or_else(|| "min() of an empty list".to_string())?;
    number_value(smallest)
}

fn max(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let values = numbers(args)?;
    let largest = values
        .into_iter()
        .reduce(f64::max)
        .ok_or_else(|| "max() of an empty list".to_string())?;
    number_value(largest)
}

fn round(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let n = number_arg(args, 0)?;
    let digits = if args.len() > 1 {
        number_arg(args, 1)?.clamp(0.0, 15.0) as i32
    } else {
        0
    };
    let factor = 10f64.powi(digits);
    number_value((n * factor).round() / factor)
}

fn floor(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    number_value(number_arg(args, 0)?.floor())
}

fn ceil(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    number_value(number_arg(args, 0)?.ceil())
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

fn is_defined(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    Ok(Value::Bool(!matches!(args.first(), Some(ExprValue::Undefined) | None)))
}

fn is_null(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    Ok(Value::Bool(matches!(args.first(), Some(ExprValue::Json(Value::Null)))))
}

fn default(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    match args.first() {
        Some(ExprValue::Json(value)) if !value.is_null() => Ok(value.clone()),
        _ => Ok(arg(args, 1).clone()),
    }
}

fn coalesce(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    Ok(args
        .iter()
        .find_map(|a| match a {
            ExprValue::Json(value) if !value.is_null() => Some(value.clone()),
            _ => None,
        })
        .unwrap_or(Value::Null))
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

fn now(_: &[ExprValue], ctx: &CallContext) -> Result<Value, String> {
    Ok(timestamp_value(ctx.now))
}

fn format_date(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let dt = timestamp_arg(args, 0)?;
    let pattern = string_arg(args, 1)?;
    let mut out = String::new();
    write!(out, "{}", dt.format(pattern)).map_err(|_| format!("invalid date format '{pattern}'"))?;
    Ok(Value::String(out))
}

fn parse_date(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    if args.len() == 1 {
        return timestamp_arg(args, 0).map(timestamp_value);
    }
    let text = string_arg(args, 0)?;
    let pattern = string_arg(args, 1)?;
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, pattern) {
        return Ok(timestamp_value(naive.and_utc()));
    }
    let date = NaiveDate::parse_from_str(text, pattern)
        .map_err(|e| format!("'{text}' does not match '{pattern}': {e}"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| format!("'{text}' has no midnight"))?;
    Ok(timestamp_value(midnight.and_utc()))
}

fn add_seconds(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let dt = timestamp_arg(args, 0)?;
    let secs = number_arg(args, 1)?;
    let delta = TimeDelta::try_milliseconds((secs * 1000.0) as i64)
        .ok_or_else(|| "offset out of range".to_string())?;
    let shifted = dt
        .checked_add_signed(delta)
        .ok_or_else(|| "timestamp out of range".to_string())?;
    Ok(timestamp_value(shifted))
}

fn diff_seconds(args: &[ExprValue], _: &CallContext) -> Result<Value, String> {
    let a = timestamp_arg(args, 0)?;
    let b = timestamp_arg(args, 1)?;
    number_value((a - b).num_milliseconds() as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> CallContext {
        CallContext {
            now: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn call(name: &str, args: Vec<Value>) -> Result<Value, String> {
        let builtin = lookup(name).unwrap();
        let args: Vec<ExprValue> = args.into_iter().map(ExprValue::Json).collect();
        (builtin.call)(&args, &ctx())
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(call("upper", vec![json!("abc")]).unwrap(), json!("ABC"));
        assert_eq!(call("trim", vec![json!("  x ")]).unwrap(), json!("x"));
        assert_eq!(call("length", vec![json!("héllo")]).unwrap(), json!(5));
        assert_eq!(
            call("split", vec![json!("a,b,c"), json!(",")]).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(
            call("join", vec![json!(["a", 1, true]), json!("-")]).unwrap(),
            json!("a-1-true")
        );
        assert_eq!(
            call("substring", vec![json!("workflow"), json!(4)]).unwrap(),
            json!("flow")
        );
        assert_eq!(
            call("replace", vec![json!("a.b.c"), json!("."), json!("/")]).unwrap(),
            json!("a/b/c")
        );
        assert_eq!(
            call("concat", vec![json!("n="), json!(3)]).unwrap(),
            json!("n=3")
        );
    }

    #[test]
    fn test_contains_variants() {
        assert_eq!(call("contains", vec![json!("abc"), json!("b")]).unwrap(), json!(true));
        assert_eq!(call("contains", vec![json!([1, 2]), json!(2.0)]).unwrap(), json!(true));
        assert_eq!(call("contains", vec![json!({"k": 1}), json!("k")]).unwrap(), json!(true));
        assert!(call("contains", vec![json!(5), json!(5)]).is_err());
    }

    #[test]
    fn test_math_helpers() {
        assert_eq!(call("abs", vec![json!(-3)]).unwrap(), json!(3));
        assert_eq!(call("min", vec![json!(3), json!(1.5)]).unwrap(), json!(1.5));
        assert_eq!(call("max", vec![json!([4, 9, 2])]).unwrap(), json!(9));
        assert_eq!(call("round", vec![json!(2.346), json!(2)]).unwrap(), json!(2.35));
        assert_eq!(call("floor", vec![json!(2.7)]).unwrap(), json!(2));
        assert_eq!(call("to_number", vec![json!(" 42 ")]).unwrap(), json!(42));
        assert!(call("to_number", vec![json!("x")]).is_err());
        assert!(call("abs", vec![json!("x")]).unwrap_err().contains("must be a number"));
    }

    #[test]
    fn test_presence_helpers() {
        let builtin = lookup("default").unwrap();
        let out = (builtin.call)(&[ExprValue::Undefined, ExprValue::Json(json!(7))], &ctx()).unwrap();
        assert_eq!(out, json!(7));

        let builtin = lookup("is_defined").unwrap();
        assert_eq!((builtin.call)(&[ExprValue::Undefined], &ctx()).unwrap(), json!(false));
        assert_eq!(
            (builtin.call)(&[ExprValue::Json(Value::Null)], &ctx()).unwrap(),
            json!(true)
        );

        let builtin = lookup("coalesce").unwrap();
        let out = (builtin.call)(
            &[
                ExprValue::Undefined,
                ExprValue::Json(Value::Null),
                ExprValue::Json(json!("x")),
            ],
            &ctx(),
        )
        .unwrap();
        assert_eq!(out, json!("x"));
    }

    #[test]
    fn test_now_is_bound_to_context() {
        assert_eq!(call("now", vec![]).unwrap(), json!("2026-03-01T12:00:00Z"));
        assert_eq!(call("now", vec![]).unwrap(), call("now", vec![]).unwrap());
    }

    #[test]
    fn test_date_helpers() {
        assert_eq!(
            call("format_date", vec![json!("2026-03-01T12:00:00Z"), json!("%Y/%m/%d")]).unwrap(),
            json!("2026/03/01")
        );
        assert_eq!(
            call("parse_date", vec![json!("01.03.2026"), json!("%d.%m.%Y")]).unwrap(),
            json!("2026-03-01T00:00:00Z")
        );
        assert_eq!(
            call("add_seconds", vec![json!("2026-03-01T12:00:00Z"), json!(90)]).unwrap(),
            json!("2026-03-01T12:01:30Z")
        );
        assert_eq!(
            call(
                "diff_seconds",
                vec![json!("2026-03-01T12:01:00Z"), json!("2026-03-01T12:00:00Z")]
            )
            .unwrap(),
            json!(60)
        );
        assert!(call("format_date", vec![json!("2026-03-01T12:00:00Z"), json!("%Q")]).is_err());
        assert!(call("parse_date", vec![json!("yesterday")]).is_err());
    }

    #[test]
    fn test_lookup_is_a_whitelist() {
        assert!(lookup("upper").is_some());
        assert!(lookup("eval").is_none());
        assert!(lookup("read_file").is_none());
    }
}

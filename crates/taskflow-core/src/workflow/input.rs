//! Submit-time validation of execution input against a definition's
//! input schema.

use serde_json::{Map, Value};
use taskflow_types::workflow::InputSchema;
use thiserror::Error;

/// Input rejected at submit. Every violation is reported, not just the first.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid input: {}", .violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

/// Validate `input` and return it with schema defaults applied.
///
/// Input must be a JSON object (or `null`, treated as empty). Fields not in
/// the schema pass through unless the schema denies unknown fields.
pub fn validate_input(schema: &InputSchema, input: &Value) -> Result<Value, ValidationError> {
    let mut fields = match input {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(ValidationError {
                violations: vec![format!(
                    "input must be an object, got {}",
                    json_type_name(other)
                )],
            });
        }
    };

    let mut violations = Vec::new();

    for (name, field) in &schema.fields {
        match fields.get(name) {
            Some(value) if !field.field_type.matches(value) => {
                violations.push(format!(
                    "field '{name}' must be of type {}, got {}",
                    field.field_type,
                    json_type_name(value)
                ));
            }
            Some(_) => {}
            None => match &field.default {
                Some(default) => {
                    fields.insert(name.clone(), default.clone());
                }
                None if field.required => {
                    violations.push(format!("missing required field '{name}'"));
                }
                None => {}
            },
        }
    }

    if schema.deny_unknown {
        for name in fields.keys() {
            if !schema.fields.contains_key(name) {
                violations.push(format!("unknown field '{name}'"));
            }
        }
    }

    if violations.is_empty() {
        Ok(Value::Object(fields))
    } else {
        Err(ValidationError { violations })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

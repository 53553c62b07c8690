use crate::error::{NestqlError, Result};
use crate::schema::FieldSchema;
use crate::search::parse_date;
use serde_json::Value;

/// Validate a non-null value against a scalar field schema: type, enum,
/// numeric bounds and length bounds. Containers are checked by their
/// callers, which recurse into them.
pub fn validate_scalar(path: &str, schema: &FieldSchema, value: &Value) -> Result<()> {
    match schema {
        FieldSchema::Null(_) => {
            if !value.is_null() {
                return Err(mismatch(path, "null", value));
            }
        }
        FieldSchema::Boolean(_) => {
            if !value.is_boolean() {
                return Err(mismatch(path, "boolean", value));
            }
        }
        FieldSchema::Integer(field) => {
            let n = value
                .as_i64()
                .ok_or_else(|| mismatch(path, "integer", value))?;
            if let Some(allowed) = &field.enum_values {
                if !allowed.contains(&n) {
                    return Err(NestqlError::invalid(
                        path,
                        format!("value {n} is not in enum: {allowed:?}"),
                    ));
                }
            }
            check_bounds(path, n as f64, field.minimum.map(|m| m as f64), field.maximum.map(|m| m as f64))?;
        }
        FieldSchema::Float(field) => {
            let n = value
                .as_f64()
                .ok_or_else(|| mismatch(path, "float", value))?;
            if let Some(allowed) = &field.enum_values {
                if !allowed.contains(&n) {
                    return Err(NestqlError::invalid(
                        path,
                        format!("value {n} is not in enum: {allowed:?}"),
                    ));
                }
            }
            check_bounds(path, n, field.minimum, field.maximum)?;
        }
        FieldSchema::String(field) => {
            let s = value
                .as_str()
                .ok_or_else(|| mismatch(path, "string", value))?;
            if let Some(allowed) = &field.enum_values {
                if !allowed.iter().any(|a| a == s) {
                    return Err(NestqlError::invalid(
                        path,
                        format!("value '{s}' is not in enum: {allowed:?}"),
                    ));
                }
            }
            let len = s.chars().count();
            if let Some(min) = field.min_length {
                if len < min {
                    return Err(NestqlError::invalid(
                        path,
                        format!("length {len} is below the minimum of {min}"),
                    ));
                }
            }
            if let Some(max) = field.max_length {
                if len > max {
                    return Err(NestqlError::invalid(
                        path,
                        format!("length {len} is above the maximum of {max}"),
                    ));
                }
            }
        }
        FieldSchema::Date(_) => {
            let parsed = value.as_str().and_then(parse_date);
            if parsed.is_none() {
                return Err(mismatch(path, "RFC 3339 date string", value));
            }
        }
        FieldSchema::Binary(_) => {
            let is_bytes = value.as_array().map_or(false, |items| {
                items
                    .iter()
                    .all(|b| b.as_u64().map_or(false, |b| b <= u8::MAX as u64))
            });
            if !is_bytes {
                return Err(mismatch(path, "byte array", value));
            }
        }
        FieldSchema::Id(_) => {
            if !value.as_str().map_or(false, |s| !s.is_empty()) {
                return Err(mismatch(path, "id string", value));
            }
        }
        FieldSchema::Object(_) | FieldSchema::Array(_) | FieldSchema::DynamicObject(_) => {
            return Err(NestqlError::invalid(
                path,
                format!("{} is not a scalar field", schema.kind_name()),
            ));
        }
    }
    Ok(())
}

fn check_bounds(path: &str, n: f64, minimum: Option<f64>, maximum: Option<f64>) -> Result<()> {
    if let Some(min) = minimum {
        if n < min {
            return Err(NestqlError::invalid(
                path,
                format!("value {n} is below the minimum of {min}"),
            ));
        }
    }
    if let Some(max) = maximum {
        if n > max {
            return Err(NestqlError::invalid(
                path,
                format!("value {n} is above the maximum of {max}"),
            ));
        }
    }
    Ok(())
}

fn mismatch(path: &str, expected: &str, value: &Value) -> NestqlError {
    NestqlError::invalid(path, format!("expected {expected}, got {}", type_name(value)))
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//! Shape checks for output events.
//!
//! Typed [`OutputEvent`](crate::events::OutputEvent)s always pass; the check
//! exists for events assembled as raw JSON by hosts and relays.

use crate::error::SchemaError;
use crate::events::TYPE_VALIDATION_PHASE;
use chrono::DateTime;
use serde_json::Value;

/// Check that `event` is a well-formed output event.
///
/// Rules:
/// - must be an object with a string `type`
/// - `timestamp` must be an RFC 3339 string or a non-negative integer (unix millis)
/// - `validation-phase` events additionally need `phase` (string), `ok` (bool),
///   `deltas` (array) and `coverage` (object)
pub fn validate_event(event: &Value) -> Result<(), SchemaError> {
    let obj = event.as_object().ok_or(SchemaError::NotAnObject)?;

    let event_type = match obj.get("type") {
        Some(Value::String(t)) if !t.is_empty() => t.as_str(),
        Some(_) => {
            return Err(SchemaError::WrongType {
                event_type: "<unknown>".to_string(),
                field: "type".to_string(),
                expected: "non-empty string",
            })
        }
        None => {
            return Err(SchemaError::MissingField {
                event_type: "<unknown>".to_string(),
                field: "type".to_string(),
            })
        }
    };

    match obj.get("timestamp") {
        None => return Err(missing(event_type, "timestamp")),
        Some(ts) => check_timestamp(ts)?,
    }

    if event_type == TYPE_VALIDATION_PHASE {
        require(event_type, obj.get("phase"), "phase", "string", Value::is_string)?;
        require(event_type, obj.get("ok"), "ok", "bool", Value::is_boolean)?;
        require(event_type, obj.get("deltas"), "deltas", "array", Value::is_array)?;
        require(event_type, obj.get("coverage"), "coverage", "object", Value::is_object)?;
    }

    Ok(())
}

fn check_timestamp(ts: &Value) -> Result<(), SchemaError> {
    match ts {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|_| ())
            .map_err(|e| SchemaError::InvalidTimestamp(format!("{s}: {e}"))),
        Value::Number(n) if n.as_u64().is_some() => Ok(()),
        other => Err(SchemaError::InvalidTimestamp(other.to_string())),
    }
}

fn require(
    event_type: &str,
    value: Option<&Value>,
    field: &str,
    expected: &'static str,
    check: fn(&Value) -> bool,
) -> Result<(), SchemaError> {
    match value {
        None => Err(missing(event_type, field)),
        Some(v) if check(v) => Ok(()),
        Some(_) => Err(SchemaError::WrongType {
            event_type: event_type.to_string(),
            field: field.to_string(),
            expected,
        }),
    }
}

fn missing(event_type: &str, field: &str) -> SchemaError {
    SchemaError::MissingField {
        event_type: event_type.to_string(),
        field: field.to_string(),
    }
}

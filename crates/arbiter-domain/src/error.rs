//! Error types for domain operations

use thiserror::Error;

/// Shape violations found while checking an output event before it is
/// accepted for publishing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("event must be a JSON object")]
    NotAnObject,

    #[error("event of type {event_type} missing required field: {field}")]
    MissingField { event_type: String, field: String },

    #[error("event of type {event_type} has field {field} of wrong type, expected {expected}")]
    WrongType {
        event_type: String,
        field: String,
        expected: &'static str,
    },

    #[error("event timestamp is not parseable: {0}")]
    InvalidTimestamp(String),
}

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Unknown change kind: {0}")]
    UnknownChangeKind(String),
}

/// Result type for domain operations
pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_display() {
        let err = SchemaError::MissingField {
            event_type: "validation-phase".to_string(),
            field: "coverage".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("validation-phase"));
        assert!(msg.contains("coverage"));
    }

    #[test]
    fn test_domain_error_wraps_schema_error() {
        let err: DomainError = SchemaError::NotAnObject.into();
        assert!(err.to_string().contains("JSON object"));
    }
}

//! Structured progress events written to the output sink.
//!
//! Every event carries a `type` tag and a `timestamp`. Once flushed to the
//! sink an event is history; nothing here is retained after serialization.

use crate::result::{BatchResult, Coverage, Delta, PhaseError, ValidationPhaseResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TYPE_VALIDATION_PHASE: &str = "validation-phase";
pub const TYPE_BATCH_COMPLETE: &str = "batch-complete";
pub const TYPE_ERROR: &str = "error";
pub const TYPE_HEARTBEAT: &str = "heartbeat";

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Output event, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutputEvent {
    /// One phase of a batch finished
    ValidationPhase(PhaseEvent),

    /// A batch finished (all phases run, or stopped early)
    BatchComplete(BatchCompleteEvent),

    /// A failure surfaced for observability
    Error(ErrorEvent),

    /// Liveness marker emitted on a fixed period
    Heartbeat(HeartbeatEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub timestamp: DateTime<Utc>,
    pub batch_id: String,
    pub phase: String,
    pub ok: bool,
    pub deltas: Vec<Delta>,
    pub coverage: Coverage,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<PhaseError>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCompleteEvent {
    pub timestamp: DateTime<Utc>,
    pub batch_id: String,
    pub phases: Vec<ValidationPhaseResult>,
    pub total_processing_time_ms: u64,
    pub overall_coverage: Coverage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Component that raised the error (`scheduler`, `publisher`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub timestamp: DateTime<Utc>,
    pub uptime_ms: u64,
    pub events_written: u64,
}

// ============================================================================
// CONSTRUCTORS
// ============================================================================

impl OutputEvent {
    pub fn phase(batch_id: &str, result: &ValidationPhaseResult) -> Self {
        OutputEvent::ValidationPhase(PhaseEvent {
            timestamp: Utc::now(),
            batch_id: batch_id.to_string(),
            phase: result.name.clone(),
            ok: result.ok,
            deltas: result.deltas.clone(),
            coverage: result.coverage,
            processing_time_ms: result.processing_time_ms,
            errors: result.errors.clone(),
        })
    }

    pub fn batch_complete(batch: &BatchResult) -> Self {
        OutputEvent::BatchComplete(BatchCompleteEvent {
            timestamp: Utc::now(),
            batch_id: batch.batch_id.clone(),
            phases: batch.phases.clone(),
            total_processing_time_ms: batch.total_processing_time_ms,
            overall_coverage: batch.overall_coverage,
        })
    }

    pub fn error(source: Option<&str>, batch_id: Option<&str>, message: impl Into<String>) -> Self {
        OutputEvent::Error(ErrorEvent {
            timestamp: Utc::now(),
            message: message.into(),
            source: source.map(str::to_string),
            batch_id: batch_id.map(str::to_string),
        })
    }

    pub fn heartbeat(uptime_ms: u64, events_written: u64) -> Self {
        OutputEvent::Heartbeat(HeartbeatEvent {
            timestamp: Utc::now(),
            uptime_ms,
            events_written,
        })
    }

    /// Wire name of the `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            OutputEvent::ValidationPhase(_) => TYPE_VALIDATION_PHASE,
            OutputEvent::BatchComplete(_) => TYPE_BATCH_COMPLETE,
            OutputEvent::Error(_) => TYPE_ERROR,
            OutputEvent::Heartbeat(_) => TYPE_HEARTBEAT,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OutputEvent::ValidationPhase(e) => e.timestamp,
            OutputEvent::BatchComplete(e) => e.timestamp,
            OutputEvent::Error(e) => e.timestamp,
            OutputEvent::Heartbeat(e) => e.timestamp,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

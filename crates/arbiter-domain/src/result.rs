//! Phase and batch results.

use crate::change::{ChangeEvent, ChangeKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// COVERAGE
// ============================================================================

/// Per-dimension coverage reported by a phase, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    #[serde(default)]
    pub contracts: f64,
    #[serde(default)]
    pub scenarios: f64,
    #[serde(default)]
    pub ui: f64,
    #[serde(default)]
    pub budgets: f64,
}

impl Coverage {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Full coverage in every dimension.
    pub fn full() -> Self {
        Self::uniform(1.0)
    }

    pub fn uniform(value: f64) -> Self {
        Self {
            contracts: value,
            scenarios: value,
            ui: value,
            budgets: value,
        }
        .clamped()
    }

    /// Clamp every dimension into `[0, 1]`; NaN becomes 0.
    pub fn clamped(self) -> Self {
        fn clamp(v: f64) -> f64 {
            if v.is_nan() {
                0.0
            } else {
                v.clamp(0.0, 1.0)
            }
        }
        Self {
            contracts: clamp(self.contracts),
            scenarios: clamp(self.scenarios),
            ui: clamp(self.ui),
            budgets: clamp(self.budgets),
        }
    }

    /// Elementwise arithmetic mean, or all-zero for an empty input.
    pub fn mean<'a>(items: impl IntoIterator<Item = &'a Coverage>) -> Coverage {
        let mut sum = Coverage::zero();
        let mut count = 0usize;
        for c in items {
            sum.contracts += c.contracts;
            sum.scenarios += c.scenarios;
            sum.ui += c.ui;
            sum.budgets += c.budgets;
            count += 1;
        }
        if count == 0 {
            return Coverage::zero();
        }
        let n = count as f64;
        Coverage {
            contracts: sum.contracts / n,
            scenarios: sum.scenarios / n,
            ui: sum.ui / n,
            budgets: sum.budgets / n,
        }
    }
}

// ============================================================================
// PHASE RESULT
// ============================================================================

/// A file touched by the batch, as seen by one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub file: String,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

impl From<&ChangeEvent> for Delta {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            file: event.path.clone(),
            kind: event.kind,
            timestamp: event.observed_at,
        }
    }
}

/// A single problem reported by a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub file: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl PhaseError {
    /// Pseudo-file used for failures that are not attributable to a source file.
    pub const SYSTEM_FILE: &'static str = "system";

    pub fn new(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Error attributed to the `system` pseudo-file.
    pub fn system(message: impl Into<String>) -> Self {
        Self::new(Self::SYSTEM_FILE, message)
    }
}

/// Outcome of running one phase against a batch's file set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPhaseResult {
    /// Phase name as configured in the pipeline.
    pub name: String,

    pub ok: bool,

    /// Changed files covered by this phase, in path order.
    pub deltas: Vec<Delta>,

    pub coverage: Coverage,

    pub processing_time_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<PhaseError>>,
}

impl ValidationPhaseResult {
    /// Number of reported errors (zero when `errors` is absent).
    pub fn error_count(&self) -> usize {
        self.errors.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// A failed result carrying a single `system` error.
    pub fn system_failure(
        name: impl Into<String>,
        deltas: Vec<Delta>,
        processing_time_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            ok: false,
            deltas,
            coverage: Coverage::zero(),
            processing_time_ms,
            errors: Some(vec![PhaseError::system(message)]),
        }
    }
}

// ============================================================================
// BATCH RESULT
// ============================================================================

/// Generate a batch id of the form `batch-<unix millis>-<8 hex chars>`.
pub fn generate_batch_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("batch-{}-{}", Utc::now().timestamp_millis(), &random[..8])
}

/// Summary of one debounced batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,

    /// Phases in execution order. Shorter than the configured list when a
    /// critical phase failed or the batch was cancelled.
    pub phases: Vec<ValidationPhaseResult>,

    pub total_processing_time_ms: u64,

    /// Elementwise mean of `phases[*].coverage`, zero when no phase ran.
    pub overall_coverage: Coverage,
}

impl BatchResult {
    /// Finalize a batch, deriving `overall_coverage` from the phases.
    pub fn new(
        batch_id: impl Into<String>,
        phases: Vec<ValidationPhaseResult>,
        total_processing_time_ms: u64,
    ) -> Self {
        let overall_coverage = Coverage::mean(phases.iter().map(|p| &p.coverage));
        Self {
            batch_id: batch_id.into(),
            phases,
            total_processing_time_ms,
            overall_coverage,
        }
    }

    /// Whether every executed phase passed.
    pub fn ok(&self) -> bool {
        self.phases.iter().all(|p| p.ok)
    }

    /// Total errors across all phases.
    pub fn error_count(&self) -> usize {
        self.phases.iter().map(ValidationPhaseResult::error_count).sum()
    }
}

// ============================================================================
// RESOURCE USAGE
// ============================================================================

/// Point-in-time view of the resource governor's accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsageSnapshot {
    pub current_payload_bytes: u64,
    pub current_processing_time_ms: u64,
    pub current_rate_per_second: u32,
    pub total_validations: u64,
    pub total_errors: u64,
    pub average_processing_time_ms: f64,
}

//! Structured observability hooks for the batch lifecycle.
//!
//! This module provides:
//! - A batch-scoped tracing span for instrumenting batch execution
//! - Emission functions for key lifecycle events: batch start, deferral,
//!   skip, phase completion, timeout, batch finish, backoff and flush failure
//!
//! Events are emitted at `info!` level unless noted; filter them with `RUST_LOG`.

use tracing::{info, warn};

/// Span tagged with the batch_id, for instrumenting async batch execution.
pub fn batch_span(batch_id: &str) -> tracing::Span {
    tracing::info_span!("arbiter.batch", batch_id = %batch_id)
}

/// Emit event: batch admitted with its change count and estimated payload.
pub fn emit_batch_started(batch_id: &str, changes: usize, payload_bytes: u64) {
    info!(
        event = "batch.started",
        batch_id = %batch_id,
        changes = changes,
        payload_bytes = payload_bytes,
    );
}

/// Emit event: batch refused by the resource governor.
pub fn emit_batch_deferred(changes: usize, payload_bytes: u64) {
    info!(event = "batch.deferred", changes = changes, payload_bytes = payload_bytes);
}

/// Emit event: nothing left to validate after file selection.
pub fn emit_batch_skipped(batch_id: &str, changes: usize) {
    info!(event = "batch.skipped", batch_id = %batch_id, changes = changes);
}

/// Emit event: one phase finished.
pub fn emit_phase_finished(batch_id: &str, phase: &str, ok: bool, duration_ms: u64, errors: usize) {
    info!(
        event = "phase.finished",
        batch_id = %batch_id,
        phase = %phase,
        ok = ok,
        duration_ms = duration_ms,
        errors = errors,
    );
}

/// Emit event: a phase hit its hard timeout (warning level).
pub fn emit_phase_timed_out(batch_id: &str, phase: &str, timeout_ms: u64) {
    warn!(event = "phase.timed_out", batch_id = %batch_id, phase = %phase, timeout_ms = timeout_ms);
}

/// Emit event: batch finished with its phase count and averaged coverage.
pub fn emit_batch_finished(batch_id: &str, phases: usize, duration_ms: u64, ok: bool) {
    info!(
        event = "batch.finished",
        batch_id = %batch_id,
        phases = phases,
        duration_ms = duration_ms,
        ok = ok,
    );
}

/// Emit event: governor entered backoff (warning level).
pub fn emit_backoff(duration_ms: u64, reason: &str) {
    warn!(event = "governor.backoff", duration_ms = duration_ms, reason = %reason);
}

/// Emit event: a flush failed and its events were re-buffered (warning level).
///
/// `buffered` is the buffer depth after re-buffering; it keeps growing for
/// as long as the sink stays down.
pub fn emit_flush_failed(events: usize, buffered: usize, error: &dyn std::fmt::Display) {
    warn!(
        event = "publisher.flush_failed",
        events = events,
        buffered = buffered,
        error = %error,
    );
}

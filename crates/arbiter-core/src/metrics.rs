//! Global atomic counters for scheduler observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters with no allocation or locking.
pub struct Metrics {
    batches_executed: AtomicU64,
    batches_deferred: AtomicU64,
    batches_skipped: AtomicU64,
    phases_timed_out: AtomicU64,
    events_flushed: AtomicU64,
    flush_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            batches_executed: AtomicU64::new(0),
            batches_deferred: AtomicU64::new(0),
            batches_skipped: AtomicU64::new(0),
            phases_timed_out: AtomicU64::new(0),
            events_flushed: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_batches_executed(&self) {
        self.batches_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "batches_executed", "counter incremented");
    }

    /// A batch refused by the resource governor.
    pub fn inc_batches_deferred(&self) {
        self.batches_deferred.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "batches_deferred", "counter incremented");
    }

    /// A batch whose file set was empty after incremental selection.
    pub fn inc_batches_skipped(&self) {
        self.batches_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "batches_skipped", "counter incremented");
    }

    pub fn inc_phases_timed_out(&self) {
        self.phases_timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "phases_timed_out", "counter incremented");
    }

    pub fn add_events_flushed(&self, count: u64) {
        self.events_flushed.fetch_add(count, Ordering::Relaxed);
        tracing::trace!(metric = "events_flushed", count, "counter incremented");
    }

    pub fn inc_flush_failures(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "flush_failures", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            batches_executed = self.batches_executed(),
            batches_deferred = self.batches_deferred(),
            batches_skipped = self.batches_skipped(),
            phases_timed_out = self.phases_timed_out(),
            events_flushed = self.events_flushed(),
            flush_failures = self.flush_failures(),
        );
    }

    pub fn batches_executed(&self) -> u64 {
        self.batches_executed.load(Ordering::Relaxed)
    }

    pub fn batches_deferred(&self) -> u64 {
        self.batches_deferred.load(Ordering::Relaxed)
    }

    pub fn batches_skipped(&self) -> u64 {
        self.batches_skipped.load(Ordering::Relaxed)
    }

    pub fn phases_timed_out(&self) -> u64 {
        self.phases_timed_out.load(Ordering::Relaxed)
    }

    pub fn events_flushed(&self) -> u64 {
        self.events_flushed.load(Ordering::Relaxed)
    }

    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.batches_executed.store(0, Ordering::Relaxed);
        self.batches_deferred.store(0, Ordering::Relaxed);
        self.batches_skipped.store(0, Ordering::Relaxed);
        self.phases_timed_out.store(0, Ordering::Relaxed);
        self.events_flushed.store(0, Ordering::Relaxed);
        self.flush_failures.store(0, Ordering::Relaxed);
    }
}

//! Validation scheduler: debounced batching and phase orchestration.
//!
//! Change events are coalesced per path over a quiet period; the resulting
//! batch is admitted by the [`ResourceGovernor`], reduced to the files that
//! need re-checking, and run through the configured phases one at a time.
//! Each phase result and the batch summary go out through the
//! [`EventPublisher`]. Batches never overlap.

use crate::config::{PipelineConfig, DEBOUNCE_WINDOW, STOP_GRACE};
use crate::error::{Result, SchedulerError};
use crate::fingerprint::{
    transitive_dependents, DependencyResolver, Fingerprinter, NoopResolver, Sha256Fingerprinter,
};
use crate::governor::{BatchMetrics, ResourceGovernor};
use crate::lock_or_recover;
use crate::metrics::METRICS;
use crate::obs;
use crate::phase::PhaseRegistry;
use crate::publisher::EventPublisher;
use crate::signals::{Signal, SignalBus};
use crate::state::ValidationStateCache;
use arbiter_domain::{
    generate_batch_id, BatchResult, ChangeEvent, Delta, OutputEvent, ValidationPhaseResult,
};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Lifecycle of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    /// Started, no batch in flight
    Ready,
    /// A batch is executing
    Running,
}

#[derive(Default)]
struct Debounce {
    pending: BTreeMap<String, ChangeEvent>,
    /// Bumped whenever the timer is re-armed and on stop; a timer only fires
    /// its batch if nothing arrived after it was armed.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Debounce {
    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Restart the quiet period. The batch forms when it elapses with no
    /// further re-arm.
    fn arm(&mut self, inner: &Arc<SchedulerInner>, runtime: &Handle) {
        self.cancel_timer();
        let generation = self.generation;
        let weak = Arc::downgrade(inner);
        self.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let events: Vec<ChangeEvent> = {
                let mut debounce = lock_or_recover(&inner.debounce);
                if debounce.generation != generation {
                    return;
                }
                // Detach so a new event cannot abort the batch below.
                debounce.timer = None;
                std::mem::take(&mut debounce.pending).into_values().collect()
            };
            if !events.is_empty() {
                ValidationScheduler { inner }.run_guarded(events).await;
            }
        }));
    }
}

/// How a batch ended, before it is reduced to the public result.
enum BatchOutcome {
    Completed(BatchResult),
    /// Empty, oversized, or nothing left to validate.
    Skipped,
    /// Refused by the governor; the events are handed back for a retry.
    Deferred(Vec<ChangeEvent>),
}

struct SchedulerInner {
    config: PipelineConfig,
    registry: PhaseRegistry,
    governor: ResourceGovernor,
    publisher: EventPublisher,
    fingerprinter: Arc<dyn Fingerprinter>,
    resolver: Arc<dyn DependencyResolver>,
    bus: SignalBus,
    running: AtomicBool,
    debounce: Mutex<Debounce>,
    cache: Mutex<ValidationStateCache>,
    /// Held for the whole of a batch.
    batch_lock: tokio::sync::Mutex<()>,
    cancel: watch::Sender<bool>,
}

/// Builder for [`ValidationScheduler`].
pub struct SchedulerBuilder {
    config: PipelineConfig,
    registry: PhaseRegistry,
    governor: ResourceGovernor,
    publisher: EventPublisher,
    bus: SignalBus,
    fingerprinter: Option<Arc<dyn Fingerprinter>>,
    resolver: Option<Arc<dyn DependencyResolver>>,
}

impl SchedulerBuilder {
    /// Defaults to SHA-256 over file contents.
    pub fn fingerprinter(mut self, fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        self.fingerprinter = Some(fingerprinter);
        self
    }

    /// Defaults to [`NoopResolver`].
    pub fn resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> ValidationScheduler {
        let (cancel, _) = watch::channel(false);
        ValidationScheduler {
            inner: Arc::new(SchedulerInner {
                config: self.config,
                registry: self.registry,
                governor: self.governor,
                publisher: self.publisher,
                fingerprinter: self
                    .fingerprinter
                    .unwrap_or_else(|| Arc::new(Sha256Fingerprinter::new())),
                resolver: self.resolver.unwrap_or_else(|| Arc::new(NoopResolver)),
                bus: self.bus,
                running: AtomicBool::new(false),
                debounce: Mutex::new(Debounce::default()),
                cache: Mutex::new(ValidationStateCache::new()),
                batch_lock: tokio::sync::Mutex::new(()),
                cancel,
            }),
        }
    }
}

/// Shared handle to a scheduler. Clones refer to the same state.
#[derive(Clone)]
pub struct ValidationScheduler {
    inner: Arc<SchedulerInner>,
}

impl ValidationScheduler {
    pub fn builder(
        config: PipelineConfig,
        registry: PhaseRegistry,
        governor: ResourceGovernor,
        publisher: EventPublisher,
        bus: SignalBus,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            registry,
            governor,
            publisher,
            bus,
            fingerprinter: None,
            resolver: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SchedulerState {
        if !self.inner.running.load(Ordering::SeqCst) {
            SchedulerState::Stopped
        } else if self.inner.batch_lock.try_lock().is_err() {
            SchedulerState::Running
        } else {
            SchedulerState::Ready
        }
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.send_replace(false);
        for name in self.inner.config.phase_names() {
            if !self.inner.registry.contains(name) {
                warn!(phase = name, "no executor registered; phase will fail");
            }
        }
        info!(
            phases = ?self.inner.config.phase_names(),
            fast_mode = self.inner.config.fast_mode,
            "validation scheduler started"
        );
    }

    /// Stop accepting events and wait for the in-flight batch.
    ///
    /// The pending debounce buffer is discarded. A batch still running after
    /// [`STOP_GRACE`] is abandoned; it stops at the next phase boundary.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let dropped = {
            let mut debounce = lock_or_recover(&self.inner.debounce);
            debounce.cancel_timer();
            let dropped = debounce.pending.len();
            debounce.pending.clear();
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "pending change events discarded");
        }
        self.inner.cancel.send_replace(true);

        match tokio::time::timeout(STOP_GRACE, self.inner.batch_lock.lock()).await {
            Ok(_idle) => info!("validation scheduler stopped"),
            Err(_) => warn!(
                grace_ms = STOP_GRACE.as_millis() as u64,
                "in-flight batch abandoned at shutdown"
            ),
        }
    }

    /// Feed one change event into the debounce buffer.
    ///
    /// The latest event per path wins. The batch is formed once no event has
    /// arrived for [`DEBOUNCE_WINDOW`].
    pub fn on_change_event(&self, event: ChangeEvent) {
        if !self.inner.running.load(Ordering::SeqCst) {
            warn!(path = %event.path, "scheduler not running; change event dropped");
            return;
        }
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(path = %event.path, "no tokio runtime; change event dropped");
                return;
            }
        };

        let mut debounce = lock_or_recover(&self.inner.debounce);
        debounce.pending.insert(event.path.clone(), event);
        debounce.arm(&self.inner, &runtime);
    }

    /// Put a deferred batch back into the debounce buffer and re-arm the
    /// timer. Events that arrived meanwhile win over the deferred ones.
    fn requeue(&self, events: Vec<ChangeEvent>) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let mut debounce = lock_or_recover(&self.inner.debounce);
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        let count = events.len();
        for event in events {
            debounce.pending.entry(event.path.clone()).or_insert(event);
        }
        debounce.arm(&self.inner, &runtime);
        debug!(count, pending = debounce.pending.len(), "deferred change events requeued");
    }

    /// Number of change events waiting for the debounce timer.
    pub fn pending_events(&self) -> usize {
        lock_or_recover(&self.inner.debounce).pending.len()
    }

    /// Number of files with a trusted incremental-validation entry.
    pub fn cached_files(&self) -> usize {
        lock_or_recover(&self.inner.cache).len()
    }

    /// Run a batch, containing every failure (including panics) at the
    /// batch boundary so the next batch proceeds independently.
    async fn run_guarded(&self, events: Vec<ChangeEvent>) {
        let outcome = AssertUnwindSafe(self.run_batch(events))
            .catch_unwind()
            .await;
        let message = match outcome {
            Ok(Ok(BatchOutcome::Deferred(events))) => {
                self.requeue(events);
                return;
            }
            Ok(Ok(_)) | Ok(Err(SchedulerError::NotRunning)) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                format!("batch panicked: {}", reason)
            }
        };
        error!(error = %message, "batch failed");
        self.inner.bus.error("scheduler", message.clone());
        if let Err(e) = self
            .inner
            .publisher
            .write_event(&OutputEvent::error(Some("scheduler"), None, message))
            .await
        {
            debug!(error = %e, "error event not published");
        }
    }

    /// Run one batch now, bypassing the debounce buffer.
    ///
    /// Returns `None` when the batch was deferred by the governor or had no
    /// files left to validate; deferred events are not retried here. Waits
    /// for any batch already in flight.
    pub async fn process_batch(&self, events: Vec<ChangeEvent>) -> Result<Option<BatchResult>> {
        match self.run_batch(events).await? {
            BatchOutcome::Completed(batch) => Ok(Some(batch)),
            BatchOutcome::Skipped | BatchOutcome::Deferred(_) => Ok(None),
        }
    }

    async fn run_batch(&self, events: Vec<ChangeEvent>) -> Result<BatchOutcome> {
        let _batch = self.inner.batch_lock.lock().await;
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        if events.is_empty() {
            return Ok(BatchOutcome::Skipped);
        }

        let payload_bytes = serde_json::to_vec(&events)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);
        if !self.inner.governor.check_admission(payload_bytes) {
            METRICS.inc_batches_deferred();
            obs::emit_batch_deferred(events.len(), payload_bytes);
            if payload_bytes > self.inner.governor.limits().max_payload_bytes {
                // Retrying cannot help; the ceiling is fixed.
                warn!(
                    payload_bytes,
                    changes = events.len(),
                    "batch exceeds the payload ceiling; dropped"
                );
                return Ok(BatchOutcome::Skipped);
            }
            return Ok(BatchOutcome::Deferred(events));
        }

        let batch_id = generate_batch_id();
        let span = obs::batch_span(&batch_id);
        self.execute_batch(batch_id, events, payload_bytes)
            .instrument(span)
            .await
    }

    async fn execute_batch(
        &self,
        batch_id: String,
        events: Vec<ChangeEvent>,
        payload_bytes: u64,
    ) -> Result<BatchOutcome> {
        let inner = &self.inner;
        let started = Instant::now();

        let mut fingerprints: HashMap<String, Option<String>> = HashMap::new();
        let files = self.select_files(&events, &mut fingerprints).await;
        if files.is_empty() {
            METRICS.inc_batches_skipped();
            obs::emit_batch_skipped(&batch_id, events.len());
            return Ok(BatchOutcome::Skipped);
        }
        obs::emit_batch_started(&batch_id, events.len(), payload_bytes);

        let mut deltas: Vec<Delta> = events
            .iter()
            .filter(|e| files.contains(&e.path))
            .map(Delta::from)
            .collect();
        deltas.sort_by(|a, b| a.file.cmp(&b.file));
        let files: Vec<String> = files.into_iter().collect();

        let cancel = inner.cancel.subscribe();
        let mut results: Vec<ValidationPhaseResult> = Vec::new();
        // Files stay trusted only while every phase so far has passed.
        let mut trusted = inner.config.fast_mode;

        for (index, phase) in inner.config.phases.iter().enumerate() {
            let cancelled = *cancel.borrow();
            if cancelled {
                info!(phase = %phase.name, "shutdown requested; remaining phases skipped");
                break;
            }

            let result = self
                .run_phase(&batch_id, &phase.name, &files, &events, &deltas)
                .await;

            inner
                .publisher
                .write_event(&OutputEvent::phase(&batch_id, &result))
                .await?;
            inner.bus.emit(Signal::PhaseComplete {
                batch_id: batch_id.clone(),
                result: result.clone(),
            });

            if trusted {
                if result.ok {
                    self.remember(&files, &mut fingerprints, &result).await;
                } else {
                    trusted = false;
                    self.forget(&files);
                }
            }

            let stop_early =
                !result.ok && !inner.config.fast_mode && inner.config.is_critical(index);
            results.push(result);
            if stop_early {
                info!(phase = %phase.name, "critical phase failed; remaining phases skipped");
                break;
            }
        }

        if trusted && results.len() < inner.config.phases.len() {
            // Cancelled before every phase ran.
            self.forget(&files);
        }

        let total_ms = started.elapsed().as_millis() as u64;
        let batch = BatchResult::new(batch_id.clone(), results, total_ms);

        inner
            .publisher
            .write_event(&OutputEvent::batch_complete(&batch))
            .await?;
        inner.bus.emit(Signal::BatchComplete(batch.clone()));
        inner.governor.record_batch(BatchMetrics {
            processing_time_ms: total_ms,
            payload_size: payload_bytes,
            phase_count: batch.phases.len(),
            error_count: batch.error_count(),
        });

        METRICS.inc_batches_executed();
        obs::emit_batch_finished(&batch_id, batch.phases.len(), total_ms, batch.ok());
        Ok(BatchOutcome::Completed(batch))
    }

    /// Files to validate for this batch, with dependents expanded.
    ///
    /// In fast mode a changed file is only selected when its content
    /// fingerprint differs from the cached one. Fingerprints computed here
    /// are kept in `fingerprints` for the cache update.
    async fn select_files(
        &self,
        events: &[ChangeEvent],
        fingerprints: &mut HashMap<String, Option<String>>,
    ) -> BTreeSet<String> {
        let inner = &self.inner;
        let mut selected = BTreeSet::new();
        for event in events {
            if inner.config.fast_mode {
                let current = inner.fingerprinter.fingerprint(&event.path).await;
                let needed =
                    lock_or_recover(&inner.cache).needs_validation(&event.path, current.as_deref());
                fingerprints.insert(event.path.clone(), current);
                if !needed {
                    debug!(path = %event.path, "content unchanged; skipped");
                    continue;
                }
            }
            selected.insert(event.path.clone());
            selected.extend(transitive_dependents(inner.resolver.as_ref(), &event.path));
        }
        selected
    }

    /// Record a successful phase against every validated file.
    async fn remember(
        &self,
        files: &[String],
        fingerprints: &mut HashMap<String, Option<String>>,
        result: &ValidationPhaseResult,
    ) {
        for file in files {
            if !fingerprints.contains_key(file) {
                let current = self.inner.fingerprinter.fingerprint(file).await;
                fingerprints.insert(file.clone(), current);
            }
            let current = fingerprints.get(file).cloned().flatten();
            let mut cache = lock_or_recover(&self.inner.cache);
            match current {
                Some(fingerprint) => cache.record(file, fingerprint, result),
                None => {
                    cache.invalidate(file);
                }
            }
        }
    }

    /// Drop every cache entry for `files` so they are validated next time.
    fn forget(&self, files: &[String]) {
        let mut cache = lock_or_recover(&self.inner.cache);
        for file in files {
            cache.invalidate(file);
        }
    }

    /// Run one phase raced against the phase timeout.
    async fn run_phase(
        &self,
        batch_id: &str,
        phase: &str,
        files: &[String],
        events: &[ChangeEvent],
        deltas: &[Delta],
    ) -> ValidationPhaseResult {
        let timeout = self.inner.config.phase_timeout();
        let timeout_ms = timeout.as_millis() as u64;
        let started = Instant::now();

        let outcome = match self.inner.registry.get(phase) {
            None => Err(format!("no executor registered for phase '{}'", phase)),
            Some(executor) => {
                match tokio::time::timeout(timeout, executor.execute(phase, files, events)).await {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(e)) => Err(format!("Phase '{}' failed: {:#}", phase, e)),
                    Err(_) => {
                        METRICS.inc_phases_timed_out();
                        obs::emit_phase_timed_out(batch_id, phase, timeout_ms);
                        Err(format!("Phase '{}' timed out after {}ms", phase, timeout_ms))
                    }
                }
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(outcome) => ValidationPhaseResult {
                name: phase.to_string(),
                ok: outcome.ok,
                deltas: deltas.to_vec(),
                coverage: outcome.coverage.clamped(),
                processing_time_ms: elapsed_ms,
                errors: if outcome.errors.is_empty() {
                    None
                } else {
                    Some(outcome.errors)
                },
            },
            Err(message) => {
                ValidationPhaseResult::system_failure(phase, deltas.to_vec(), elapsed_ms, message)
            }
        };

        obs::emit_phase_finished(batch_id, phase, result.ok, elapsed_ms, result.error_count());
        result
    }
}

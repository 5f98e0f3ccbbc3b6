//! Admission control for validation work.
//!
//! The governor gates work against three independent budgets (request rate,
//! payload size, processing time) and smooths bursts with randomized
//! exponential backoff. Refused requests can wait in a priority queue that
//! drains as capacity frees up: after every recorded batch, when a backoff
//! expires, and on a periodic maintenance tick.
//!
//! All time is measured with `tokio::time::Instant`, so tests can drive the
//! governor with a paused clock.

use crate::config::ResourceLimits;
use crate::lock_or_recover;
use crate::obs;
use crate::signals::{Signal, SignalBus};
use arbiter_domain::ResourceUsageSnapshot;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Length of the rolling rate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Backoff delay before the multiplier is applied.
pub const BASE_BACKOFF: Duration = Duration::from_millis(1_000);

/// Period of the maintenance tick.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

const HISTORY_LIMIT: usize = 1_000;
const HISTORY_TRIM_TO: usize = 500;
const AVERAGE_WINDOW: usize = 50;
const ERROR_RATE_WINDOW: usize = 10;
const ERROR_RATE_THRESHOLD: f64 = 0.3;
/// Fraction of the processing ceiling at which the trailing average degrades admission.
const DEGRADE_RATIO: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GovernorError {
    #[error("estimated payload of {estimated} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { estimated: u64, limit: u64 },

    #[error("resources exhausted and queueing is disabled (request {id})")]
    ResourceExhausted { id: String },

    #[error("resource governor shut down")]
    Shutdown,
}

/// Metrics reported for one finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchMetrics {
    pub processing_time_ms: u64,
    pub payload_size: u64,
    pub phase_count: usize,
    pub error_count: usize,
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    RateLimited,
    BackingOff,
    PayloadTooLarge,
    /// Trailing processing time is close to the ceiling.
    Degraded,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

// ============================================================================
// QUEUE
// ============================================================================

struct QueuedRequest {
    id: String,
    payload_bytes: u64,
    priority: i32,
    /// Arrival order; breaks priority ties so equal priorities stay FIFO.
    seq: u64,
    done: oneshot::Sender<Result<(), GovernorError>>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // Max-heap: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ============================================================================
// STATE
// ============================================================================

struct Backoff {
    started: Instant,
    duration: Duration,
}

#[derive(Default)]
struct GovernorState {
    rate_window: VecDeque<Instant>,
    history: Vec<BatchMetrics>,
    total_validations: u64,
    total_errors: u64,
    current_payload_bytes: u64,
    current_processing_time_ms: u64,
    average_processing_time_ms: f64,
    backoff: Option<Backoff>,
    /// Set once a backoff has been triggered for the current evidence;
    /// cleared when a new batch is recorded. Keeps a stale trailing average
    /// from re-triggering backoff forever.
    overload_acknowledged: bool,
    queue: BinaryHeap<QueuedRequest>,
    next_seq: u64,
    destroyed: bool,
}

impl GovernorState {
    fn evict_expired(&mut self, now: Instant) {
        while let Some(front) = self.rate_window.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                self.rate_window.pop_front();
            } else {
                break;
            }
        }
    }

    fn backoff_active(&self, now: Instant) -> bool {
        match &self.backoff {
            Some(b) => now.duration_since(b.started) < b.duration,
            None => false,
        }
    }

    fn trim_history(&mut self) {
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_TRIM_TO;
            self.history.drain(..excess);
        }
    }

    fn trailing_average(&self) -> f64 {
        let start = self.history.len().saturating_sub(AVERAGE_WINDOW);
        let recent = &self.history[start..];
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().map(|m| m.processing_time_ms as f64).sum::<f64>() / recent.len() as f64
    }

    /// Fraction of the last batches that reported at least one error.
    fn recent_error_rate(&self) -> f64 {
        let start = self.history.len().saturating_sub(ERROR_RATE_WINDOW);
        let recent = &self.history[start..];
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().filter(|m| m.error_count > 0).count() as f64 / recent.len() as f64
    }
}

#[derive(Default)]
struct GovernorTasks {
    maintenance: Option<JoinHandle<()>>,
    backoff_timer: Option<JoinHandle<()>>,
}

struct GovernorInner {
    limits: ResourceLimits,
    bus: SignalBus,
    state: Mutex<GovernorState>,
    tasks: Mutex<GovernorTasks>,
}

impl GovernorInner {
    fn admit(self: &Arc<Self>, state: &mut GovernorState, payload_bytes: u64) -> Admission {
        let now = Instant::now();
        state.evict_expired(now);

        let max_rate = self.limits.max_rate_per_second.max(1);
        if state.rate_window.len() >= max_rate as usize {
            self.bus.emit(Signal::RateLimited {
                wait_ms: 1_000 / u64::from(max_rate),
            });
            return Admission::RateLimited;
        }

        if state.backoff_active(now) {
            return Admission::BackingOff;
        }

        if payload_bytes > self.limits.max_payload_bytes {
            let message = format!(
                "estimated payload {} bytes exceeds limit {} bytes",
                payload_bytes, self.limits.max_payload_bytes
            );
            warn!(payload_bytes, limit = self.limits.max_payload_bytes, "payload too large");
            self.bus.emit(Signal::ResourceWarning { message });
            return Admission::PayloadTooLarge;
        }

        let threshold = self.limits.max_processing_time_ms as f64 * DEGRADE_RATIO;
        if !state.overload_acknowledged && state.average_processing_time_ms > threshold {
            let message = format!(
                "average processing time {:.0}ms above {:.0}% of {}ms ceiling",
                state.average_processing_time_ms,
                DEGRADE_RATIO * 100.0,
                self.limits.max_processing_time_ms
            );
            warn!(
                average_ms = state.average_processing_time_ms,
                ceiling_ms = self.limits.max_processing_time_ms,
                "degrading admission"
            );
            self.bus.emit(Signal::ResourceWarning {
                message: message.clone(),
            });
            self.start_backoff(state, &message);
            return Admission::Degraded;
        }

        state.rate_window.push_back(now);
        Admission::Admitted
    }

    fn start_backoff(self: &Arc<Self>, state: &mut GovernorState, reason: &str) {
        state.overload_acknowledged = true;
        if !self.limits.backoff_enabled {
            return;
        }
        let now = Instant::now();
        if state.backoff_active(now) {
            return;
        }

        let k: i32 = rand::rng().random_range(0..=2);
        let millis = (BASE_BACKOFF.as_millis() as f64 * self.limits.backoff_multiplier.powi(k))
            .min(self.limits.max_backoff_ms as f64);
        let duration = Duration::from_millis(millis as u64);
        state.backoff = Some(Backoff {
            started: now,
            duration,
        });

        obs::emit_backoff(duration.as_millis() as u64, reason);
        self.bus.emit(Signal::BackoffTriggered {
            duration_ms: duration.as_millis() as u64,
            reason: reason.to_string(),
        });

        // Without a runtime the backoff still expires by elapsed time; the
        // maintenance tick (or the next recorded batch) drains the queue.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(self);
            let timer = handle.spawn(async move {
                tokio::time::sleep(duration).await;
                if let Some(inner) = weak.upgrade() {
                    inner.end_backoff();
                }
            });
            let mut tasks = lock_or_recover(&self.tasks);
            if let Some(previous) = tasks.backoff_timer.replace(timer) {
                previous.abort();
            }
        }
    }

    fn end_backoff(self: &Arc<Self>) {
        let mut state = lock_or_recover(&self.state);
        if !state.backoff_active(Instant::now()) && state.backoff.take().is_some() {
            debug!("backoff expired");
        }
        self.drain_queue(&mut state);
    }

    /// Admit queued requests from the head until one is refused.
    fn drain_queue(self: &Arc<Self>, state: &mut GovernorState) {
        if state.destroyed {
            return;
        }
        loop {
            let (abandoned, payload_bytes) = match state.queue.peek() {
                None => break,
                Some(head) => (head.done.is_closed(), head.payload_bytes),
            };
            if abandoned {
                state.queue.pop();
                continue;
            }
            if !self.admit(state, payload_bytes).is_admitted() {
                break;
            }
            if let Some(request) = state.queue.pop() {
                debug!(id = %request.id, priority = request.priority, "queued request admitted");
                let _ = request.done.send(Ok(()));
            }
        }
    }

    fn maintenance_tick(self: &Arc<Self>) {
        let mut state = lock_or_recover(&self.state);
        let now = Instant::now();
        state.evict_expired(now);
        state.trim_history();
        if !state.backoff_active(now) {
            state.backoff = None;
        }
        self.drain_queue(&mut state);
    }
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// Shared handle to a resource governor. Clones refer to the same state.
#[derive(Clone)]
pub struct ResourceGovernor {
    inner: Arc<GovernorInner>,
}

impl ResourceGovernor {
    pub fn new(limits: ResourceLimits, bus: SignalBus) -> Self {
        Self {
            inner: Arc::new(GovernorInner {
                limits,
                bus,
                state: Mutex::new(GovernorState::default()),
                tasks: Mutex::new(GovernorTasks::default()),
            }),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.inner.limits
    }

    /// Start the periodic maintenance tick. Requires a Tokio runtime.
    pub fn start(&self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no tokio runtime; governor maintenance tick not started");
                return;
            }
        };
        let weak: Weak<GovernorInner> = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.maintenance_tick(),
                    None => break,
                }
            }
        });
        let mut tasks = lock_or_recover(&self.inner.tasks);
        if let Some(previous) = tasks.maintenance.replace(task) {
            previous.abort();
        }
        info!(
            max_rate_per_second = self.inner.limits.max_rate_per_second,
            max_payload_bytes = self.inner.limits.max_payload_bytes,
            "resource governor started"
        );
    }

    /// Decide whether work with the given payload may start now.
    ///
    /// An admitted check counts against the rate window.
    pub fn check_admission(&self, estimated_payload_bytes: u64) -> bool {
        self.admission(estimated_payload_bytes).is_admitted()
    }

    /// Like [`check_admission`](Self::check_admission) but reports why work was refused.
    pub fn admission(&self, estimated_payload_bytes: u64) -> Admission {
        let mut state = lock_or_recover(&self.inner.state);
        if state.destroyed {
            return Admission::BackingOff;
        }
        self.inner.admit(&mut state, estimated_payload_bytes)
    }

    /// Wait for a slot.
    ///
    /// Returns immediately when admitted. Otherwise the request joins the
    /// priority queue (higher `priority` first, FIFO among equals) and
    /// resolves when drained. Oversized payloads fail without queueing, as
    /// do all refusals when queueing is disabled.
    pub async fn acquire_slot(
        &self,
        id: &str,
        estimated_payload_bytes: u64,
        priority: i32,
    ) -> Result<(), GovernorError> {
        let rx = {
            let mut state = lock_or_recover(&self.inner.state);
            if state.destroyed {
                return Err(GovernorError::Shutdown);
            }
            match self.inner.admit(&mut state, estimated_payload_bytes) {
                Admission::Admitted => return Ok(()),
                Admission::PayloadTooLarge => {
                    return Err(GovernorError::PayloadTooLarge {
                        estimated: estimated_payload_bytes,
                        limit: self.inner.limits.max_payload_bytes,
                    })
                }
                _ => {}
            }
            if !self.inner.limits.batching_enabled {
                return Err(GovernorError::ResourceExhausted { id: id.to_string() });
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(QueuedRequest {
                id: id.to_string(),
                payload_bytes: estimated_payload_bytes,
                priority,
                seq,
                done: tx,
            });
            debug!(id, priority, queued = state.queue.len(), "request queued");
            rx
        };

        rx.await.map_err(|_| GovernorError::Shutdown)?
    }

    /// Record a finished batch and re-evaluate overload.
    pub fn record_batch(&self, metrics: BatchMetrics) {
        let mut state = lock_or_recover(&self.inner.state);
        if state.destroyed {
            return;
        }

        state.history.push(metrics);
        state.trim_history();
        state.total_validations += 1;
        state.total_errors += metrics.error_count as u64;
        state.current_processing_time_ms = metrics.processing_time_ms;
        state.current_payload_bytes = metrics.payload_size;
        state.average_processing_time_ms = state.trailing_average();
        state.overload_acknowledged = false;

        let ceiling = self.inner.limits.max_processing_time_ms;
        let error_rate = state.recent_error_rate();
        if metrics.processing_time_ms > ceiling {
            let reason = format!(
                "batch took {}ms, ceiling is {}ms",
                metrics.processing_time_ms, ceiling
            );
            self.inner.start_backoff(&mut state, &reason);
        } else if error_rate > ERROR_RATE_THRESHOLD {
            let reason = format!(
                "error rate {:.0}% over last {} batches",
                error_rate * 100.0,
                ERROR_RATE_WINDOW
            );
            self.inner.start_backoff(&mut state, &reason);
        }

        self.inner.drain_queue(&mut state);
    }

    pub fn usage(&self) -> ResourceUsageSnapshot {
        let mut state = lock_or_recover(&self.inner.state);
        state.evict_expired(Instant::now());
        ResourceUsageSnapshot {
            current_payload_bytes: state.current_payload_bytes,
            current_processing_time_ms: state.current_processing_time_ms,
            current_rate_per_second: state.rate_window.len() as u32,
            total_validations: state.total_validations,
            total_errors: state.total_errors,
            average_processing_time_ms: state.average_processing_time_ms,
        }
    }

    pub fn queue_len(&self) -> usize {
        lock_or_recover(&self.inner.state).queue.len()
    }

    pub fn history_len(&self) -> usize {
        lock_or_recover(&self.inner.state).history.len()
    }

    pub fn is_backing_off(&self) -> bool {
        lock_or_recover(&self.inner.state).backoff_active(Instant::now())
    }

    /// Stop timers and fail every queued request with [`GovernorError::Shutdown`].
    pub fn destroy(&self) {
        {
            let mut tasks = lock_or_recover(&self.inner.tasks);
            if let Some(task) = tasks.maintenance.take() {
                task.abort();
            }
            if let Some(task) = tasks.backoff_timer.take() {
                task.abort();
            }
        }

        let mut state = lock_or_recover(&self.inner.state);
        state.destroyed = true;
        state.backoff = None;
        let pending = state.queue.len();
        for request in state.queue.drain() {
            let _ = request.done.send(Err(GovernorError::Shutdown));
        }
        info!(failed_requests = pending, "resource governor destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            max_payload_bytes: 1_000,
            max_processing_time_ms: 1_000,
            max_rate_per_second: 5,
            backoff_enabled: true,
            backoff_multiplier: 2.0,
            max_backoff_ms: 4_000,
            batching_enabled: true,
        }
    }

    fn batch(processing_time_ms: u64, error_count: usize) -> BatchMetrics {
        BatchMetrics {
            processing_time_ms,
            payload_size: 100,
            phase_count: 2,
            error_count,
        }
    }

    #[test]
    fn test_queue_orders_by_priority_then_arrival() {
        let mut heap = BinaryHeap::new();
        for (seq, priority) in [(0u64, 1), (1, 5), (2, 1), (3, 5)] {
            let (tx, _rx) = oneshot::channel();
            heap.push(QueuedRequest {
                id: format!("r{seq}"),
                payload_bytes: 0,
                priority,
                seq,
                done: tx,
            });
        }
        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|r| r.id)).collect();
        assert_eq!(order, vec!["r1", "r3", "r0", "r2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_caps_admissions() {
        let governor = ResourceGovernor::new(limits(), SignalBus::new());
        for _ in 0..5 {
            assert!(governor.check_admission(0));
        }
        assert!(!governor.check_admission(0));
        assert_eq!(governor.usage().current_rate_per_second, 5);

        tokio::time::advance(RATE_WINDOW).await;
        assert!(governor.check_admission(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_signal_carries_wait() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();
        let governor = ResourceGovernor::new(
            ResourceLimits {
                max_rate_per_second: 4,
                ..limits()
            },
            bus,
        );
        for _ in 0..4 {
            assert!(governor.check_admission(0));
        }
        assert!(!governor.check_admission(0));
        assert_eq!(rx.try_recv().unwrap(), Signal::RateLimited { wait_ms: 250 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_payload_not_queued() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();
        let governor = ResourceGovernor::new(limits(), bus);

        assert!(!governor.check_admission(5_000));
        assert!(matches!(rx.try_recv().unwrap(), Signal::ResourceWarning { .. }));

        let err = governor.acquire_slot("big", 5_000, 0).await.unwrap_err();
        assert_eq!(
            err,
            GovernorError::PayloadTooLarge {
                estimated: 5_000,
                limit: 1_000
            }
        );
        assert_eq!(governor.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_batch_triggers_bounded_backoff() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();
        let governor = ResourceGovernor::new(limits(), bus);

        governor.record_batch(batch(1_500, 0));
        let duration_ms = match rx.try_recv().unwrap() {
            Signal::BackoffTriggered { duration_ms, .. } => duration_ms,
            other => panic!("unexpected signal {other:?}"),
        };
        assert!([1_000, 2_000, 4_000].contains(&duration_ms));
        assert!(governor.is_backing_off());
        assert!(!governor.check_admission(0));

        tokio::time::advance(Duration::from_millis(duration_ms - 1)).await;
        assert!(!governor.check_admission(0));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(governor.check_admission(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_capped_at_maximum() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();
        let governor = ResourceGovernor::new(
            ResourceLimits {
                backoff_multiplier: 10.0,
                max_backoff_ms: 1_500,
                ..limits()
            },
            bus,
        );
        governor.record_batch(batch(2_000, 0));
        match rx.try_recv().unwrap() {
            Signal::BackoffTriggered { duration_ms, .. } => {
                assert!(duration_ms == 1_000 || duration_ms == 1_500)
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_disabled_never_blocks() {
        let governor = ResourceGovernor::new(
            ResourceLimits {
                backoff_enabled: false,
                ..limits()
            },
            SignalBus::new(),
        );
        governor.record_batch(batch(5_000, 0));
        assert!(!governor.is_backing_off());
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_error_rate_triggers_backoff() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();
        let governor = ResourceGovernor::new(limits(), bus);

        for _ in 0..10 {
            governor.record_batch(batch(10, 0));
        }
        assert!(rx.try_recv().is_err());

        // 3 of the last 10 sits at the threshold; 4 of 10 is above it.
        for _ in 0..3 {
            governor.record_batch(batch(10, 1));
        }
        assert!(rx.try_recv().is_err());
        governor.record_batch(batch(10, 2));
        assert!(matches!(rx.try_recv().unwrap(), Signal::BackoffTriggered { .. }));
        assert_eq!(governor.usage().total_errors, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_average_degrades_admission_once() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();
        let governor = ResourceGovernor::new(limits(), bus);

        governor.record_batch(batch(900, 0));
        assert!(rx.try_recv().is_err());
        assert_eq!(governor.admission(0), Admission::Degraded);
        assert!(matches!(rx.try_recv().unwrap(), Signal::ResourceWarning { .. }));
        assert!(matches!(rx.try_recv().unwrap(), Signal::BackoffTriggered { .. }));

        tokio::time::advance(Duration::from_millis(4_000)).await;
        assert!(governor.check_admission(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_trimmed() {
        let governor = ResourceGovernor::new(limits(), SignalBus::new());
        for _ in 0..=HISTORY_LIMIT {
            governor.record_batch(batch(1, 0));
        }
        assert_eq!(governor.history_len(), HISTORY_TRIM_TO);
        assert_eq!(governor.usage().total_validations, HISTORY_LIMIT as u64 + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queueing_disabled_fails_fast() {
        let governor = ResourceGovernor::new(
            ResourceLimits {
                max_rate_per_second: 1,
                batching_enabled: false,
                ..limits()
            },
            SignalBus::new(),
        );
        governor.acquire_slot("first", 0, 0).await.unwrap();
        let err = governor.acquire_slot("second", 0, 0).await.unwrap_err();
        assert_eq!(
            err,
            GovernorError::ResourceExhausted {
                id: "second".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_snapshot_tracks_last_batch() {
        let governor = ResourceGovernor::new(limits(), SignalBus::new());
        governor.record_batch(BatchMetrics {
            processing_time_ms: 100,
            payload_size: 640,
            phase_count: 3,
            error_count: 0,
        });
        governor.record_batch(BatchMetrics {
            processing_time_ms: 300,
            payload_size: 128,
            phase_count: 3,
            error_count: 0,
        });
        let usage = governor.usage();
        assert_eq!(usage.current_payload_bytes, 128);
        assert_eq!(usage.current_processing_time_ms, 300);
        assert_eq!(usage.average_processing_time_ms, 200.0);
        assert_eq!(usage.total_validations, 2);
    }
}

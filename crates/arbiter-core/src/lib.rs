//! Arbiter core - incremental validation scheduling
//!
//! Provides the runtime half of Arbiter:
//! - Debounces file-change events into batches and runs validation phases
//! - Gates batches through a rate-, payload- and time-aware resource governor
//! - Streams phase and batch results to a buffered, format-pluggable sink

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod format;
pub mod governor;
pub mod metrics;
pub mod obs;
pub mod phase;
pub mod publisher;
pub mod runner;
pub mod scheduler;
pub mod signals;
pub mod state;
pub mod telemetry;

// Re-export key types
pub use config::{
    ArbiterConfig, ConfigError, OutputConfig, OutputFormat, PhaseConfig, PipelineConfig,
    ResourceLimits, DEBOUNCE_WINDOW, STOP_GRACE,
};
pub use error::{PublisherError, SchedulerError};
pub use fingerprint::{
    DependencyResolver, Fingerprinter, NoopResolver, Sha256Fingerprinter, StaticDependencyGraph,
};
pub use governor::{Admission, BatchMetrics, GovernorError, ResourceGovernor};
pub use metrics::METRICS;
pub use phase::{PhaseExecutor, PhaseOutcome, PhaseRegistry};
pub use publisher::{EventPublisher, PublisherStats};
pub use runner::CommandPhase;
pub use scheduler::{SchedulerBuilder, SchedulerState, ValidationScheduler};
pub use signals::{Signal, SignalBus};
pub use state::{ValidationStateCache, ValidationStateEntry};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

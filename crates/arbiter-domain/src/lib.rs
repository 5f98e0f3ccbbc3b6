//! Arbiter Domain Model
//!
//! Defines the data exchanged between the scheduler, its collaborators and
//! the output sink:
//! - ChangeEvent: a file change reported by an external watcher
//! - ValidationPhaseResult: the outcome of one phase over a batch
//! - BatchResult: all phases of one debounced batch plus averaged coverage
//! - OutputEvent: the tagged records written to the event sink
//! - ResourceUsageSnapshot: the governor's accounting view
//!
//! All objects are serializable; output events can be shape-checked with
//! [`validate_event`] before publishing.

pub mod change;
pub mod error;
pub mod events;
pub mod result;
pub mod schema;

pub use change::{ChangeEvent, ChangeKind};
pub use error::{DomainError, Result, SchemaError};
pub use events::{
    BatchCompleteEvent, ErrorEvent, HeartbeatEvent, OutputEvent, PhaseEvent, TYPE_BATCH_COMPLETE,
    TYPE_ERROR, TYPE_HEARTBEAT, TYPE_VALIDATION_PHASE,
};
pub use result::{
    generate_batch_id, BatchResult, Coverage, Delta, PhaseError, ResourceUsageSnapshot,
    ValidationPhaseResult,
};
pub use schema::validate_event;

/// Arbiter domain version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

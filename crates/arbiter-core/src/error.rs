//! Error types for the publisher and scheduler.
//!
//! Governor errors live next to the governor (`governor::GovernorError`).

use arbiter_domain::SchemaError;

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    /// The event failed the shape check and was not buffered.
    #[error("malformed event: {0}")]
    Schema(#[from] SchemaError),

    /// Writing to the sink failed. Flushed events were re-buffered.
    #[error("sink write failed: {0}")]
    Sink(#[from] std::io::Error),

    #[error("publisher not started")]
    NotStarted,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is not running")]
    NotRunning,

    #[error("publish failed: {0}")]
    Publish(#[from] PublisherError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

//! Signals raised by the scheduler, governor and publisher.
//!
//! Signals are for host wiring (logging, metrics, supervisors) and are never
//! persisted. Each component receives a [`SignalBus`] clone at construction.

use arbiter_domain::{BatchResult, ValidationPhaseResult};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    PhaseComplete {
        batch_id: String,
        result: ValidationPhaseResult,
    },
    BatchComplete(BatchResult),
    Error {
        /// Component that raised the error
        source: &'static str,
        message: String,
    },
    BackoffTriggered {
        duration_ms: u64,
        reason: String,
    },
    ResourceWarning {
        message: String,
    },
    RateLimited {
        wait_ms: u64,
    },
}

/// Fan-out channel for [`Signal`]s.
///
/// Emitting never blocks and never fails: with no subscribers the signal is
/// dropped, and subscribers that fall behind observe a lag instead of
/// slowing the emitter down.
#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<Signal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    pub fn emit(&self, signal: Signal) {
        let _ = self.tx.send(signal);
    }

    pub fn error(&self, source: &'static str, message: impl Into<String>) {
        self.emit(Signal::Error {
            source,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = SignalBus::new();
        bus.emit(Signal::RateLimited { wait_ms: 100 });
    }

    #[tokio::test]
    async fn test_subscribers_receive_signals_in_order() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Signal::RateLimited { wait_ms: 100 });
        bus.error("publisher", "sink closed");

        assert_eq!(rx.recv().await.unwrap(), Signal::RateLimited { wait_ms: 100 });
        assert_eq!(
            rx.recv().await.unwrap(),
            Signal::Error {
                source: "publisher",
                message: "sink closed".to_string()
            }
        );
    }
}

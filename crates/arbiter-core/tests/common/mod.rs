//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use arbiter_core::{
    EventPublisher, Fingerprinter, OutputConfig, PhaseExecutor, PhaseOutcome, PipelineConfig,
    PhaseRegistry, ResourceGovernor, ResourceLimits, SignalBus, ValidationScheduler,
};
use arbiter_domain::{ChangeEvent, Coverage, PhaseError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;

// ============================================================================
// SINKS
// ============================================================================

/// In-memory sink that can be switched into a failing state.
#[derive(Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    flushes: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.data.lock().unwrap().clone()).unwrap()
    }

    /// Parse the sink contents as NDJSON.
    pub fn events(&self) -> Vec<Value> {
        self.text()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|e| e["type"] == event_type)
            .collect()
    }

    /// Completed sink flushes, one per successful publisher flush.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Write calls, including failed ones.
    pub fn write_attempts(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl AsyncWrite for MemorySink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink down")));
        }
        self.data.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// PHASE EXECUTORS
// ============================================================================

#[derive(Clone)]
pub enum Script {
    Pass(Coverage),
    Fail(Vec<PhaseError>),
    Error(String),
    Sleep(Duration),
    Panic,
}

/// Executor that follows a script and records every call.
#[derive(Clone)]
pub struct ScriptedPhase {
    script: Script,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedPhase {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn passing() -> Self {
        Self::new(Script::Pass(Coverage::full()))
    }

    pub fn failing(message: &str) -> Self {
        Self::new(Script::Fail(vec![PhaseError::new("a.cue", message).at_line(1)]))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// File sets passed to each call.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn into_arc(self) -> Arc<dyn PhaseExecutor> {
        Arc::new(self)
    }
}

#[async_trait]
impl PhaseExecutor for ScriptedPhase {
    async fn execute(
        &self,
        _phase: &str,
        files: &[String],
        _changes: &[ChangeEvent],
    ) -> anyhow::Result<PhaseOutcome> {
        self.calls.lock().unwrap().push(files.to_vec());
        match &self.script {
            Script::Pass(coverage) => Ok(PhaseOutcome::passed(*coverage)),
            Script::Fail(errors) => Ok(PhaseOutcome::failed(Coverage::zero(), errors.clone())),
            Script::Error(message) => Err(anyhow::anyhow!(message.clone())),
            Script::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(PhaseOutcome::passed(Coverage::full()))
            }
            Script::Panic => panic!("validator crashed"),
        }
    }
}

// ============================================================================
// FINGERPRINTS
// ============================================================================

/// Fingerprinter backed by a settable map; unknown paths have no fingerprint.
#[derive(Clone, Default)]
pub struct MapFingerprinter {
    prints: Arc<Mutex<HashMap<String, String>>>,
}

impl MapFingerprinter {
    pub fn set(&self, path: &str, fingerprint: &str) {
        self.prints
            .lock()
            .unwrap()
            .insert(path.to_string(), fingerprint.to_string());
    }

    pub fn remove(&self, path: &str) {
        self.prints.lock().unwrap().remove(path);
    }
}

#[async_trait]
impl Fingerprinter for MapFingerprinter {
    async fn fingerprint(&self, path: &str) -> Option<String> {
        self.prints.lock().unwrap().get(path).cloned()
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// A started scheduler wired to an in-memory sink.
pub struct Harness {
    pub scheduler: ValidationScheduler,
    pub publisher: EventPublisher,
    pub governor: ResourceGovernor,
    pub bus: SignalBus,
    pub sink: MemorySink,
    pub fingerprints: MapFingerprinter,
}

impl Harness {
    pub async fn start(pipeline: PipelineConfig, registry: PhaseRegistry) -> Self {
        Self::start_with(pipeline, registry, ResourceLimits::default(), |b| b).await
    }

    pub async fn start_with(
        pipeline: PipelineConfig,
        registry: PhaseRegistry,
        limits: ResourceLimits,
        customize: impl FnOnce(arbiter_core::SchedulerBuilder) -> arbiter_core::SchedulerBuilder,
    ) -> Self {
        let bus = SignalBus::new();
        let sink = MemorySink::new();
        let output = OutputConfig {
            buffer_size: 1_000,
            flush_interval_ms: 60_000,
            ..OutputConfig::default()
        };
        let publisher = EventPublisher::with_writer(output, bus.clone(), sink.clone());
        publisher.start().await.unwrap();
        let governor = ResourceGovernor::new(limits, bus.clone());
        let fingerprints = MapFingerprinter::default();

        let builder = ValidationScheduler::builder(
            pipeline,
            registry,
            governor.clone(),
            publisher.clone(),
            bus.clone(),
        )
        .fingerprinter(Arc::new(fingerprints.clone()));
        let scheduler = customize(builder).build();
        scheduler.start();

        Self {
            scheduler,
            publisher,
            governor,
            bus,
            sink,
            fingerprints,
        }
    }

    /// Flush the publisher and return everything written so far.
    pub async fn written(&self) -> Vec<Value> {
        self.publisher.flush().await.unwrap();
        self.sink.events()
    }
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

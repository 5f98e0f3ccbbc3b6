//! Buffered, format-pluggable event output.
//!
//! Events are shape-checked on the way in, buffered in memory, and written
//! to the sink in one call per flush. A flush happens when the buffer fills,
//! on a periodic timer, and on [`EventPublisher::stop`]. A failed write puts
//! the events back at the front of the buffer so the next flush retries
//! them (at-least-once delivery).

use crate::config::OutputConfig;
use crate::error::PublisherError;
use crate::format;
use crate::lock_or_recover;
use crate::metrics::METRICS;
use crate::obs;
use crate::signals::SignalBus;
use arbiter_domain::{validate_event, OutputEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Serialized events larger than this are logged as a warning.
pub const LARGE_EVENT_BYTES: usize = 10 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Sink {
    writer: BoxedWriter,
    /// Standard streams are flushed but never closed.
    close_on_stop: bool,
}

/// Health view of a publisher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublisherStats {
    pub total_events_written: u64,
    pub buffer_depth: usize,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub ready: bool,
    pub config: OutputConfig,
}

#[derive(Default)]
struct Counters {
    total_events_written: u64,
    last_flush_at: Option<DateTime<Utc>>,
}

struct PublisherInner {
    config: OutputConfig,
    bus: SignalBus,
    buffer: Mutex<Vec<Value>>,
    /// Held across a whole flush so flushes never interleave.
    sink: tokio::sync::Mutex<Option<Sink>>,
    counters: Mutex<Counters>,
    ready: AtomicBool,
    /// Set while the last flush failed; a full buffer then waits for the
    /// flush timer instead of retrying on every write.
    sink_failing: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

/// Shared handle to an event publisher. Clones refer to the same buffer.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<PublisherInner>,
}

impl EventPublisher {
    /// Publisher for the sink named in `config` (opened by [`start`](Self::start)).
    pub fn new(config: OutputConfig, bus: SignalBus) -> Self {
        Self::build(config, bus, None)
    }

    /// Publisher writing to an arbitrary writer instead of `config.path`.
    /// The writer is shut down on [`stop`](Self::stop).
    pub fn with_writer(
        config: OutputConfig,
        bus: SignalBus,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let sink = Sink {
            writer: Box::new(writer),
            close_on_stop: true,
        };
        Self::build(config, bus, Some(sink))
    }

    fn build(config: OutputConfig, bus: SignalBus, sink: Option<Sink>) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                config,
                bus,
                buffer: Mutex::new(Vec::new()),
                sink: tokio::sync::Mutex::new(sink),
                counters: Mutex::new(Counters::default()),
                ready: AtomicBool::new(false),
                sink_failing: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.inner.config
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Open the sink and start the flush (and heartbeat) timers.
    pub async fn start(&self) -> Result<(), PublisherError> {
        if self.is_ready() {
            return Ok(());
        }

        {
            let mut sink = self.inner.sink.lock().await;
            if sink.is_none() {
                *sink = Some(open_sink(&self.inner.config).await?);
            }
        }
        self.inner.ready.store(true, Ordering::SeqCst);

        let flush_every = Duration::from_millis(self.inner.config.flush_interval_ms.max(1));
        let mut tasks = lock_or_recover(&self.inner.tasks);
        tasks.push(spawn_periodic(
            Arc::downgrade(&self.inner),
            flush_every,
            |publisher| async move {
                // Failures are signaled inside flush and retried next tick.
                let _ = publisher.flush().await;
            },
        ));
        if let Some(ms) = self.inner.config.heartbeat_interval_ms {
            tasks.push(spawn_periodic(
                Arc::downgrade(&self.inner),
                Duration::from_millis(ms.max(1)),
                |publisher| async move {
                    let uptime_ms = publisher.inner.started_at.elapsed().as_millis() as u64;
                    let written = publisher.stats().total_events_written;
                    if let Err(e) = publisher
                        .write_event(&OutputEvent::heartbeat(uptime_ms, written))
                        .await
                    {
                        debug!(error = %e, "heartbeat not written");
                    }
                },
            ));
        }

        info!(
            path = %self.inner.config.path,
            format = self.inner.config.format.as_str(),
            buffer_size = self.inner.config.buffer_size,
            "event publisher started"
        );
        Ok(())
    }

    /// Buffer a typed event.
    pub async fn write_event(&self, event: &OutputEvent) -> Result<(), PublisherError> {
        self.write_value(event.to_value()?).await
    }

    /// Buffer a raw JSON event.
    ///
    /// Malformed events are rejected here when schema validation is on.
    /// When the buffer reaches `buffer_size` this awaits a flush before
    /// returning; a failed flush is signaled and the events stay buffered.
    pub async fn write_value(&self, event: Value) -> Result<(), PublisherError> {
        if !self.is_ready() {
            return Err(PublisherError::NotStarted);
        }
        if self.inner.config.validate_schema {
            validate_event(&event)?;
        }

        let size = serde_json::to_string(&event)?.len();
        if size > LARGE_EVENT_BYTES {
            let event_type = event
                .get("type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string();
            warn!(size_bytes = size, event_type = %event_type, "large output event");
        }

        let buffered = {
            let mut buffer = lock_or_recover(&self.inner.buffer);
            buffer.push(event);
            buffer.len()
        };
        if buffered >= self.inner.config.buffer_size.max(1) {
            if self.inner.sink_failing.load(Ordering::SeqCst) {
                debug!(buffered, "sink failing; flush left to the timer");
            } else {
                let _ = self.flush().await;
            }
        }
        Ok(())
    }

    /// Write every buffered event to the sink in one call.
    ///
    /// Returns the number of events written. An empty buffer is a no-op.
    pub async fn flush(&self) -> Result<usize, PublisherError> {
        let mut sink = self.inner.sink.lock().await;
        let events = std::mem::take(&mut *lock_or_recover(&self.inner.buffer));
        if events.is_empty() {
            return Ok(0);
        }

        let Some(sink) = sink.as_mut() else {
            self.rebuffer(events);
            return Err(PublisherError::NotStarted);
        };
        let payload = match format::render(self.inner.config.format, &events) {
            Ok(payload) => payload,
            Err(e) => {
                self.rebuffer(events);
                return Err(e.into());
            }
        };

        let count = events.len();
        let written = async {
            sink.writer.write_all(payload.as_bytes()).await?;
            sink.writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.inner.sink_failing.store(false, Ordering::SeqCst);
                let mut counters = lock_or_recover(&self.inner.counters);
                counters.total_events_written += count as u64;
                counters.last_flush_at = Some(Utc::now());
                METRICS.add_events_flushed(count as u64);
                debug!(events = count, "flushed");
                Ok(count)
            }
            Err(e) => {
                self.inner.sink_failing.store(true, Ordering::SeqCst);
                let buffered = self.rebuffer(events);
                METRICS.inc_flush_failures();
                obs::emit_flush_failed(count, buffered, &e);
                self.inner
                    .bus
                    .error("publisher", format!("flush of {} events failed: {}", count, e));
                Err(PublisherError::Sink(e))
            }
        }
    }

    /// Put `events` back in front of anything buffered since they were
    /// taken. Returns the resulting buffer depth.
    fn rebuffer(&self, events: Vec<Value>) -> usize {
        let mut buffer = lock_or_recover(&self.inner.buffer);
        let newer = std::mem::replace(&mut *buffer, events);
        buffer.extend(newer);
        buffer.len()
    }

    /// Stop timers, flush what is left and close file sinks.
    pub async fn stop(&self) -> Result<(), PublisherError> {
        for task in lock_or_recover(&self.inner.tasks).drain(..) {
            task.abort();
        }
        if !self.inner.ready.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let flushed = self.flush().await;

        let mut sink = self.inner.sink.lock().await;
        if let Some(open) = sink.as_mut() {
            if open.close_on_stop {
                if let Err(e) = open.writer.shutdown().await {
                    warn!(error = %e, "failed to close sink");
                }
                *sink = None;
            }
        }
        info!(
            total_events_written = self.stats().total_events_written,
            "event publisher stopped"
        );
        flushed.map(|_| ())
    }

    pub fn stats(&self) -> PublisherStats {
        let counters = lock_or_recover(&self.inner.counters);
        PublisherStats {
            total_events_written: counters.total_events_written,
            buffer_depth: lock_or_recover(&self.inner.buffer).len(),
            last_flush_at: counters.last_flush_at,
            ready: self.is_ready(),
            config: self.inner.config.clone(),
        }
    }
}

async fn open_sink(config: &OutputConfig) -> Result<Sink, PublisherError> {
    if config.is_stdout() {
        return Ok(Sink {
            writer: Box::new(tokio::io::stdout()),
            close_on_stop: false,
        });
    }

    let path = Path::new(&config.path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(Sink {
        writer: Box::new(file),
        close_on_stop: true,
    })
}

/// Run `tick` every `period` while the publisher is alive.
fn spawn_periodic<F, Fut>(weak: Weak<PublisherInner>, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(EventPublisher) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            match weak.upgrade() {
                Some(inner) => tick(EventPublisher { inner }).await,
                None => break,
            }
        }
    })
}

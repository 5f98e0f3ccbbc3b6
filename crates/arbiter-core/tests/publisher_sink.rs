//! Event publisher behaviour against in-memory and file sinks.

mod common;

use arbiter_core::{EventPublisher, OutputConfig, OutputFormat, PublisherError, Signal, SignalBus};
use arbiter_domain::{
    BatchResult, ChangeEvent, Coverage, Delta, OutputEvent, PhaseError, ValidationPhaseResult,
};
use common::MemorySink;
use std::time::Duration;

fn config(buffer_size: usize) -> OutputConfig {
    OutputConfig {
        buffer_size,
        flush_interval_ms: 60_000,
        ..OutputConfig::default()
    }
}

fn phase_result(name: &str, ok: bool) -> ValidationPhaseResult {
    ValidationPhaseResult {
        name: name.to_string(),
        ok,
        deltas: vec![Delta::from(&ChangeEvent::modified("schemas/app.cue"))],
        coverage: Coverage::uniform(0.5),
        processing_time_ms: 12,
        errors: if ok {
            None
        } else {
            Some(vec![PhaseError::new("schemas/app.cue", "bad").at_line(4)])
        },
    }
}

async fn started(config: OutputConfig) -> (EventPublisher, MemorySink, SignalBus) {
    let bus = SignalBus::new();
    let sink = MemorySink::new();
    let publisher = EventPublisher::with_writer(config, bus.clone(), sink.clone());
    publisher.start().await.unwrap();
    (publisher, sink, bus)
}

/// Test: a full buffer flushes synchronously inside writeEvent
#[tokio::test]
async fn test_buffer_full_triggers_one_flush() {
    let (publisher, sink, _bus) = started(config(2)).await;

    publisher.write_event(&OutputEvent::heartbeat(1, 0)).await.unwrap();
    assert_eq!(sink.flushes(), 0);

    publisher.write_event(&OutputEvent::heartbeat(2, 0)).await.unwrap();
    assert_eq!(sink.flushes(), 1);
    assert_eq!(publisher.stats().total_events_written, 2);

    publisher.write_event(&OutputEvent::heartbeat(3, 0)).await.unwrap();
    let stats = publisher.stats();
    assert_eq!(sink.flushes(), 1);
    assert_eq!(stats.total_events_written, 2);
    assert_eq!(stats.buffer_depth, 1);
    assert_eq!(sink.events().len(), 2);
}

/// Test: flushing an empty buffer writes nothing and changes no stats
#[tokio::test]
async fn test_empty_flush_is_noop() {
    let (publisher, sink, _bus) = started(config(10)).await;
    let before = publisher.stats();

    assert_eq!(publisher.flush().await.unwrap(), 0);

    assert_eq!(sink.flushes(), 0);
    assert_eq!(sink.text(), "");
    assert_eq!(publisher.stats(), before);
    assert!(before.last_flush_at.is_none());
}

/// Test: a failed write re-buffers events in order and signals an error
#[tokio::test]
async fn test_sink_failure_rebuffers() {
    let (publisher, sink, bus) = started(config(10)).await;
    let mut rx = bus.subscribe();

    sink.set_failing(true);
    publisher.write_event(&OutputEvent::heartbeat(1, 0)).await.unwrap();
    publisher.write_event(&OutputEvent::heartbeat(2, 0)).await.unwrap();
    let err = publisher.flush().await.unwrap_err();
    assert!(matches!(err, PublisherError::Sink(_)));
    assert_eq!(publisher.stats().buffer_depth, 2);
    assert_eq!(publisher.stats().total_events_written, 0);
    match rx.try_recv().unwrap() {
        Signal::Error { source, .. } => assert_eq!(source, "publisher"),
        other => panic!("unexpected signal {:?}", other),
    }

    sink.set_failing(false);
    publisher.write_event(&OutputEvent::heartbeat(3, 0)).await.unwrap();
    assert_eq!(publisher.flush().await.unwrap(), 3);

    let uptimes: Vec<u64> = sink
        .events()
        .iter()
        .map(|e| e["uptime_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(uptimes, vec![1, 2, 3]);
}

/// Test: while the sink is down a full buffer waits for the timer instead of
/// retrying on every write
#[tokio::test]
async fn test_failing_sink_is_not_retried_on_every_write() {
    let (publisher, sink, _bus) = started(config(2)).await;
    sink.set_failing(true);

    for uptime in 1..=5 {
        publisher.write_event(&OutputEvent::heartbeat(uptime, 0)).await.unwrap();
    }
    assert_eq!(sink.write_attempts(), 1);
    assert_eq!(publisher.stats().buffer_depth, 5);

    // An explicit flush (as the timer does) retries and recovers.
    sink.set_failing(false);
    assert_eq!(publisher.flush().await.unwrap(), 5);

    // Healthy again: a full buffer flushes synchronously.
    publisher.write_event(&OutputEvent::heartbeat(6, 0)).await.unwrap();
    publisher.write_event(&OutputEvent::heartbeat(7, 0)).await.unwrap();
    assert_eq!(publisher.stats().buffer_depth, 0);
    assert_eq!(publisher.stats().total_events_written, 7);
}

/// Test: NDJSON output parses back into the same events
#[tokio::test]
async fn test_ndjson_round_trip() {
    let (publisher, sink, _bus) = started(config(10)).await;
    let batch = BatchResult::new(
        "batch-1-deadbeef",
        vec![phase_result("validate", true), phase_result("ui", false)],
        40,
    );
    let events = vec![
        OutputEvent::phase("batch-1-deadbeef", &batch.phases[0]),
        OutputEvent::phase("batch-1-deadbeef", &batch.phases[1]),
        OutputEvent::batch_complete(&batch),
        OutputEvent::error(Some("scheduler"), Some("batch-1-deadbeef"), "boom"),
    ];
    for event in &events {
        publisher.write_event(event).await.unwrap();
    }
    publisher.flush().await.unwrap();

    let parsed: Vec<OutputEvent> = sink
        .text()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(parsed, events);
}

/// Test: file sinks create parent directories and are closed on stop
#[tokio::test]
async fn test_file_sink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/out/events.ndjson");
    let output = OutputConfig {
        path: path.to_string_lossy().to_string(),
        ..config(10)
    };
    let publisher = EventPublisher::new(output, SignalBus::new());
    publisher.start().await.unwrap();

    publisher
        .write_event(&OutputEvent::phase("b1", &phase_result("validate", true)))
        .await
        .unwrap();
    publisher.stop().await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1);
    let event: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(event["type"], "validation-phase");
    assert_eq!(event["phase"], "validate");
    assert!(!publisher.stats().ready);
}

/// Test: JSON format writes one pretty array per flush
#[tokio::test]
async fn test_json_array_format() {
    let output = OutputConfig {
        format: OutputFormat::Json,
        ..config(10)
    };
    let (publisher, sink, _bus) = started(output).await;
    publisher.write_event(&OutputEvent::heartbeat(1, 0)).await.unwrap();
    publisher.write_event(&OutputEvent::heartbeat(2, 1)).await.unwrap();
    publisher.flush().await.unwrap();

    let value: serde_json::Value = serde_json::from_str(&sink.text()).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 2);
}

/// Test: the table format renders phases with their errors indented
#[tokio::test]
async fn test_table_format() {
    let output = OutputConfig {
        format: OutputFormat::Table,
        ..config(10)
    };
    let (publisher, sink, _bus) = started(output).await;
    publisher
        .write_event(&OutputEvent::phase("b1", &phase_result("validate", false)))
        .await
        .unwrap();
    publisher.flush().await.unwrap();

    let text = sink.text();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("✗ validate"));
    assert!(lines[0].contains("00012ms"));
    assert!(lines[0].contains("C:50% S:50% U:50% B:50%"));
    assert_eq!(lines[1], "    schemas/app.cue:4: bad");
}

/// Test: the flush timer writes buffered events without a full buffer
#[tokio::test]
async fn test_periodic_flush() {
    let output = OutputConfig {
        flush_interval_ms: 30,
        ..config(100)
    };
    let (publisher, sink, _bus) = started(output).await;
    publisher.write_event(&OutputEvent::heartbeat(1, 0)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(sink.events().len(), 1);
    assert!(publisher.stats().last_flush_at.is_some());
    publisher.stop().await.unwrap();
}

/// Test: heartbeats are published on their own period
#[tokio::test]
async fn test_heartbeat_events() {
    let output = OutputConfig {
        flush_interval_ms: 20,
        heartbeat_interval_ms: Some(25),
        ..config(100)
    };
    let (publisher, sink, _bus) = started(output).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    publisher.stop().await.unwrap();

    let heartbeats = sink.events_of_type("heartbeat");
    assert!(heartbeats.len() >= 2);
    assert!(heartbeats[1]["uptime_ms"].as_u64() >= heartbeats[0]["uptime_ms"].as_u64());
}

/// Test: events written after stop are refused
#[tokio::test]
async fn test_write_after_stop() {
    let (publisher, _sink, _bus) = started(config(10)).await;
    publisher.stop().await.unwrap();
    let err = publisher
        .write_event(&OutputEvent::heartbeat(1, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, PublisherError::NotStarted));
}

//! Wire formats for a flushed batch of output events.
//!
//! Events are rendered from their JSON form so that any shape accepted by
//! the publisher can be written, including event types this crate does not
//! construct itself.

use crate::config::OutputFormat;
use serde_json::Value;
use std::fmt::Write as _;

/// Render `events` as one sink write.
pub fn render(format: OutputFormat, events: &[Value]) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Ndjson => {
            let mut out = String::new();
            for event in events {
                out.push_str(&serde_json::to_string(event)?);
                out.push('\n');
            }
            Ok(out)
        }
        OutputFormat::Json => {
            let mut out = serde_json::to_string_pretty(events)?;
            out.push('\n');
            Ok(out)
        }
        OutputFormat::Table => {
            let mut out = String::new();
            for event in events {
                render_table_event(&mut out, event);
            }
            Ok(out)
        }
    }
}

fn str_field<'a>(event: &'a Value, key: &str) -> &'a str {
    event.get(key).and_then(Value::as_str).unwrap_or("")
}

fn u64_field(event: &Value, key: &str) -> u64 {
    event.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn percent(coverage: Option<&Value>, key: &str) -> u64 {
    let ratio = coverage
        .and_then(|c| c.get(key))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    (ratio.clamp(0.0, 1.0) * 100.0).round() as u64
}

/// `C:100% S:50% U:0% B:25%`
fn coverage_summary(coverage: Option<&Value>) -> String {
    format!(
        "C:{}% S:{}% U:{}% B:{}%",
        percent(coverage, "contracts"),
        percent(coverage, "scenarios"),
        percent(coverage, "ui"),
        percent(coverage, "budgets"),
    )
}

fn render_table_event(out: &mut String, event: &Value) {
    match str_field(event, "type") {
        "validation-phase" => {
            let ok = event.get("ok").and_then(Value::as_bool).unwrap_or(false);
            let deltas = event
                .get("deltas")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let _ = writeln!(
                out,
                "{} {:<12} {:05}ms {:>3} deltas  {}",
                if ok { "✓" } else { "✗" },
                str_field(event, "phase"),
                u64_field(event, "processing_time_ms"),
                deltas,
                coverage_summary(event.get("coverage")),
            );
            for error in event
                .get("errors")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let file = str_field(error, "file");
                let message = str_field(error, "message");
                match error.get("line").and_then(Value::as_u64) {
                    Some(line) => {
                        let _ = writeln!(out, "    {}:{}: {}", file, line, message);
                    }
                    None => {
                        let _ = writeln!(out, "    {}: {}", file, message);
                    }
                }
            }
        }
        "batch-complete" => {
            let phases = event
                .get("phases")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let _ = writeln!(
                out,
                "■ {} {} phases {:05}ms  {}",
                str_field(event, "batch_id"),
                phases,
                u64_field(event, "total_processing_time_ms"),
                coverage_summary(event.get("overall_coverage")),
            );
        }
        "error" => {
            let source = str_field(event, "source");
            if source.is_empty() {
                let _ = writeln!(out, "! error: {}", str_field(event, "message"));
            } else {
                let _ = writeln!(out, "! error [{}]: {}", source, str_field(event, "message"));
            }
        }
        "heartbeat" => {
            let _ = writeln!(
                out,
                "· heartbeat uptime={}ms events={}",
                u64_field(event, "uptime_ms"),
                u64_field(event, "events_written"),
            );
        }
        other => {
            let _ = writeln!(out, "{} {}", other, event);
        }
    }
}

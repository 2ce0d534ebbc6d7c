//! Metric instruments for gazer-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`,
//! which is a no-op until a binary installs one via
//! [`init_telemetry`](super::init_telemetry).

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("gazer-rs")
}

/// Counter: queue store operations.
/// Labels: `queue`, `operation` ("push" | "pop" | "pop_empty" | "push_batch").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("gazer.queue.operations")
        .with_description("Number of queue store operations")
        .build()
}

/// Counter: tasks run through a handler.
/// Labels: `key`, `result` ("ok" | "error").
pub fn tasks_processed() -> Counter<u64> {
    meter()
        .u64_counter("gazer.tasks.processed")
        .with_description("Number of tasks run through a handler")
        .build()
}

/// Counter: popped items that could not be decoded.
/// Labels: `key`.
pub fn decode_failures() -> Counter<u64> {
    meter()
        .u64_counter("gazer.tasks.decode_failures")
        .with_description("Queue items that failed to decode")
        .build()
}

/// Counter: envelopes that were computed but never reached the raw queue.
/// Labels: `key`.
pub fn publish_failures() -> Counter<u64> {
    meter()
        .u64_counter("gazer.raws.publish_failures")
        .with_description("Handler results lost on publish")
        .build()
}

/// Histogram: handler wall time in milliseconds.
/// Labels: `key`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("gazer.handler.duration_ms")
        .with_description("Handler duration in milliseconds")
        .with_unit("ms")
        .build()
}

pub(crate) fn record_queue_op(queue: &str, operation: &'static str) {
    queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

pub(crate) fn record_processed(key: &str, ok: bool, duration_ms: f64) {
    let labels = [KeyValue::new("key", key.to_string())];
    handler_duration_ms().record(duration_ms, &labels);
    tasks_processed().add(
        1,
        &[
            KeyValue::new("key", key.to_string()),
            KeyValue::new("result", if ok { "ok" } else { "error" }),
        ],
    );
}

pub(crate) fn record_decode_failure(key: &str) {
    decode_failures().add(1, &[KeyValue::new("key", key.to_string())]);
}

pub(crate) fn record_publish_failure(key: &str) {
    publish_failures().add(1, &[KeyValue::new("key", key.to_string())]);
}

//! Task span helpers.
//!
//! One span per task popped by a fetcher or consumer. The `task.outcome`
//! field is declared empty and filled by [`record_outcome`].

use tracing::Span;

/// Start a span for one task moving through a stage ("fetch" | "consume").
pub fn start_task_span(stage: &'static str, key: &str, seq: u64) -> Span {
    tracing::info_span!(
        "task.process",
        "task.stage" = stage,
        "task.key" = key,
        "task.seq" = seq,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record how the task ended ("ok" | "handler_error" | "decode_error" | ...).
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("task.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome, "task finished");
    });
}

//! Core data model.
//!
//! A task is something a producer wants done: a queue key plus opaque
//! parameters. An envelope is what the fetch stage publishes downstream
//! after the handler succeeds: the handler output stamped with its source
//! key and creation time.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Namespace used when none is configured.
pub const DEFAULT_NAME: &str = "gazer";

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A keyed unit of work submitted by a producer.
///
/// Only `params` travels over the task queue. The key picks the queue and
/// is implied by where the item was popped from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task<T> {
    pub key: String,
    pub params: T,
}

impl<T> Task<T> {
    pub fn new(key: impl Into<String>, params: T) -> Self {
        Self {
            key: key.into(),
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Timestamped wrapper around a handler's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Key of the task queue the payload was produced from.
    pub key: String,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    /// Older producers wrote this field as `raw`.
    #[serde(alias = "raw")]
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wrap `payload`, stamped with the current time.
    pub fn new(key: impl Into<String>, payload: T) -> Self {
        Self {
            key: key.into(),
            created_at: Utc::now().timestamp(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue naming
// ---------------------------------------------------------------------------

/// Queue a producer pushes to and a fetcher pops from.
pub fn task_queue(name: &str, key: &str) -> String {
    format!("{name}:tasks:{key}")
}

/// Queue a fetcher publishes envelopes to and a consumer pops from.
pub fn raw_queue(name: &str, key: &str) -> String {
    format!("{name}:raws:{key}")
}

/// Resolve an optional namespace to the one actually used.
pub(crate) fn resolve_name(name: Option<String>) -> String {
    name.filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_NAME.to_string())
}

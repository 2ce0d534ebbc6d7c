//! # gazer-rs
//!
//! Pull-based task pipelines over a shared, list-backed queue store.
//!
//! Producers push tasks with a [`Tasker`](tasker::Tasker); a
//! [`Fetcher`](fetcher::Fetcher) pops them, runs a handler through a
//! bounded [`Pool`](pool::Pool) and publishes each result as an
//! [`Envelope`](model::Envelope); a [`Consumer`](consumer::Consumer) drains
//! the envelopes into a terminal handler. The store is any
//! [`QueueStore`](store::QueueStore): Postgres ([`db::Db`]) or in-process
//! ([`store::MemoryStore`]).

pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod model;
pub mod pool;
pub mod store;
pub mod tasker;
pub mod telemetry;

pub use consumer::Consumer;
pub use error::{Error, HandlerError, Result};
pub use fetcher::{FetchMode, Fetcher};
pub use model::{Envelope, Task};
pub use pool::{Pool, WorkItem};
pub use store::{MemoryStore, QueueStore};
pub use tasker::Tasker;

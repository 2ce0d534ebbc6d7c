//! Queue store abstraction.
//!
//! A queue store is a list-backed store of named queues with atomic
//! pop-from-head. Atomic pop is the one concurrency guarantee the loops
//! rely on: no two callers ever receive the same item.

pub mod memory;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;

pub use memory::MemoryStore;

/// Which end of a queue a push goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// Next in line to be popped.
    Head,
    /// Behind everything already queued.
    Tail,
}

/// One push inside a [`QueueStore::push_batch`].
#[derive(Debug, Clone)]
pub struct PushOp {
    pub queue: String,
    pub item: Vec<u8>,
    pub end: End,
}

impl PushOp {
    pub fn tail(queue: impl Into<String>, item: Vec<u8>) -> Self {
        Self {
            queue: queue.into(),
            item,
            end: End::Tail,
        }
    }

    pub fn head(queue: impl Into<String>, item: Vec<u8>) -> Self {
        Self {
            queue: queue.into(),
            item,
            end: End::Head,
        }
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Push one encoded item onto `queue`.
    async fn push(&self, queue: &str, item: Vec<u8>, end: End) -> Result<()>;

    /// Atomically remove and return the head of `queue`.
    ///
    /// An empty queue is `Ok(None)`, not an error.
    async fn pop(&self, queue: &str) -> Result<Option<Vec<u8>>>;

    /// Number of items currently in `queue`.
    async fn len(&self, queue: &str) -> Result<usize>;

    /// Push several items, returning how many landed.
    ///
    /// Failed pushes are logged and skipped rather than aborting the batch.
    /// Stores with a cheaper multi-push override this to use one round trip.
    async fn push_batch(&self, ops: Vec<PushOp>) -> Result<usize> {
        let mut pushed = 0;
        for op in ops {
            match self.push(&op.queue, op.item, op.end).await {
                Ok(()) => pushed += 1,
                Err(e) => warn!(queue = %op.queue, error = %e, "batch push failed, skipping item"),
            }
        }
        Ok(pushed)
    }

    async fn push_tail(&self, queue: &str, item: Vec<u8>) -> Result<()> {
        self.push(queue, item, End::Tail).await
    }

    async fn push_head(&self, queue: &str, item: Vec<u8>) -> Result<()> {
        self.push(queue, item, End::Head).await
    }
}

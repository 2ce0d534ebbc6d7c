//! In-process queue store.
//!
//! Used by tests and by programs that run producer and stages in one
//! process. Every operation takes the same lock, so pops are atomic.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{End, QueueStore};
use crate::error::{Error, Result};
use crate::telemetry::metrics;

#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queues<F, O>(&self, f: F) -> Result<O>
    where
        F: FnOnce(&mut HashMap<String, VecDeque<Vec<u8>>>) -> O,
    {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))?;
        Ok(f(&mut queues))
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(&self, queue: &str, item: Vec<u8>, end: End) -> Result<()> {
        self.with_queues(|queues| {
            let list = queues.entry(queue.to_string()).or_default();
            match end {
                End::Head => list.push_front(item),
                End::Tail => list.push_back(item),
            }
        })?;
        metrics::record_queue_op(queue, "push");
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let item = self.with_queues(|queues| {
            let list = queues.get_mut(queue)?;
            let item = list.pop_front();
            if list.is_empty() {
                queues.remove(queue);
            }
            item
        })?;
        metrics::record_queue_op(queue, if item.is_some() { "pop" } else { "pop_empty" });
        Ok(item)
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        self.with_queues(|queues| queues.get(queue).map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PushOp;

    #[tokio::test]
    async fn pops_in_fifo_order_from_tail_pushes() {
        let store = MemoryStore::new();
        store.push_tail("q", b"1".to_vec()).await.unwrap();
        store.push_tail("q", b"2".to_vec()).await.unwrap();

        assert_eq!(store.pop("q").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.pop("q").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn head_push_jumps_the_line() {
        let store = MemoryStore::new();
        store.push_tail("q", b"tail".to_vec()).await.unwrap();
        store.push_head("q", b"head".to_vec()).await.unwrap();

        assert_eq!(store.len("q").await.unwrap(), 2);
        assert_eq!(store.pop("q").await.unwrap(), Some(b"head".to_vec()));
    }

    #[tokio::test]
    async fn batch_pushes_every_op() {
        let store = MemoryStore::new();
        let pushed = store
            .push_batch(vec![
                PushOp::tail("a", b"1".to_vec()),
                PushOp::tail("b", b"2".to_vec()),
                PushOp::head("a", b"0".to_vec()),
            ])
            .await
            .unwrap();

        assert_eq!(pushed, 3);
        assert_eq!(store.len("a").await.unwrap(), 2);
        assert_eq!(store.pop("a").await.unwrap(), Some(b"0".to_vec()));
        assert_eq!(store.len("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_pops_never_share_an_item() {
        let store = std::sync::Arc::new(MemoryStore::new());
        for i in 0..200u32 {
            store.push_tail("q", i.to_be_bytes().to_vec()).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(item) = store.pop("q").await.unwrap() {
                    got.push(item);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }
}

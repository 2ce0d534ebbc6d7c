//! Producer side: push tasks onto `{name}:tasks:{key}`.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Task, resolve_name, task_queue};
use crate::store::{PushOp, QueueStore};

pub struct Tasker<T> {
    store: Arc<dyn QueueStore>,
    name: String,
    _params: PhantomData<fn(T)>,
}

impl<T> Tasker<T>
where
    T: Serialize,
{
    /// `name` falls back to [`DEFAULT_NAME`](crate::model::DEFAULT_NAME).
    pub fn new(store: Arc<dyn QueueStore>, name: Option<String>) -> Self {
        Self {
            store,
            name: resolve_name(name),
            _params: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a task behind everything already queued under its key.
    pub async fn push_task(&self, task: &Task<T>) -> Result<()> {
        let item = encode(task)?;
        self.store
            .push_tail(&task_queue(&self.name, &task.key), item)
            .await
    }

    /// Put a task at the front of its queue so it is fetched next.
    pub async fn push_task_front(&self, task: &Task<T>) -> Result<()> {
        let item = encode(task)?;
        self.store
            .push_head(&task_queue(&self.name, &task.key), item)
            .await
    }

    /// Append many tasks in one store batch; returns how many were queued.
    ///
    /// Tasks whose params fail to encode are logged and skipped; the rest
    /// still go out.
    pub async fn push_tasks(&self, tasks: &[Task<T>]) -> Result<usize> {
        let mut ops = Vec::with_capacity(tasks.len());
        for task in tasks {
            match encode(task) {
                Ok(item) => ops.push(PushOp::tail(task_queue(&self.name, &task.key), item)),
                Err(e) => warn!(key = %task.key, error = %e, "skipping task that failed to encode"),
            }
        }
        if ops.is_empty() {
            return Ok(0);
        }

        let requested = ops.len();
        let pushed = self.store.push_batch(ops).await?;
        debug!(requested, pushed, skipped = tasks.len() - pushed, "pushed task batch");
        Ok(pushed)
    }
}

fn encode<T: Serialize>(task: &Task<T>) -> Result<Vec<u8>> {
    serde_json::to_vec(&task.params).map_err(Error::Encode)
}

//! Consume stage: drain a raw queue into a terminal handler.
//!
//! No pool and no concurrency: one envelope is popped, decoded and handed
//! to the handler before the next pop.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::config::DEFAULT_BACKOFF;
use crate::error::{Error, HandlerError, Result};
use crate::model::{Envelope, raw_queue, resolve_name};
use crate::pool::{HandlerFn, boxed_handler};
use crate::store::QueueStore;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_outcome, start_task_span};

pub struct Consumer<R> {
    store: Arc<dyn QueueStore>,
    key: String,
    queue: String,
    handler: HandlerFn<Envelope<R>, ()>,
    backoff: Duration,
    seq: AtomicU64,
}

impl<R> Consumer<R>
where
    R: DeserializeOwned + Send + 'static,
{
    pub fn builder() -> ConsumerBuilder<R> {
        ConsumerBuilder::default()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Pop one envelope and hand it to the handler.
    ///
    /// An empty queue sleeps the backoff and returns `Ok(())`. An empty
    /// item is skipped with `Ok(())`. Decode and handler failures are
    /// returned.
    pub async fn consume(&self) -> Result<()> {
        let Some(item) = self.store.pop(&self.queue).await? else {
            tokio::time::sleep(self.backoff).await;
            return Ok(());
        };
        if item.is_empty() {
            debug!(queue = %self.queue, "skipping empty item");
            return Ok(());
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let span = start_task_span("consume", &self.key, seq);
        async {
            let envelope: Envelope<R> = match serde_json::from_slice(&item) {
                Ok(envelope) => envelope,
                Err(e) => {
                    record_outcome(&span, "decode_error");
                    metrics::record_decode_failure(&self.key);
                    return Err(Error::Decode(e));
                }
            };
            match (self.handler)(envelope).await {
                Ok(()) => {
                    record_outcome(&span, "ok");
                    Ok(())
                }
                Err(e) => {
                    record_outcome(&span, "handler_error");
                    Err(Error::Handler(e))
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Consume until `cancel` fires. Errors are logged and skipped; store
    /// failures also wait out the backoff before the next pop.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(key = %self.key, queue = %self.queue, "consumer started");
        while !cancel.is_cancelled() {
            let Err(e) = self.consume().await else {
                continue;
            };
            warn!(key = %self.key, error = %e, "consume failed");
            if !e.is_item_error() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }
        info!(key = %self.key, "consumer has been stopped");
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ConsumerBuilder<R> {
    store: Option<Arc<dyn QueueStore>>,
    name: Option<String>,
    key: Option<String>,
    handler: Option<HandlerFn<Envelope<R>, ()>>,
    backoff: Duration,
}

impl<R> Default for ConsumerBuilder<R> {
    fn default() -> Self {
        Self {
            store: None,
            name: None,
            key: None,
            handler: None,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl<R> ConsumerBuilder<R>
where
    R: DeserializeOwned + Send + 'static,
{
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Envelope<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.handler = Some(boxed_handler(handler));
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(self) -> Result<Consumer<R>> {
        let store = self
            .store
            .ok_or_else(|| Error::Config("consumer needs a queue store".to_string()))?;
        let key = self
            .key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::Config("consumer key is empty".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| Error::Config("consumer needs a handler".to_string()))?;
        let name = resolve_name(self.name);

        Ok(Consumer {
            store,
            queue: raw_queue(&name, &key),
            key,
            handler,
            backoff: self.backoff,
            seq: AtomicU64::new(0),
        })
    }
}

//! Fetch stage: pop a task, run the handler, publish the result.
//!
//! A [`Fetcher`] drains `{name}:tasks:{key}`, decodes each item into `T`,
//! runs the handler and pushes the output, wrapped in an [`Envelope`], to
//! `{name}:raws:{key}`. Delivery is at-least-once and poll based: an empty
//! queue costs one backoff sleep, a bad item or handler failure is logged
//! and the loop moves on.
//!
//! The loop never installs signal handlers. Hosts pass a
//! [`CancellationToken`] to [`Fetcher::run`] and own the signal wiring.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::config::{DEFAULT_BACKOFF, DEFAULT_CONCURRENCY};
use crate::error::{Error, HandlerError, Result};
use crate::model::{Envelope, raw_queue, resolve_name, task_queue};
use crate::pool::{HandlerFn, HandlerFuture, Pool, ResultStream, boxed_handler, lock};
use crate::store::QueueStore;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_outcome, start_task_span};

/// How [`Fetcher::run`] schedules fetch/process/publish cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// One cycle at a time: pop, dispatch to the pool, wait, publish.
    #[default]
    Pooled,
    /// Up to `concurrency` cycles at once, each running the handler inline,
    /// bounded by a semaphore instead of the pool.
    Semaphore,
    /// Dispatch as fast as pool backpressure allows; results are matched
    /// back to their task by sequence number and published as they finish.
    Pipelined,
}

type Waiter<R> = oneshot::Sender<std::result::Result<R, HandlerError>>;
type Pending<R> = Mutex<HashMap<u64, Waiter<R>>>;

/// A task tagged with the sequence number its caller is waiting on.
#[derive(Clone)]
struct Tagged<T> {
    seq: u64,
    task: T,
}

struct Inner<T, R> {
    store: Arc<dyn QueueStore>,
    key: String,
    task_queue: String,
    raw_queue: String,
    handler: HandlerFn<T, R>,
    concurrency: usize,
    backoff: Duration,
    mode: FetchMode,
    pool: Pool<Tagged<T>, R>,
    pending: Arc<Pending<R>>,
    seq: AtomicU64,
    router: Mutex<Option<JoinHandle<()>>>,
}

pub struct Fetcher<T, R> {
    inner: Arc<Inner<T, R>>,
}

impl<T, R> Clone for Fetcher<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> Fetcher<T, R>
where
    T: DeserializeOwned + Clone + Send + 'static,
    R: Serialize + Send + 'static,
{
    pub fn builder() -> FetcherBuilder<T, R> {
        FetcherBuilder::default()
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn task_queue(&self) -> &str {
        &self.inner.task_queue
    }

    pub fn raw_queue(&self) -> &str {
        &self.inner.raw_queue
    }

    pub fn mode(&self) -> FetchMode {
        self.inner.mode
    }

    /// Pop one task, run it through the pool and return the handler output.
    ///
    /// - empty queue: sleeps the backoff and returns `Ok(None)`
    /// - undecodable item: `Err(Error::Decode)`, the item is gone
    /// - handler failure: `Err(Error::Handler)`
    pub async fn fetch(&self) -> Result<Option<R>> {
        let Some(task) = self.next_task().await? else {
            return Ok(None);
        };

        let (seq, waiter) = self.submit(task).await?;
        let span = start_task_span("fetch", &self.inner.key, seq);
        async {
            match waiter.await {
                Ok(Ok(output)) => {
                    record_outcome(&span, "ok");
                    Ok(Some(output))
                }
                Ok(Err(e)) => {
                    record_outcome(&span, "handler_error");
                    Err(Error::Handler(e))
                }
                Err(_) => {
                    record_outcome(&span, "dropped");
                    Err(Error::PoolClosed)
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Publish a handler result to the raw queue.
    ///
    /// Best effort: encode and push failures are logged and counted, and
    /// the result is lost.
    pub async fn post(&self, result: R) {
        let envelope = Envelope::new(self.inner.key.as_str(), result);
        let item = match serde_json::to_vec(&envelope) {
            Ok(item) => item,
            Err(e) => {
                error!(key = %self.inner.key, error = %e, "failed to encode envelope, dropping result");
                metrics::record_publish_failure(&self.inner.key);
                return;
            }
        };
        if let Err(e) = self.inner.store.push_tail(&self.inner.raw_queue, item).await {
            error!(queue = %self.inner.raw_queue, error = %e, "failed to publish result, dropping it");
            metrics::record_publish_failure(&self.inner.key);
        }
    }

    /// Run fetch/process/publish cycles until `cancel` fires, then drain
    /// in-flight work and close the pool.
    ///
    /// Cancellation is checked between cycles, never mid-handler. Returns
    /// an error only if the pool was closed underneath the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            key = %self.inner.key,
            queue = %self.inner.task_queue,
            mode = ?self.inner.mode,
            concurrency = self.inner.concurrency,
            "fetcher started"
        );

        let outcome = match self.inner.mode {
            FetchMode::Pooled => self.run_pooled(&cancel).await,
            FetchMode::Semaphore => {
                self.run_bounded(&cancel).await;
                Ok(())
            }
            FetchMode::Pipelined => self.run_pipelined(&cancel).await,
        };
        self.close().await;

        info!(key = %self.inner.key, "fetcher has been stopped");
        outcome
    }

    /// Close the worker pool, waiting for in-flight tasks to finish.
    pub async fn close(&self) {
        self.inner.pool.close().await;
        let router = lock(&self.inner.router).take();
        if let Some(handle) = router {
            if let Err(e) = handle.await {
                error!(error = %e, "result router exited abnormally");
            }
        }
    }

    async fn run_pooled(&self, cancel: &CancellationToken) -> Result<()> {
        while !cancel.is_cancelled() {
            match self.fetch().await {
                Ok(Some(result)) => self.post(result).await,
                Ok(None) => {}
                Err(Error::PoolClosed) => return Err(Error::PoolClosed),
                Err(e) => self.recover(e, cancel).await,
            }
        }
        Ok(())
    }

    async fn run_bounded(&self, cancel: &CancellationToken) {
        let limit = self.inner.concurrency;
        let permits = Arc::new(Semaphore::new(limit));

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.cycle_inline(&cancel).await;
            });
        }

        // Every permit back means every spawned cycle has finished.
        let all = u32::try_from(limit).unwrap_or(u32::MAX);
        let _ = permits.acquire_many(all).await;
    }

    async fn run_pipelined(&self, cancel: &CancellationToken) -> Result<()> {
        let mut publishers = JoinSet::new();
        let mut outcome = Ok(());

        while !cancel.is_cancelled() {
            let task = match self.next_task().await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    self.recover(e, cancel).await;
                    continue;
                }
            };
            let (seq, waiter) = match self.submit(task).await {
                Ok(submitted) => submitted,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };

            let this = self.clone();
            publishers.spawn(async move { this.publish_when_done(seq, waiter).await });
            while let Some(joined) = publishers.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "publisher task failed");
                }
            }
        }

        // Closing drains the pool, which resolves every outstanding waiter.
        self.close().await;
        while let Some(joined) = publishers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "publisher task failed");
            }
        }
        outcome
    }

    async fn publish_when_done(
        &self,
        seq: u64,
        waiter: oneshot::Receiver<std::result::Result<R, HandlerError>>,
    ) {
        let span = start_task_span("fetch", &self.inner.key, seq);
        async {
            match waiter.await {
                Ok(Ok(output)) => {
                    record_outcome(&span, "ok");
                    self.post(output).await;
                }
                Ok(Err(e)) => {
                    record_outcome(&span, "handler_error");
                    warn!(key = %self.inner.key, seq, error = %format!("{e:#}"), "handler failed");
                }
                Err(_) => {
                    record_outcome(&span, "dropped");
                    warn!(key = %self.inner.key, seq, "pool closed before task finished");
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// One cycle without the pool, used by [`FetchMode::Semaphore`].
    async fn cycle_inline(&self, cancel: &CancellationToken) {
        let task = match self.next_task().await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                self.recover(e, cancel).await;
                return;
            }
        };

        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let span = start_task_span("fetch", &self.inner.key, seq);
        async {
            match (self.inner.handler)(task).await {
                Ok(output) => {
                    record_outcome(&span, "ok");
                    self.post(output).await;
                }
                Err(e) => {
                    record_outcome(&span, "handler_error");
                    warn!(key = %self.inner.key, error = %format!("{e:#}"), "handler failed");
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Log a failed fetch. Bad items are skipped at once; store failures
    /// back off so a broken store is not hammered.
    async fn recover(&self, e: Error, cancel: &CancellationToken) {
        warn!(key = %self.inner.key, error = %e, "fetch failed");
        if !e.is_item_error() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.inner.backoff) => {}
            }
        }
    }

    /// Pop and decode the next task; `Ok(None)` after a backoff if empty.
    async fn next_task(&self) -> Result<Option<T>> {
        let Some(item) = self.inner.store.pop(&self.inner.task_queue).await? else {
            tokio::time::sleep(self.inner.backoff).await;
            return Ok(None);
        };
        serde_json::from_slice(&item).map(Some).map_err(|e| {
            metrics::record_decode_failure(&self.inner.key);
            Error::Decode(e)
        })
    }

    /// Hand a task to the pool and return the receiver its result will
    /// be routed to.
    async fn submit(
        &self,
        task: T,
    ) -> Result<(u64, oneshot::Receiver<std::result::Result<R, HandlerError>>)> {
        self.ensure_started();

        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(seq, tx);

        if let Err(e) = self.inner.pool.dispatch(Tagged { seq, task }).await {
            lock(&self.inner.pending).remove(&seq);
            return Err(e);
        }
        Ok((seq, rx))
    }

    /// Start the pool and the task that routes its results to waiters.
    fn ensure_started(&self) {
        let mut router = lock(&self.inner.router);
        if router.is_some() || self.inner.pool.is_closed() {
            return;
        }
        self.inner.pool.start();
        let results = self.inner.pool.results();
        let pending = Arc::clone(&self.inner.pending);
        *router = Some(tokio::spawn(route_results(results, pending)));
    }
}

async fn route_results<T, R>(results: ResultStream<Tagged<T>, R>, pending: Arc<Pending<R>>) {
    while let Some(item) = results.next().await {
        let seq = item.task.seq;
        let waiter = lock(&pending).remove(&seq);
        match waiter {
            Some(tx) => {
                let _ = tx.send(item.result);
            }
            None => warn!(seq, "no caller waiting for result, dropping it"),
        }
    }
    // Stream is over; any waiter still registered will never be answered.
    lock(&pending).clear();
}

/// Wrap a handler so every call is timed and counted under `key`.
fn instrumented<T, R>(handler: HandlerFn<T, R>, key: String) -> HandlerFn<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    Arc::new(move |task| -> HandlerFuture<R> {
        let call = handler(task);
        let key = key.clone();
        Box::pin(async move {
            let started = Instant::now();
            let result = call.await;
            metrics::record_processed(
                &key,
                result.is_ok(),
                started.elapsed().as_secs_f64() * 1000.0,
            );
            result
        })
    })
}

/// Largest concurrency a fetcher accepts: the semaphore's permit limit,
/// capped so all permits can be reclaimed in one `acquire_many`.
pub fn max_concurrency() -> usize {
    Semaphore::MAX_PERMITS.min(u32::MAX as usize)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct FetcherBuilder<T, R> {
    store: Option<Arc<dyn QueueStore>>,
    name: Option<String>,
    key: Option<String>,
    handler: Option<HandlerFn<T, R>>,
    concurrency: usize,
    backoff: Duration,
    mode: FetchMode,
}

impl<T, R> Default for FetcherBuilder<T, R> {
    fn default() -> Self {
        Self {
            store: None,
            name: None,
            key: None,
            handler: None,
            concurrency: DEFAULT_CONCURRENCY,
            backoff: DEFAULT_BACKOFF,
            mode: FetchMode::default(),
        }
    }
}

impl<T, R> FetcherBuilder<T, R>
where
    T: DeserializeOwned + Clone + Send + 'static,
    R: Serialize + Send + 'static,
{
    /// Queue store shared with producers and consumers. Required.
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Queue namespace. Defaults to [`DEFAULT_NAME`](crate::model::DEFAULT_NAME).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Queue key. Required.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Handler run on every decoded task. Required.
    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        self.handler = Some(boxed_handler(handler));
        self
    }

    /// Worker count (or in-flight cycle limit). 0 means the default of 8;
    /// more than [`max_concurrency`] is rejected by `build`.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sleep after a poll finds the task queue empty.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn mode(mut self, mode: FetchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> Result<Fetcher<T, R>> {
        let store = self
            .store
            .ok_or_else(|| Error::Config("fetcher needs a queue store".to_string()))?;
        let key = self
            .key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::Config("fetcher key is empty".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| Error::Config("fetcher needs a handler".to_string()))?;
        let name = resolve_name(self.name);
        let concurrency = match self.concurrency {
            0 => DEFAULT_CONCURRENCY,
            n if n > max_concurrency() => {
                return Err(Error::Config(format!(
                    "fetcher concurrency {n} exceeds the limit of {}",
                    max_concurrency()
                )));
            }
            n => n,
        };

        let handler = instrumented(handler, key.clone());
        let task_handler = Arc::clone(&handler);
        let pool = Pool::with_handler(
            Arc::new(move |tagged: Tagged<T>| -> HandlerFuture<R> { task_handler(tagged.task) }),
            concurrency,
        );

        Ok(Fetcher {
            inner: Arc::new(Inner {
                store,
                task_queue: task_queue(&name, &key),
                raw_queue: raw_queue(&name, &key),
                key,
                handler,
                concurrency,
                backoff: self.backoff,
                mode: self.mode,
                pool,
                pending: Arc::new(Mutex::new(HashMap::new())),
                seq: AtomicU64::new(0),
                router: Mutex::new(None),
            }),
        })
    }
}

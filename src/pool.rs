//! Bounded worker pool.
//!
//! A fixed set of tokio tasks drains a bounded task channel, runs the
//! handler on each task and emits one [`WorkItem`] per task on a bounded
//! result channel. Both channels hold `concurrency` items, so `dispatch`
//! applies backpressure once the workers and the task buffer are busy.
//!
//! Results come back in completion order, not dispatch order. Handler
//! errors are carried inside the work item; the pool never retries.
//!
//! Close protocol: drop the task intake, join every worker, and only then
//! drop the last result sender. A worker exits only when the task channel
//! reports closed-and-empty, so every task accepted by `dispatch` is run
//! before close returns.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, HandlerError, Result};

/// Boxed future returned by a handler.
pub type HandlerFuture<R> =
    Pin<Box<dyn Future<Output = std::result::Result<R, HandlerError>> + Send>>;

/// Type-erased handler shared by every worker.
pub(crate) type HandlerFn<T, R> = Arc<dyn Fn(T) -> HandlerFuture<R> + Send + Sync>;

pub(crate) fn boxed_handler<T, R, F, Fut>(handler: F) -> HandlerFn<T, R>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
{
    Arc::new(move |task| -> HandlerFuture<R> { Box::pin(handler(task)) })
}

/// Outcome of one task: the task itself plus what the handler returned.
#[derive(Debug)]
pub struct WorkItem<T, R> {
    pub task: T,
    pub result: std::result::Result<R, HandlerError>,
}

impl<T, R> WorkItem<T, R> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Consumer side of the pool's result channel.
///
/// Cloneable; clones share the same channel, so each work item is seen by
/// exactly one of them.
pub struct ResultStream<T, R> {
    rx: Arc<AsyncMutex<mpsc::Receiver<WorkItem<T, R>>>>,
}

impl<T, R> Clone for ResultStream<T, R> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T, R> ResultStream<T, R> {
    /// Next completed work item, or `None` once the pool is closed and
    /// every result has been taken.
    pub async fn next(&self) -> Option<WorkItem<T, R>> {
        self.rx.lock().await.recv().await
    }
}

pub struct Pool<T, R> {
    handler: HandlerFn<T, R>,
    concurrency: usize,
    task_tx: Mutex<Option<mpsc::Sender<T>>>,
    task_rx: Arc<AsyncMutex<mpsc::Receiver<T>>>,
    result_tx: Mutex<Option<mpsc::Sender<WorkItem<T, R>>>>,
    result_rx: Arc<AsyncMutex<mpsc::Receiver<WorkItem<T, R>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl<T, R> Pool<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Build a pool with `concurrency` workers. Nothing runs until
    /// [`start`](Self::start). A concurrency of 0 is treated as 1; values
    /// above the channel limit are capped.
    pub fn new<F, Fut>(handler: F, concurrency: usize) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        Self::with_handler(boxed_handler(handler), concurrency)
    }

    pub(crate) fn with_handler(handler: HandlerFn<T, R>, concurrency: usize) -> Self {
        let concurrency = concurrency.clamp(1, Semaphore::MAX_PERMITS);
        let (task_tx, task_rx) = mpsc::channel(concurrency);
        let (result_tx, result_rx) = mpsc::channel(concurrency);
        Self {
            handler,
            concurrency,
            task_tx: Mutex::new(Some(task_tx)),
            task_rx: Arc::new(AsyncMutex::new(task_rx)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Arc::new(AsyncMutex::new(result_rx)),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn the workers. Must be called from within a tokio runtime.
    ///
    /// Only the first call spawns; later calls (and calls after close) are
    /// logged no-ops, so the pool never runs more than `concurrency` workers.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("worker pool already started");
            return;
        }
        let Some(results) = lock(&self.result_tx).clone() else {
            warn!("worker pool started after close, ignoring");
            return;
        };

        let mut workers = lock(&self.workers);
        for id in 0..self.concurrency {
            let worker = Worker {
                id,
                handler: Arc::clone(&self.handler),
                tasks: Arc::clone(&self.task_rx),
                results: results.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        info!(workers = self.concurrency, "worker pool started");
    }

    /// Queue a task for the workers.
    ///
    /// Waits while the task buffer is full. Fails with
    /// [`Error::PoolClosed`] once [`close`](Self::close) has begun.
    pub async fn dispatch(&self, task: T) -> Result<()> {
        let tx = lock(&self.task_tx).clone().ok_or(Error::PoolClosed)?;
        tx.send(task).await.map_err(|_| Error::PoolClosed)
    }

    /// Handle on the result channel.
    pub fn results(&self) -> ResultStream<T, R> {
        ResultStream {
            rx: Arc::clone(&self.result_rx),
        }
    }

    /// Stop accepting tasks, wait for every worker to finish, then end the
    /// result stream.
    ///
    /// Workers block while the result channel is full, so someone must keep
    /// reading [`results`](Self::results) while this runs. Safe to call
    /// more than once.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        drop(lock(&self.task_tx).take());

        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "worker exited abnormally");
            }
        }

        if lock(&self.result_tx).take().is_some() {
            info!(workers = self.concurrency, "worker pool closed");
        }
    }
}

struct Worker<T, R> {
    id: usize,
    handler: HandlerFn<T, R>,
    tasks: Arc<AsyncMutex<mpsc::Receiver<T>>>,
    results: mpsc::Sender<WorkItem<T, R>>,
}

impl<T, R> Worker<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    async fn run(self) {
        // `None` only once every sender is gone and the buffer is empty.
        while let Some(task) = next_task(&self.tasks).await {
            let result = (self.handler)(task.clone()).await;
            if self.results.send(WorkItem { task, result }).await.is_err() {
                break;
            }
        }
        debug!(worker = self.id, "worker stopped");
    }
}

async fn next_task<T>(tasks: &AsyncMutex<mpsc::Receiver<T>>) -> Option<T> {
    tasks.lock().await.recv().await
}

pub(crate) fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Integration tests for the bounded worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use gazer_rs::Error;
use gazer_rs::pool::{Pool, WorkItem};

fn reverse(input: String) -> String {
    input.chars().rev().collect()
}

fn reverse_pool(concurrency: usize) -> Pool<String, String> {
    Pool::new(
        |input: String| async move { Ok::<_, anyhow::Error>(reverse(input)) },
        concurrency,
    )
}

/// Drain the result stream on a background task until the pool closes.
fn collect_results(
    pool: &Pool<String, String>,
) -> tokio::task::JoinHandle<Vec<WorkItem<String, String>>> {
    let results = pool.results();
    tokio::spawn(async move {
        let mut items = Vec::new();
        while let Some(item) = results.next().await {
            items.push(item);
        }
        items
    })
}

// ---------------------------------------------------------------------------
// Basic dispatch / results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_worker_reverses_string() {
    let pool = reverse_pool(1);
    pool.start();

    pool.dispatch("abc".to_string()).await.unwrap();
    let item = pool.results().next().await.expect("one result");

    assert_eq!(item.task, "abc");
    assert_eq!(item.result.unwrap(), "cba");
    pool.close().await;
}

#[tokio::test]
async fn handler_error_is_carried_in_work_item() {
    let pool: Pool<String, String> = Pool::new(
        |input: String| async move {
            if input == "bad" {
                anyhow::bail!("refusing {input}");
            }
            Ok(input)
        },
        2,
    );
    pool.start();

    pool.dispatch("bad".to_string()).await.unwrap();
    let item = pool.results().next().await.unwrap();

    assert_eq!(item.task, "bad");
    assert!(!item.is_ok());
    let err = item.result.unwrap_err();
    assert!(err.to_string().contains("refusing bad"));
    pool.close().await;
}

#[tokio::test]
async fn every_dispatched_task_yields_one_result() {
    let pool = reverse_pool(4);
    pool.start();
    let collector = collect_results(&pool);

    for i in 0..100 {
        pool.dispatch(format!("task-{i}")).await.unwrap();
    }
    pool.close().await;

    let items = collector.await.unwrap();
    assert_eq!(items.len(), 100);

    let mut tasks: Vec<_> = items.iter().map(|item| item.task.clone()).collect();
    tasks.sort();
    tasks.dedup();
    assert_eq!(tasks.len(), 100, "each task reported exactly once");
    for item in &items {
        assert_eq!(item.result.as_ref().unwrap(), &reverse(item.task.clone()));
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_waits_for_in_flight_handlers() {
    let delay = Duration::from_millis(200);
    let pool: Pool<u32, u32> = Pool::new(
        move |n: u32| async move {
            tokio::time::sleep(delay).await;
            Ok(n)
        },
        2,
    );
    pool.start();
    let results = pool.results();
    let collector = tokio::spawn(async move {
        let mut count = 0;
        while results.next().await.is_some() {
            count += 1;
        }
        count
    });

    let started = Instant::now();
    pool.dispatch(1).await.unwrap();
    pool.close().await;

    assert!(
        started.elapsed() >= delay,
        "close returned after {:?}, before the handler finished",
        started.elapsed()
    );
    assert_eq!(collector.await.unwrap(), 1);
}

#[tokio::test]
async fn dispatch_after_close_fails() {
    let pool = reverse_pool(1);
    pool.start();
    pool.close().await;

    assert!(pool.is_closed());
    let err = pool.dispatch("late".to_string()).await.unwrap_err();
    assert!(matches!(err, Error::PoolClosed));
}

#[tokio::test]
async fn result_stream_ends_after_close() {
    let pool = reverse_pool(2);
    pool.start();
    pool.close().await;

    assert!(pool.results().next().await.is_none());
}

#[tokio::test]
async fn close_without_start_returns() {
    let pool = reverse_pool(3);
    tokio::time::timeout(Duration::from_secs(1), pool.close())
        .await
        .expect("close should not hang on an idle pool");
}

#[tokio::test]
async fn starting_twice_does_not_add_workers() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());
    let pool: Pool<u32, u32> = Pool::new(
        move |n: u32| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(n)
            }
        },
        2,
    );
    pool.start();
    pool.start();

    let results = pool.results();
    let collector = tokio::spawn(async move { while results.next().await.is_some() {} });
    for i in 0..10 {
        pool.dispatch(i).await.unwrap();
    }
    pool.close().await;
    collector.await.unwrap();

    assert_eq!(pool.concurrency(), 2);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatch_blocks_when_task_buffer_is_full() {
    let pool = reverse_pool(1);

    // Not started: the single buffer slot takes the first task...
    tokio::time::timeout(Duration::from_millis(100), pool.dispatch("a".to_string()))
        .await
        .expect("first dispatch fits the buffer")
        .unwrap();

    // ...and the second has nowhere to go.
    let blocked =
        tokio::time::timeout(Duration::from_millis(100), pool.dispatch("b".to_string())).await;
    assert!(blocked.is_err(), "second dispatch should block");

    // A worker taking "a" frees the slot.
    pool.start();
    tokio::time::timeout(Duration::from_secs(1), pool.dispatch("c".to_string()))
        .await
        .expect("dispatch unblocks once a worker consumes a task")
        .unwrap();

    let results = pool.results();
    let first = results.next().await.unwrap();
    let second = results.next().await.unwrap();
    assert_eq!(first.task, "a");
    assert_eq!(second.task, "c");
    pool.close().await;
}

#[tokio::test]
async fn zero_concurrency_is_treated_as_one() {
    let pool = reverse_pool(0);
    assert_eq!(pool.concurrency(), 1);
}

#[tokio::test]
async fn close_drains_a_full_buffer_before_workers_exit() {
    let pool: Pool<u32, u32> = Pool::new(|n: u32| async move { Ok(n) }, 512);
    for i in 0..512 {
        pool.dispatch(i).await.unwrap();
    }

    let results = pool.results();
    let collector = tokio::spawn(async move {
        let mut count = 0;
        while results.next().await.is_some() {
            count += 1;
        }
        count
    });
    pool.start();
    pool.close().await;

    assert_eq!(collector.await.unwrap(), 512, "every buffered task yields a result");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_drains_buffer_with_contended_workers() {
    let pool: Pool<u32, u32> = Pool::new(
        |n: u32| async move {
            tokio::task::yield_now().await;
            Ok(n)
        },
        64,
    );
    let results = pool.results();
    let collector = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(item) = results.next().await {
            seen.push(item.task);
        }
        seen
    });

    pool.start();
    for i in 0..1000 {
        pool.dispatch(i).await.unwrap();
    }
    pool.close().await;

    let mut seen = collector.await.unwrap();
    seen.sort();
    assert_eq!(seen, (0..1000).collect::<Vec<_>>());
}

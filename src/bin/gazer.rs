//! gazer CLI: operator interface to gazer queues.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use gazer_rs::config::Config;
use gazer_rs::config::secrets::ExposeSecret;
use gazer_rs::db::Db;
use gazer_rs::model::{Envelope, Task, raw_queue, task_queue};
use gazer_rs::store::QueueStore;
use gazer_rs::telemetry::{TelemetryConfig, init_telemetry};
use gazer_rs::{Consumer, FetchMode, Fetcher, Tasker};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "gazer", about = "Pull-based task pipelines over shared queues")]
struct Cli {
    /// Queue namespace (overrides GAZER_NAME)
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push a task onto a task queue
    Push {
        /// Queue key
        key: String,
        /// JSON parameters
        params: String,
        /// Push to the head of the queue instead of the tail
        #[arg(long)]
        front: bool,
    },
    /// Show task and raw queue lengths for a key
    Len {
        /// Queue key
        key: String,
    },
    /// Move tasks to the raw queue unchanged until interrupted
    Relay {
        /// Queue key
        key: String,
        /// Worker count (overrides GAZER_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Dispatch without waiting for each result
        #[arg(long)]
        pipelined: bool,
    },
    /// Print envelopes from a raw queue until interrupted
    Tail {
        /// Queue key
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let name = cli.name.unwrap_or_else(|| config.name.clone());
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let store: Arc<dyn QueueStore> = Arc::new(db);

    match cli.command {
        Command::Push { key, params, front } => cmd_push(store, name, key, params, front).await,
        Command::Len { key } => cmd_len(store.as_ref(), &name, &key).await,
        Command::Relay {
            key,
            concurrency,
            pipelined,
        } => {
            let _guard = init_telemetry(telemetry_config(&config))?;
            let concurrency = concurrency.unwrap_or(config.concurrency);
            cmd_relay(store, &config, name, key, concurrency, pipelined).await
        }
        Command::Tail { key } => {
            let _guard = init_telemetry(telemetry_config(&config))?;
            cmd_tail(store, &config, name, key).await
        }
    }
}

fn telemetry_config(config: &Config) -> TelemetryConfig {
    TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "gazer".to_string(),
        log_level: config.log_level.clone(),
    }
}

/// Cancel the returned token on Ctrl-C or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        trigger.cancel();
    });
    cancel
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}

async fn cmd_push(
    store: Arc<dyn QueueStore>,
    name: String,
    key: String,
    params: String,
    front: bool,
) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(&params)?;
    let tasker = Tasker::new(store, Some(name));
    let task = Task::new(key, params);

    if front {
        tasker.push_task_front(&task).await?;
    } else {
        tasker.push_task(&task).await?;
    }
    println!(
        "Pushed to {} ({})",
        task_queue(tasker.name(), &task.key),
        if front { "head" } else { "tail" }
    );
    Ok(())
}

async fn cmd_len(store: &dyn QueueStore, name: &str, key: &str) -> anyhow::Result<()> {
    let tasks = task_queue(name, key);
    let raws = raw_queue(name, key);
    println!("{:<40}  {}", tasks, store.len(&tasks).await?);
    println!("{:<40}  {}", raws, store.len(&raws).await?);
    Ok(())
}

async fn cmd_relay(
    store: Arc<dyn QueueStore>,
    config: &Config,
    name: String,
    key: String,
    concurrency: usize,
    pipelined: bool,
) -> anyhow::Result<()> {
    let fetcher = Fetcher::<Value, Value>::builder()
        .store(store)
        .name(name)
        .key(key)
        .concurrency(concurrency)
        .backoff(config.backoff)
        .mode(if pipelined {
            FetchMode::Pipelined
        } else {
            FetchMode::Pooled
        })
        .handler(|params: Value| async move { Ok(params) })
        .build()?;

    fetcher.run(shutdown_token()).await?;
    Ok(())
}

async fn cmd_tail(
    store: Arc<dyn QueueStore>,
    config: &Config,
    name: String,
    key: String,
) -> anyhow::Result<()> {
    let consumer = Consumer::<Value>::builder()
        .store(store)
        .name(name)
        .key(key)
        .backoff(config.backoff)
        .handler(|envelope: Envelope<Value>| async move {
            println!("{}", serde_json::to_string(&envelope)?);
            Ok::<(), anyhow::Error>(())
        })
        .build()?;

    consumer.run(shutdown_token()).await;
    Ok(())
}

// Main entrypoint for the streamcore service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use streamcore::cache::{Cache, CacheOptions};
use streamcore::config::{Config, ConfigTrait};
use streamcore::dedlog;
use streamcore::queue::{OverflowStore, Queue, QueueOptions};
use streamcore::shutdown::GracefulShutdown;

const CONFIG_PATH: &str = "cfg/streamcore.cfg.yaml";
const CONFIG_PATH_LOCAL: &str = "cfg/streamcore.cfg.local.yaml";

/// streamcore - resilient job queue and adaptive cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Custom config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    cfg: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the queue and cache, feeding jobs from NDJSON on stdin, until ctrl-c
    Serve,
    /// Prints overflow file record counts as JSON
    Inspect,
}

/// One stdin line in `serve` mode.
#[derive(Debug, Deserialize)]
struct Submission {
    #[serde(default)]
    priority: i32,
    data: serde_json::Value,
    /// Submissions repeating a key within the cache TTL are dropped.
    #[serde(default)]
    dedupe_key: Option<String>,
}

/// Loads the configuration struct from YAML file.
/// Tries local config first, then falls back to default config.
fn load_cfg(path: Option<PathBuf>) -> Result<Config> {
    if let Some(custom_path) = path {
        return Config::load(&custom_path)
            .with_context(|| format!("failed to load custom config from {:?}", custom_path));
    }

    match Config::load(PathBuf::from(CONFIG_PATH_LOCAL)) {
        Ok(cfg) => Ok(cfg),
        Err(_) => Config::load(PathBuf::from(CONFIG_PATH))
            .with_context(|| format!("failed to load config from {}", CONFIG_PATH)),
    }
}

/// Configures structured logging based on configuration. Logs go to stderr so
/// command output on stdout stays machine readable.
fn configure_logger(cfg: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_level = cfg
        .logs()
        .and_then(|logs| logs.level.as_deref())
        .unwrap_or("info");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if cfg.is_prod() {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let cfg = load_cfg(args.cfg)?;
    configure_logger(&cfg);

    match args.command {
        Command::Inspect => inspect(&cfg).await,
        Command::Serve => serve(cfg).await,
    }
}

async fn inspect(cfg: &Config) -> Result<()> {
    let opts = QueueOptions::from_config(cfg)
        .overflow
        .context("overflow is not enabled in config")?;
    let path = opts.path.clone();

    let summary = OverflowStore::<serde_json::Value>::new(opts)
        .inspect()
        .await
        .with_context(|| format!("inspect overflow file {:?}", path))?;

    let out = serde_json::json!({
        "path": path,
        "records": summary.records,
        "malformed": summary.malformed,
        "bytes": summary.bytes,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn serve(cfg: Config) -> Result<()> {
    let shutdown_token = CancellationToken::new();

    let dedup_logger_token = shutdown_token.clone();
    tokio::task::spawn(async move {
        dedlog::start_dedup_logger(dedup_logger_token).await;
    });

    let mut graceful_shutdown = GracefulShutdown::new(shutdown_token.clone());
    graceful_shutdown.set_graceful_timeout(Duration::from_secs(30));

    let queue: Queue<serde_json::Value> = Queue::new(shutdown_token.clone(), QueueOptions::from_config(&cfg));
    queue.process(|payload| async move {
        info!(component = "processor", event = "processed", payload = %payload, "job processed");
        Ok(())
    });

    let cache: Cache = Cache::new(shutdown_token.clone(), CacheOptions::from_config(&cfg));

    graceful_shutdown.add(1);
    {
        let queue = queue.clone();
        let gs = graceful_shutdown.clone();
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            ingest(queue, cache, token).await;
            gs.done();
        });
    }

    info!(component = "main", event = "started", queue = %queue.name(), "streamcore is serving");

    let res = graceful_shutdown.await_shutdown().await;
    let status = queue.status();
    info!(
        component = "main",
        event = "stopped",
        queued = status.queued,
        processing = status.processing,
        delayed = status.delayed,
        completed = status.completed,
        failed = status.failed,
        "final queue status"
    );
    res
}

/// Reads NDJSON submissions from stdin until EOF or shutdown.
async fn ingest(queue: Queue<serde_json::Value>, cache: Cache, token: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(component = "ingest", event = "eof", "stdin closed, no more submissions");
                return;
            }
            Err(e) => {
                warn!(component = "ingest", event = "read_failed", err = %e, "stdin read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let sub: Submission = match serde_json::from_str(&line) {
            Ok(sub) => sub,
            Err(e) => {
                warn!(component = "ingest", event = "malformed", err = %e, "skipping malformed submission");
                continue;
            }
        };

        if let Some(key) = &sub.dedupe_key {
            let key = format!("dedupe:{key}");
            if cache.get(&key).await.is_some() {
                info!(component = "ingest", event = "duplicate", key = %key, "duplicate submission dropped");
                continue;
            }
            cache.set_with_tags(&key, serde_json::Value::Bool(true), None, &["dedupe"]).await;
        }

        match queue.add(sub.data, sub.priority).await {
            Some(id) => info!(component = "ingest", event = "queued", job_id = id, priority = sub.priority, "job queued"),
            None => warn!(component = "ingest", event = "rejected", priority = sub.priority, "job rejected, queue full"),
        }
    }
}

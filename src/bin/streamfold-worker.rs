use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use streamfold::{
    CheckpointStore, ConsumerGroupManager, Entry, EntryHandler, RedisBroker, Settings, StartId,
    StreamConsumer,
};
use tokio::io::AsyncWriteExt;

/// Longest time one `--exec` run may take before the entry is left pending.
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 2 * 60 * 60;

/// Consume one stream as a named member of its consumer group.
#[derive(Debug, Parser)]
#[command(name = "streamfold-worker", version, about)]
struct Cli {
    /// Consumer name. Defaults to `worker-<hostname>`.
    #[arg(long, value_name = "NAME")]
    consumer: Option<String>,

    /// JSON settings file.
    #[arg(long, value_name = "PATH", env = "STREAMFOLD_CONFIG")]
    config: Option<PathBuf>,

    /// Run this program for every entry, with the entry as JSON on stdin. The entry is
    /// acknowledged when it exits successfully.
    #[arg(long, value_name = "PROGRAM")]
    exec: Option<PathBuf>,

    /// Seconds an `--exec` run may take.
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_EXEC_TIMEOUT_SECS)]
    exec_timeout: u64,

    /// Only log and acknowledge entries.
    #[arg(long)]
    dry_run: bool,

    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR", env = "STREAMFOLD_METRICS_LISTEN")]
    metrics_listen: Option<std::net::SocketAddr>,
}

/// Handles entries by logging them, or by running an external program.
struct WorkerHandler {
    exec: Option<PathBuf>,
    timeout: Duration,
    dry_run: bool,
}

impl WorkerHandler {
    async fn run_program(&self, program: &Path, entry: &Entry) -> anyhow::Result<bool> {
        let input = serde_json::to_vec(entry)?;
        let mut child = tokio::process::Command::new(program)
            .stdin(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", program.display()))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores its input may exit before reading it.
            match stdin.write_all(&input).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                _ => {}
            }
        }
        let status = tokio::time::timeout(self.timeout, child.wait())
            .await
            .with_context(|| {
                format!("{} timed out after {:?}", program.display(), self.timeout)
            })??;
        if status.success() {
            Ok(true)
        } else {
            anyhow::bail!("{} exited with {status}", program.display())
        }
    }
}

#[async_trait]
impl EntryHandler for WorkerHandler {
    async fn handle(&mut self, entry: &Entry) -> anyhow::Result<bool> {
        tracing::info!(id = %entry.id, event_type = %entry.event_type, "Received entry");
        match &self.exec {
            Some(program) if !self.dry_run => self.run_program(program, entry).await,
            Some(program) => {
                tracing::info!(id = %entry.id, program = %program.display(), "[DRY RUN] Would run");
                Ok(true)
            }
            None => Ok(true),
        }
    }
}

fn default_consumer_name() -> String {
    let host = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| format!("pid{}", std::process::id()));
    format!("worker-{host}")
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    let consumer_name = cli.consumer.clone().unwrap_or_else(default_consumer_name);

    let redis = Arc::new(
        RedisBroker::connect(&settings.redis_url)
            .await
            .with_context(|| format!("failed to connect to {}", settings.redis_url))?,
    );
    tracing::info!(redis_url = %settings.redis_url, "Connected");

    if let Some(addr) = cli.metrics_listen {
        let handle = streamfold::metrics::ensure_recorder();
        let _metrics_task = streamfold::metrics::serve_metrics(handle, addr);
    }

    // Workers share one group that starts at the beginning of the stream.
    ConsumerGroupManager::new(redis.clone())
        .create_group(&settings.stream, &settings.group, StartId::Beginning)
        .await
        .context("failed to create consumer group")?;

    let checkpoints = CheckpointStore::new(redis.clone())
        .with_prefix(settings.key_prefix.clone())
        .with_ttl(Some(settings.checkpoint_ttl()));
    let config = settings.consumer_config(&consumer_name);
    let consumer = Arc::new(StreamConsumer::new(redis, checkpoints, config)?);

    let stopper = consumer.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown requested");
        stopper.close();
    });

    tracing::info!(
        consumer = %consumer_name,
        stream = %settings.stream,
        group = %settings.group,
        "Worker starting"
    );
    let handler = WorkerHandler {
        exec: cli.exec,
        timeout: Duration::from_secs(cli.exec_timeout),
        dry_run: cli.dry_run,
    };
    consumer.subscribe(handler).await?;
    tracing::info!(consumer = %consumer_name, "Worker stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!(error = %format!("{e:#}"), "streamfold-worker failed");
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

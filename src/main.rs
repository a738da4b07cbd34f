use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use streamfold::scaling::{ProcessLauncher, ScalingConfig, ScalingController};
use streamfold::{RedisBroker, Settings, StreamBroker, StreamMonitor};

/// Default size of a static pool when neither `--workers` nor `--auto-scale` is given.
const DEFAULT_STATIC_WORKERS: usize = 2;

/// Worker pool manager for a streamfold consumer group.
#[derive(Debug, Parser)]
#[command(name = "streamfold", version, about)]
struct Cli {
    /// Run a fixed pool of N workers, restarting any that exit.
    #[arg(long, value_name = "N", conflicts_with = "auto_scale")]
    workers: Option<usize>,

    /// Grow and shrink the pool from the group's pending count.
    #[arg(long)]
    auto_scale: bool,

    #[arg(long, value_name = "N")]
    min_workers: Option<usize>,

    #[arg(long, value_name = "N")]
    max_workers: Option<usize>,

    /// Scale up when pending > workers * this.
    #[arg(long, value_name = "RATIO")]
    scale_up_threshold: Option<f64>,

    /// Scale down when pending < workers * this.
    #[arg(long, value_name = "RATIO")]
    scale_down_threshold: Option<f64>,

    /// Seconds between two scaling actions.
    #[arg(long, value_name = "SECS")]
    scale_cooldown: Option<u64>,

    /// Seconds without pending entries before scaling down.
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Seconds between control loop ticks.
    #[arg(long, value_name = "SECS")]
    poll_interval: Option<u64>,

    /// Print pending count and configuration as JSON, then exit.
    #[arg(long)]
    status: bool,

    /// JSON settings file, also passed to every worker.
    #[arg(long, value_name = "PATH", env = "STREAMFOLD_CONFIG")]
    config: Option<PathBuf>,

    /// Worker executable. Defaults to `streamfold-worker` next to this binary.
    #[arg(long, value_name = "PATH")]
    worker_bin: Option<PathBuf>,

    /// Log scaling actions without starting or stopping processes.
    #[arg(long)]
    dry_run: bool,

    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR", env = "STREAMFOLD_METRICS_LISTEN")]
    metrics_listen: Option<SocketAddr>,
}

impl Cli {
    /// Overlay the scaling flags on `base`.
    fn scaling_config(&self, base: &ScalingConfig) -> ScalingConfig {
        let secs = std::time::Duration::from_secs;
        ScalingConfig {
            min_workers: self.min_workers.unwrap_or(base.min_workers),
            max_workers: self.max_workers.unwrap_or(base.max_workers),
            scale_up_threshold: self.scale_up_threshold.unwrap_or(base.scale_up_threshold),
            scale_down_threshold: self
                .scale_down_threshold
                .unwrap_or(base.scale_down_threshold),
            scale_cooldown: self.scale_cooldown.map(secs).unwrap_or(base.scale_cooldown),
            idle_timeout: self.idle_timeout.map(secs).unwrap_or(base.idle_timeout),
            poll_interval: self.poll_interval.map(secs).unwrap_or(base.poll_interval),
        }
    }

    /// Arguments every worker is started with, before `--consumer <name>`.
    fn worker_args(&self) -> Vec<String> {
        match &self.config {
            Some(path) => vec!["--config".into(), path.display().to_string()],
            None => Vec::new(),
        }
    }

    fn worker_program(&self) -> PathBuf {
        self.worker_bin
            .clone()
            .unwrap_or_else(|| default_worker_bin(std::env::current_exe().ok().as_deref()))
    }
}

/// `streamfold-worker` beside `exe` when it exists, otherwise looked up on `PATH`.
fn default_worker_bin(exe: Option<&Path>) -> PathBuf {
    const NAME: &str = "streamfold-worker";
    exe.and_then(Path::parent)
        .map(|dir| dir.join(NAME))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(NAME))
}

/// Initialize the global `tracing` subscriber from `RUST_LOG`, defaulting to `info`.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Waits for SIGINT, or SIGTERM on Unix.
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

async fn print_status(
    broker: Arc<dyn StreamBroker>,
    settings: &Settings,
    scaling: &ScalingConfig,
) {
    let monitor = StreamMonitor::new(broker);
    let backpressure = monitor
        .get_backpressure_metrics(&settings.stream, &settings.group)
        .await;
    let status = json!({
        "stream": settings.stream,
        "group": settings.group,
        "pending_count": backpressure.pending_count,
        "backpressure": backpressure,
        "scaling": scaling,
        "settings": settings,
    });
    match serde_json::to_string_pretty(&status) {
        Ok(text) => println!("{text}"),
        Err(e) => tracing::error!(error = %e, "Failed to render status"),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    let scaling = cli.scaling_config(&settings.scaling);
    scaling.validate().context("invalid scaling configuration")?;

    tracing::info!(stream = %settings.stream, group = %settings.group, "Consumer group");

    let broker: Arc<dyn StreamBroker> = Arc::new(
        RedisBroker::connect(&settings.redis_url)
            .await
            .with_context(|| format!("failed to connect to {}", settings.redis_url))?,
    );

    if cli.status {
        print_status(broker, &settings, &scaling).await;
        return Ok(());
    }

    if let Some(addr) = cli.metrics_listen {
        let handle = streamfold::metrics::ensure_recorder();
        let _metrics_task = streamfold::metrics::serve_metrics(handle, addr);
    }

    let program = cli.worker_program();
    tracing::info!(worker_bin = %program.display(), dry_run = cli.dry_run, "Worker executable");
    let launcher = ProcessLauncher::new(program, cli.worker_args());
    let mut controller = ScalingController::new(
        scaling,
        broker,
        settings.stream.clone(),
        settings.group.clone(),
        launcher,
    )?
    .with_dry_run(cli.dry_run);

    if cli.auto_scale {
        controller.run(shutdown_signal()).await;
    } else {
        let count = cli.workers.unwrap_or(DEFAULT_STATIC_WORKERS);
        controller.run_static(count, shutdown_signal()).await;
    }
    tracing::info!("Shutting down");
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!(error = %format!("{e:#}"), "streamfold failed");
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serial_test::serial;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("streamfold").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn scaling_flags_override_settings() {
        let cli = parse(&[
            "--auto-scale",
            "--min-workers",
            "2",
            "--max-workers",
            "8",
            "--scale-cooldown",
            "15",
            "--poll-interval",
            "3",
        ]);
        let scaling = cli.scaling_config(&ScalingConfig::default());
        assert_eq!(scaling.min_workers, 2);
        assert_eq!(scaling.max_workers, 8);
        assert_eq!(scaling.scale_cooldown, Duration::from_secs(15));
        assert_eq!(scaling.poll_interval, Duration::from_secs(3));
        assert_eq!(scaling.idle_timeout, Duration::from_secs(300));
        assert!(scaling.validate().is_ok());
    }

    #[test]
    fn invalid_flag_combination_fails_validation() {
        let cli = parse(&["--min-workers", "5", "--max-workers", "2"]);
        let scaling = cli.scaling_config(&ScalingConfig::default());
        assert!(scaling.validate().is_err());
    }

    #[test]
    fn workers_and_auto_scale_conflict() {
        let result = Cli::try_parse_from(["streamfold", "--workers", "3", "--auto-scale"]);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn config_path_is_passed_to_workers() {
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::remove_var("STREAMFOLD_CONFIG") };
        let cli = parse(&["--config", "/etc/streamfold.json", "--worker-bin", "/bin/w"]);
        assert_eq!(cli.worker_args(), vec!["--config", "/etc/streamfold.json"]);
        assert_eq!(cli.worker_program(), PathBuf::from("/bin/w"));

        let bare = parse(&[]);
        assert!(bare.worker_args().is_empty());
    }

    #[test]
    #[serial]
    fn metrics_listen_reads_environment() {
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::set_var("STREAMFOLD_METRICS_LISTEN", "127.0.0.1:9464") };
        let cli = parse(&["--status"]);
        unsafe { std::env::remove_var("STREAMFOLD_METRICS_LISTEN") };
        assert!(cli.status);
        assert_eq!(
            cli.metrics_listen,
            Some("127.0.0.1:9464".parse::<SocketAddr>().unwrap())
        );
    }

    #[test]
    fn default_worker_bin_prefers_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("streamfold");
        assert_eq!(
            default_worker_bin(Some(&exe)),
            PathBuf::from("streamfold-worker")
        );
        std::fs::write(dir.path().join("streamfold-worker"), b"").unwrap();
        assert_eq!(
            default_worker_bin(Some(&exe)),
            dir.path().join("streamfold-worker")
        );
        assert_eq!(default_worker_bin(None), PathBuf::from("streamfold-worker"));
    }

    #[test]
    fn init_tracing_does_not_panic() {
        init_tracing();
        init_tracing();
    }
}

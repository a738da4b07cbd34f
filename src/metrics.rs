//! Prometheus metrics for producers, consumers and the worker pool.
//!
//! Library code records through the small helper functions below, which go through the
//! `metrics` facade and are no-ops until a recorder is installed. Binaries call
//! [`install_recorder`] once and expose the snapshot with [`serve_metrics`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;

/// Error type for metrics installation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The global metrics recorder has already been installed.
    #[error("metrics recorder already installed")]
    AlreadyInstalled,
}

/// Cloneable handle to the installed Prometheus recorder.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    inner: Arc<PrometheusHandle>,
}

impl MetricsHandle {
    /// Render the current snapshot in Prometheus exposition format.
    pub fn render(&self) -> String {
        self.inner.render()
    }
}

static RECORDER_HANDLE: std::sync::OnceLock<MetricsHandle> = std::sync::OnceLock::new();

/// Install the global Prometheus recorder.
///
/// A second call in the same process returns [`MetricsError::AlreadyInstalled`]; use
/// [`get_installed_handle`] to reach the existing one.
pub fn install_recorder() -> Result<MetricsHandle, MetricsError> {
    let mut was_set = false;
    let handle = RECORDER_HANDLE.get_or_init(|| {
        was_set = true;
        let prom_handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("PrometheusBuilder::install_recorder should succeed on first call");
        MetricsHandle {
            inner: Arc::new(prom_handle),
        }
    });

    if was_set {
        Ok(handle.clone())
    } else {
        Err(MetricsError::AlreadyInstalled)
    }
}

/// The installed handle, if [`install_recorder`] has run.
pub fn get_installed_handle() -> Option<MetricsHandle> {
    RECORDER_HANDLE.get().cloned()
}

/// Install the recorder if needed and return its handle.
pub fn ensure_recorder() -> MetricsHandle {
    match install_recorder() {
        Ok(handle) => handle,
        Err(MetricsError::AlreadyInstalled) => get_installed_handle()
            .expect("recorder handle is set once install_recorder has run"),
    }
}

fn metrics_router(handle: MetricsHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move {
                (
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    h.render(),
                )
            }
        }),
    )
}

/// Serve `GET /metrics` on `addr` from a spawned task.
///
/// A bind failure is logged and the returned task completes immediately.
pub fn serve_metrics(handle: MetricsHandle, addr: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "Failed to bind metrics listener");
                return;
            }
        };
        run_server(handle, listener).await;
    })
}

/// Serve `GET /metrics` on an already-bound listener.
pub fn serve_metrics_on_listener(
    handle: MetricsHandle,
    listener: tokio::net::TcpListener,
) -> JoinHandle<()> {
    tokio::spawn(run_server(handle, listener))
}

async fn run_server(handle: MetricsHandle, listener: tokio::net::TcpListener) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!(addr = %addr, "Metrics server listening"),
        Err(e) => tracing::warn!(error = %e, "Metrics listener has no local address"),
    }
    if let Err(e) = axum::serve(listener, metrics_router(handle)).await {
        tracing::error!(error = %e, "Metrics server error");
    }
}

/// One entry appended by a producer.
pub fn record_published(stream: &str) {
    counter!("streamfold_published_total", "stream" => stream.to_string()).increment(1);
}

/// `n` entries acknowledged in `group`.
pub fn record_acked(stream: &str, group: &str, n: u64) {
    counter!(
        "streamfold_acked_total",
        "stream" => stream.to_string(),
        "group" => group.to_string()
    )
    .increment(n);
}

/// A handler returned an error; the entry stays pending.
pub fn record_handler_error(stream: &str, group: &str) {
    counter!(
        "streamfold_handler_errors_total",
        "stream" => stream.to_string(),
        "group" => group.to_string()
    )
    .increment(1);
}

/// `n` stale entries claimed from other consumers.
pub fn record_claimed(stream: &str, group: &str, n: u64) {
    counter!(
        "streamfold_claimed_total",
        "stream" => stream.to_string(),
        "group" => group.to_string()
    )
    .increment(n);
}

/// A checkpoint could not be read or written.
pub fn record_checkpoint_failure(stream: &str) {
    counter!("streamfold_checkpoint_failures_total", "stream" => stream.to_string()).increment(1);
}

/// Set the pending-entry gauge of `group` on `stream`.
///
/// # Arguments
///
/// * `stream` - Stream the group reads.
/// * `group` - Consumer group whose pending list was measured.
/// * `pending` - Entries delivered but not yet acknowledged.
pub fn set_pending(stream: &str, group: &str, pending: u64) {
    gauge!(
        "streamfold_pending_entries",
        "stream" => stream.to_string(),
        "group" => group.to_string()
    )
    .set(pending as f64);
}

/// Entries currently held by `stream`.
pub fn set_stream_length(stream: &str, length: u64) {
    gauge!("streamfold_stream_length", "stream" => stream.to_string()).set(length as f64);
}

/// Running workers in the pool.
pub fn set_workers(count: usize) {
    gauge!("streamfold_workers").set(count as f64);
}

/// One scaling decision, labelled `scale_up`, `scale_down` or `no_change`.
pub fn record_scaling_event(action: &'static str) {
    counter!("streamfold_scaling_events_total", "action" => action).increment(1);
}

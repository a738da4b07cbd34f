//! Backpressure and lag reporting.
//!
//! Everything here is read-only and infallible from the caller's point of view: broker
//! failures are logged and reported as zeroed or empty results, never as errors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::broker::StreamBroker;
use crate::error::Result;
use crate::types::StreamInfo;

/// Default idle time above which a group is unhealthy.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(30);
/// Default pending count above which a warning is attached.
pub const DEFAULT_PENDING_WARNING: u64 = 1000;
/// Default number of pending entries sampled for idle times and lags.
pub const DEFAULT_PENDING_SAMPLE: usize = 1000;

/// Health thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorThresholds {
    /// A pending entry idle longer than this makes the group unhealthy.
    pub max_idle: Duration,
    /// Pending count above which a warning is attached.
    pub pending_warning: u64,
    /// Pending entries inspected per call.
    pub pending_sample: usize,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            pending_warning: DEFAULT_PENDING_WARNING,
            pending_sample: DEFAULT_PENDING_SAMPLE,
        }
    }
}

/// Queue depth and staleness of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackpressureMetrics {
    /// Entries in the stream.
    pub stream_length: u64,
    /// Delivered but unacknowledged entries.
    pub pending_count: u64,
    /// Entries the group is behind by; equals `pending_count`.
    pub consumer_lag: u64,
    /// Largest idle time among sampled pending entries.
    pub max_idle_time_ms: u64,
    /// `false` when `max_idle_time_ms` exceeds the idle threshold or the lookup failed.
    pub is_healthy: bool,
    /// Human-readable explanation when something looks wrong.
    pub warning: Option<String>,
}

impl BackpressureMetrics {
    fn failed(reason: String) -> Self {
        Self {
            stream_length: 0,
            pending_count: 0,
            consumer_lag: 0,
            max_idle_time_ms: 0,
            is_healthy: false,
            warning: Some(reason),
        }
    }
}

/// Stream-level health and backpressure.
#[derive(Clone)]
pub struct StreamMonitor {
    broker: Arc<dyn StreamBroker>,
    thresholds: MonitorThresholds,
}

impl StreamMonitor {
    /// Monitor with default thresholds.
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self::with_thresholds(broker, MonitorThresholds::default())
    }

    /// Monitor with custom thresholds.
    pub fn with_thresholds(broker: Arc<dyn StreamBroker>, thresholds: MonitorThresholds) -> Self {
        Self { broker, thresholds }
    }

    /// Backpressure of `group` on `stream`. Also updates the depth gauges.
    pub async fn get_backpressure_metrics(&self, stream: &str, group: &str) -> BackpressureMetrics {
        match self.collect(stream, group).await {
            Ok(metrics) => {
                crate::metrics::set_stream_length(stream, metrics.stream_length);
                crate::metrics::set_pending(stream, group, metrics.pending_count);
                metrics
            }
            Err(err) => {
                tracing::error!(stream, group, error = %err, "failed to get backpressure metrics");
                BackpressureMetrics::failed(format!("Failed to get metrics: {err}"))
            }
        }
    }

    async fn collect(&self, stream: &str, group: &str) -> Result<BackpressureMetrics> {
        let stream_length = self.broker.stream_length(stream).await?;
        let pending_count = self.broker.pending_count(stream, group).await?;
        let max_idle_time_ms = if pending_count == 0 {
            0
        } else {
            self.broker
                .pending_range(stream, group, None, self.thresholds.pending_sample)
                .await?
                .iter()
                .map(|p| p.idle_ms)
                .max()
                .unwrap_or(0)
        };

        let is_healthy = max_idle_time_ms <= self.thresholds.max_idle.as_millis() as u64;
        let warning = if !is_healthy {
            Some(format!(
                "Consumer lag detected: max idle time {max_idle_time_ms}ms"
            ))
        } else if pending_count > self.thresholds.pending_warning {
            Some(format!("High pending count: {pending_count} messages"))
        } else {
            None
        };
        if let Some(warning) = &warning {
            tracing::warn!(stream, group, warning = %warning, "backpressure");
        }

        Ok(BackpressureMetrics {
            stream_length,
            pending_count,
            consumer_lag: pending_count,
            max_idle_time_ms,
            is_healthy,
            warning,
        })
    }

    /// Returns `true` if the stream exists and the broker answers.
    pub async fn check_stream_health(&self, stream: &str) -> bool {
        match self.broker.stream_exists(stream).await {
            Ok(exists) => exists,
            Err(err) => {
                tracing::warn!(stream, error = %err, "stream health check failed");
                false
            }
        }
    }

    /// Stream summary, or `None` when it is missing or the lookup fails.
    pub async fn get_stream_stats(&self, stream: &str) -> Option<StreamInfo> {
        match self.broker.stream_info(stream).await {
            Ok(info) => Some(info),
            Err(err) => {
                tracing::error!(stream, error = %err, "failed to get stream stats");
                None
            }
        }
    }
}

/// Per-consumer pending counts.
#[derive(Clone)]
pub struct LagMonitor {
    broker: Arc<dyn StreamBroker>,
    sample: usize,
}

impl LagMonitor {
    /// Lag monitor sampling up to 1000 pending entries per call.
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self {
            broker,
            sample: DEFAULT_PENDING_SAMPLE,
        }
    }

    /// Pending entries assigned to `consumer` (0 on failure).
    pub async fn get_consumer_lag(&self, stream: &str, group: &str, consumer: &str) -> usize {
        match self
            .broker
            .pending_range(stream, group, Some(consumer), self.sample)
            .await
        {
            Ok(pending) => pending.len(),
            Err(err) => {
                tracing::error!(stream, group, consumer, error = %err, "failed to get consumer lag");
                0
            }
        }
    }

    /// Pending entries per consumer (empty on failure).
    pub async fn get_all_consumer_lags(&self, stream: &str, group: &str) -> BTreeMap<String, usize> {
        let mut lags = BTreeMap::new();
        match self
            .broker
            .pending_range(stream, group, None, self.sample)
            .await
        {
            Ok(pending) => {
                for p in pending {
                    *lags.entry(p.consumer).or_insert(0) += 1;
                }
            }
            Err(err) => {
                tracing::error!(stream, group, error = %err, "failed to get consumer lags");
            }
        }
        lags
    }
}

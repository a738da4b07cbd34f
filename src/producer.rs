//! Stream lifecycle and event publishing.
//!
//! [`StreamManager`] creates, inspects, trims and deletes streams. [`StreamProducer`]
//! validates events and appends them to one stream with approximate length trimming.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::broker::{StreamBroker, TrimPolicy};
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::types::{
    EntryId, FIELD_EVENT_TYPE, FIELD_METADATA, FIELD_PAYLOAD, FIELD_TIMESTAMP, MAX_PAYLOAD_SIZE,
    Metadata, StreamInfo, validate_name,
};

/// Default retention window for [`StreamRetention`] (24 hours).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default producer trim length.
pub const DEFAULT_MAX_LENGTH: usize = 10_000;

/// Retention policy of a stream.
///
/// The broker has no time-based expiry of its own; [`StreamManager::enforce_retention`]
/// applies the policy on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRetention {
    /// Entries older than this are eligible for trimming.
    pub max_age: Duration,
    /// Keep at most roughly this many entries.
    pub max_length: Option<usize>,
}

impl Default for StreamRetention {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_RETENTION,
            max_length: None,
        }
    }
}

/// Creates, inspects and deletes streams.
#[derive(Clone)]
pub struct StreamManager {
    broker: Arc<dyn StreamBroker>,
}

impl StreamManager {
    /// Create a manager over `broker`.
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self { broker }
    }

    /// Create an empty stream.
    ///
    /// Returns `Ok(false)` if the stream already exists. When the policy carries a
    /// `max_length`, the stream is trimmed to it right away.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] if `name` is not `^[A-Za-z0-9_-]+$`.
    pub async fn create_stream(&self, name: &str, retention: &StreamRetention) -> Result<bool> {
        validate_name("stream", name)?;
        let created = self.broker.create_stream(name).await?;
        if let Some(max) = retention.max_length {
            self.broker.trim(name, TrimPolicy::MaxLen(max)).await?;
        }
        if created {
            tracing::info!(stream = name, "created stream");
        }
        Ok(created)
    }

    /// Trim entries older than `max_age` and beyond `max_length`.
    ///
    /// Returns the number of entries removed. Trimming is approximate on Redis.
    pub async fn enforce_retention(&self, name: &str, retention: &StreamRetention) -> Result<u64> {
        validate_name("stream", name)?;
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let cutoff = now_ms.saturating_sub(retention.max_age.as_millis() as u64);
        let mut removed = self
            .broker
            .trim(name, TrimPolicy::MinId(EntryId::new(cutoff, 0)))
            .await?;
        if let Some(max) = retention.max_length {
            removed += self.broker.trim(name, TrimPolicy::MaxLen(max)).await?;
        }
        if removed > 0 {
            tracing::debug!(stream = name, removed, "retention trimmed entries");
        }
        Ok(removed)
    }

    /// Delete a stream with its entries and groups. Returns `false` if it did not exist.
    pub async fn delete_stream(&self, name: &str) -> Result<bool> {
        let deleted = self.broker.delete_stream(name).await?;
        if deleted {
            tracing::info!(stream = name, "deleted stream");
        }
        Ok(deleted)
    }

    /// Returns `true` if the stream exists.
    pub async fn stream_exists(&self, name: &str) -> Result<bool> {
        self.broker.stream_exists(name).await
    }

    /// Number of entries, or 0 when the broker call fails.
    pub async fn stream_length(&self, name: &str) -> u64 {
        match self.broker.stream_length(name).await {
            Ok(len) => len,
            Err(err) => {
                tracing::warn!(stream = name, error = %err, "failed to read stream length");
                0
            }
        }
    }

    /// Stream summary. `StreamNotFound` when absent.
    pub async fn get_stream_info(&self, name: &str) -> Result<StreamInfo> {
        self.broker.stream_info(name).await
    }
}

/// Producer settings.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Target stream.
    pub stream: String,
    /// Approximate trim bound applied on every append. `None` never trims.
    pub max_length: Option<usize>,
    /// Create the stream when it is missing instead of failing.
    pub auto_create_stream: bool,
    /// Retry policy for transient broker failures.
    pub retry: RetryPolicy,
}

impl ProducerConfig {
    /// Defaults for `stream`: trim at 10 000 entries, auto-create on.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            max_length: Some(DEFAULT_MAX_LENGTH),
            auto_create_stream: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// One event of a batch publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEvent {
    /// Event type tag.
    pub event_type: String,
    /// Structured payload.
    pub payload: Value,
    /// Optional metadata.
    pub metadata: Option<Metadata>,
}

impl OutgoingEvent {
    /// Event without metadata.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: None,
        }
    }
}

/// Appends events to a single stream.
pub struct StreamProducer {
    broker: Arc<dyn StreamBroker>,
    config: ProducerConfig,
}

impl StreamProducer {
    /// Build a producer, creating the stream when `auto_create_stream` is set.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for an invalid stream name; broker errors from stream creation.
    pub async fn new(broker: Arc<dyn StreamBroker>, config: ProducerConfig) -> Result<Self> {
        validate_name("stream", &config.stream)?;
        if config.auto_create_stream {
            StreamManager::new(broker.clone())
                .create_stream(
                    &config.stream,
                    &StreamRetention {
                        max_length: config.max_length,
                        ..StreamRetention::default()
                    },
                )
                .await?;
        }
        Ok(Self { broker, config })
    }

    /// Stream this producer appends to.
    pub fn stream(&self) -> &str {
        &self.config.stream
    }

    /// Publish one event and return its broker-assigned id.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `event_type` is empty.
    /// - [`Error::PayloadTooLarge`] if the serialized payload exceeds 1 MiB.
    /// - [`Error::StreamNotFound`] if the stream is missing and auto-creation is off.
    /// - Broker errors once retries are exhausted.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: &Value,
        metadata: Option<&Metadata>,
    ) -> Result<EntryId> {
        let fields = encode_fields(event_type, payload, metadata)?;
        let stream = self.config.stream.as_str();
        let id = retry_with_backoff(&self.config.retry, "publish", || {
            self.broker.append(
                stream,
                &fields,
                self.config.max_length,
                self.config.auto_create_stream,
            )
        })
        .await?;
        crate::metrics::record_published(stream);
        tracing::debug!(stream, event_type, id = %id, "published event");
        Ok(id)
    }

    /// Publish events in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// [`Error::BatchFailed`] with the ids published before the failing event.
    pub async fn publish_batch(&self, events: &[OutgoingEvent]) -> Result<Vec<EntryId>> {
        let mut published = Vec::with_capacity(events.len());
        for event in events {
            match self
                .publish(&event.event_type, &event.payload, event.metadata.as_ref())
                .await
            {
                Ok(id) => published.push(id),
                Err(err) => {
                    tracing::warn!(
                        stream = %self.config.stream,
                        published = published.len(),
                        error = %err,
                        "batch publish stopped"
                    );
                    return Err(Error::BatchFailed {
                        published,
                        source: Box::new(err),
                    });
                }
            }
        }
        Ok(published)
    }
}

/// Validate and encode an event into broker fields.
fn encode_fields(
    event_type: &str,
    payload: &Value,
    metadata: Option<&Metadata>,
) -> Result<Vec<(String, String)>> {
    if event_type.is_empty() {
        return Err(Error::Validation(
            "event_type must be a non-empty string".into(),
        ));
    }
    let payload_json = serde_json::to_string(payload)?;
    if payload_json.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge {
            size: payload_json.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let metadata_json = match metadata {
        Some(m) => serde_json::to_string(m)?,
        None => "{}".to_string(),
    };
    Ok(vec![
        (FIELD_EVENT_TYPE.to_string(), event_type.to_string()),
        (FIELD_PAYLOAD.to_string(), payload_json),
        (
            FIELD_TIMESTAMP.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        ),
        (FIELD_METADATA.to_string(), metadata_json),
    ])
}

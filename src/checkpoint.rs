//! Per-consumer checkpoint persistence.
//!
//! A checkpoint is the last acknowledged [`EntryId`] of a (stream, group, consumer)
//! triple, stored as `{prefix}:checkpoint:{stream}:{group}:{consumer}` with an expiry.
//! Saves are monotonic by default: an id that is not strictly greater than the stored one
//! is skipped. A failed save is logged and reported as `false`, never as an error; losing
//! a checkpoint only makes the next resume coarser.
//!
//! Read-compare-write is not atomic. Concurrent saves for the same key must be serialized
//! by the caller; the consumer does this through [`crate::writer::spawn_checkpoint_writer`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::KeyValueStore;
use crate::error::Result;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::types::EntryId;

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "streamfold";

/// Default checkpoint expiry (7 days).
pub const DEFAULT_CHECKPOINT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default number of write attempts.
pub const DEFAULT_SAVE_ATTEMPTS: usize = 3;

/// Checkpoint store over a [`KeyValueStore`].
#[derive(Clone)]
pub struct CheckpointStore {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
    ttl: Option<Duration>,
    retry: RetryPolicy,
}

impl CheckpointStore {
    /// Store with the default prefix, 7-day expiry and 3 write attempts.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: Some(DEFAULT_CHECKPOINT_TTL),
            retry: RetryPolicy::with_attempts(DEFAULT_SAVE_ATTEMPTS),
        }
    }

    /// Use `prefix` for all keys.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Expire checkpoints after `ttl`, or never with `None`.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Retry policy for reads and writes.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Key holding the checkpoint of one consumer.
    pub fn key(&self, stream: &str, group: &str, consumer: &str) -> String {
        format!("{}:checkpoint:{stream}:{group}:{consumer}", self.prefix)
    }

    fn group_prefix(&self, stream: &str, group: &str) -> String {
        format!("{}:checkpoint:{stream}:{group}:", self.prefix)
    }

    /// Returns `true` if `id` has the `<ms>-<seq>` shape.
    pub fn validate(id: &str) -> bool {
        EntryId::is_valid(id)
    }

    /// Persist `id` as the checkpoint of `consumer`.
    ///
    /// With `monotonic`, the write is skipped when the stored id is greater than or equal
    /// to `id`. Returns `true` only when the value was written.
    pub async fn save(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: EntryId,
        monotonic: bool,
    ) -> bool {
        let key = self.key(stream, group, consumer);

        if monotonic {
            match retry_with_backoff(&self.retry, "checkpoint read", || self.kv.get(&key)).await
            {
                Ok(Some(stored)) => match stored.parse::<EntryId>() {
                    Ok(current) if current >= id => {
                        tracing::debug!(key = %key, current = %current, id = %id, "checkpoint not advanced");
                        return false;
                    }
                    Ok(_) => {}
                    Err(_) => {
                        tracing::warn!(key = %key, stored = %stored, "overwriting invalid checkpoint");
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "checkpoint read failed, save skipped");
                    crate::metrics::record_checkpoint_failure(stream);
                    return false;
                }
            }
        }

        let value = id.to_string();
        let written = retry_with_backoff(&self.retry, "checkpoint write", || {
            self.kv.set(&key, &value, self.ttl)
        })
        .await;
        match written {
            Ok(()) => {
                tracing::debug!(key = %key, id = %id, "saved checkpoint");
                true
            }
            Err(err) => {
                tracing::warn!(key = %key, id = %id, error = %err, "checkpoint save failed");
                crate::metrics::record_checkpoint_failure(stream);
                false
            }
        }
    }

    /// Stored checkpoint of `consumer`.
    ///
    /// A stored value that is not a valid id is reported as no checkpoint.
    pub async fn load(&self, stream: &str, group: &str, consumer: &str) -> Result<Option<EntryId>> {
        let key = self.key(stream, group, consumer);
        let stored = retry_with_backoff(&self.retry, "checkpoint read", || self.kv.get(&key)).await?;
        Ok(stored.and_then(|value| match value.parse::<EntryId>() {
            Ok(id) => {
                tracing::debug!(key = %key, id = %id, "loaded checkpoint");
                Some(id)
            }
            Err(_) => {
                tracing::warn!(key = %key, value = %value, "ignoring invalid checkpoint");
                None
            }
        }))
    }

    /// Remove the checkpoint of `consumer`. Returns `false` if there was none.
    pub async fn delete(&self, stream: &str, group: &str, consumer: &str) -> Result<bool> {
        let key = self.key(stream, group, consumer);
        let deleted = self.kv.delete(&key).await?;
        tracing::debug!(key = %key, deleted, "deleted checkpoint");
        Ok(deleted)
    }

    /// All valid checkpoints of a group keyed by consumer name.
    pub async fn get_all_for_group(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<BTreeMap<String, EntryId>> {
        let prefix = self.group_prefix(stream, group);
        let mut out = BTreeMap::new();
        for key in self.kv.scan_prefix(&prefix).await? {
            let Some(consumer) = key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(id) = self
                .kv
                .get(&key)
                .await?
                .and_then(|v| v.parse::<EntryId>().ok())
            {
                out.insert(consumer.to_string(), id);
            }
        }
        Ok(out)
    }
}

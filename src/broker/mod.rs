//! Broker seam.
//!
//! Every component talks to the log-structured broker through [`StreamBroker`] and
//! persists checkpoints through [`KeyValueStore`]. Components receive an `Arc` of the
//! trait object at construction and own it for their lifetime; there is no process-wide
//! default connection.
//!
//! Two implementations ship with the crate:
//!
//! - [`RedisBroker`]: Redis Streams over a reconnecting connection manager.
//! - [`MemoryBroker`]: an in-process log with the same group/pending semantics, used by
//!   the test suite and for local dry runs.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    ConsumerInfo, EntryId, GroupInfo, PendingEntry, RawEntry, ReadPosition, StartId, StreamInfo,
};

pub mod memory;
pub mod redis;

pub use memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// How to trim a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimPolicy {
    /// Keep roughly the newest `n` entries.
    MaxLen(usize),
    /// Drop entries with ids lower than the given id.
    MinId(EntryId),
}

/// Append, group-read, acknowledge and pending-introspection primitives of the broker.
///
/// Errors follow the crate taxonomy: a missing stream is `StreamNotFound`, a missing
/// group is `GroupNotFound`, connection-level failures are the transient `Broker`
/// variant.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append an entry with the given fields, trimming approximately to `max_len`.
    ///
    /// When `mkstream` is false and the stream does not exist, returns
    /// `StreamNotFound` instead of creating it.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
        mkstream: bool,
    ) -> Result<EntryId>;

    /// Create an empty stream. Returns `false` if it already exists.
    async fn create_stream(&self, stream: &str) -> Result<bool>;

    /// Returns `true` if the stream exists.
    async fn stream_exists(&self, stream: &str) -> Result<bool>;

    /// Delete the stream with all its entries and groups. Returns `false` if absent.
    async fn delete_stream(&self, stream: &str) -> Result<bool>;

    /// Number of entries in the stream (0 when absent).
    async fn stream_length(&self, stream: &str) -> Result<u64>;

    /// Summary of the stream.
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo>;

    /// Trim the stream. Returns the number of entries removed.
    async fn trim(&self, stream: &str, policy: TrimPolicy) -> Result<u64>;

    /// Create a consumer group. Returns `false` if the group already exists.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartId,
        mkstream: bool,
    ) -> Result<bool>;

    /// Destroy a consumer group. Returns `false` if it did not exist.
    async fn destroy_group(&self, stream: &str, group: &str) -> Result<bool>;

    /// Summaries of all groups on the stream.
    async fn group_infos(&self, stream: &str) -> Result<Vec<GroupInfo>>;

    /// Summaries of all consumers in a group.
    async fn consumer_infos(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>>;

    /// Read up to `count` entries for `consumer`.
    ///
    /// With [`ReadPosition::New`] the call waits up to `block` for new entries
    /// (`Duration::ZERO` means do not wait). With [`ReadPosition::After`] it returns the
    /// consumer's own pending entries immediately.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        position: ReadPosition,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>>;

    /// Acknowledge entries. Returns how many were pending and are now removed.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64>;

    /// Total number of pending entries in the group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64>;

    /// Pending entries in id order, optionally restricted to one consumer.
    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Reassign the listed pending entries idle for at least `min_idle` to `consumer`.
    ///
    /// Returns the claimed entries that still exist in the stream.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<RawEntry>>;
}

/// Small keyed store with expiry, used for checkpoints.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`. Returns `false` if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

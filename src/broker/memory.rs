//! In-process broker with Redis Streams group semantics.
//!
//! `MemoryBroker` keeps every stream in a `BTreeMap` keyed by [`EntryId`] behind a single
//! mutex. Consumer groups track their last delivered id and a pending entries list, so
//! at-least-once delivery, history replay, acknowledgement and claiming behave like the
//! real broker. Blocking group reads park on a `Notify` that every append wakes.
//!
//! Idle times are measured with `tokio::time::Instant`, so tests running with a paused
//! clock can age pending entries with `tokio::time::advance`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{KeyValueStore, StreamBroker, TrimPolicy};
use crate::error::{Error, Result};
use crate::types::{
    ConsumerInfo, EntryId, GroupInfo, PendingEntry, RawEntry, ReadPosition, StartId, StreamInfo,
};

/// Cloneable in-memory broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamLog>,
    kv: HashMap<String, KvValue>,
}

#[derive(Default)]
struct StreamLog {
    entries: BTreeMap<EntryId, Vec<(String, String)>>,
    last_id: EntryId,
    groups: BTreeMap<String, GroupState>,
}

struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingState>,
    /// Consumer name -> last time it read or claimed.
    consumers: BTreeMap<String, Instant>,
}

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

struct KvValue {
    value: String,
    expires_at: Option<Instant>,
}

impl KvValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn stream_not_found(stream: &str) -> Error {
    Error::StreamNotFound {
        stream: stream.to_string(),
    }
}

fn group_not_found(stream: &str, group: &str) -> Error {
    Error::GroupNotFound {
        group: group.to_string(),
        stream: stream.to_string(),
    }
}

impl StreamLog {
    fn next_id(&self) -> EntryId {
        let ms = wall_clock_ms().max(self.last_id.ms);
        if ms == self.last_id.ms {
            EntryId::new(ms, self.last_id.seq + 1)
        } else {
            EntryId::new(ms, 0)
        }
    }

    fn trim_to(&mut self, max_len: usize) -> u64 {
        let mut removed = 0;
        while self.entries.len() > max_len {
            if self.entries.pop_first().is_none() {
                break;
            }
            removed += 1;
        }
        removed
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut GroupState> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| group_not_found(stream, group))
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared.state.lock().expect("MemoryBroker mutex poisoned")
    }

    /// Deliver up to `count` never-delivered entries to `consumer`.
    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        let now = Instant::now();
        let mut state = self.lock();
        let log = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| group_not_found(stream, group))?;
        let fresh: Vec<RawEntry> = {
            let last = log
                .groups
                .get(group)
                .ok_or_else(|| group_not_found(stream, group))?
                .last_delivered;
            log.entries
                .range((std::ops::Bound::Excluded(last), std::ops::Bound::Unbounded))
                .take(count)
                .map(|(id, fields)| RawEntry {
                    id: *id,
                    fields: fields.clone(),
                })
                .collect()
        };
        let state_group = log.group_mut(stream, group)?;
        state_group.consumers.insert(consumer.to_string(), now);
        for entry in &fresh {
            state_group.last_delivered = entry.id;
            state_group.pending.insert(
                entry.id,
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
        }
        Ok(fresh)
    }

    /// Replay this consumer's own pending entries after `after`.
    fn take_history(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: EntryId,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        let now = Instant::now();
        let mut state = self.lock();
        let log = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| group_not_found(stream, group))?;
        let StreamLog {
            entries, groups, ..
        } = log;
        let state_group = groups
            .get_mut(group)
            .ok_or_else(|| group_not_found(stream, group))?;
        state_group.consumers.insert(consumer.to_string(), now);

        let mut out = Vec::new();
        for (id, pending) in state_group
            .pending
            .range_mut((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
        {
            if out.len() >= count {
                break;
            }
            if pending.consumer != consumer {
                continue;
            }
            // Trimmed entries stay pending but have no body to replay.
            let Some(fields) = entries.get(id) else {
                continue;
            };
            pending.delivered_at = now;
            pending.delivery_count += 1;
            out.push(RawEntry {
                id: *id,
                fields: fields.clone(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
        mkstream: bool,
    ) -> Result<EntryId> {
        let id = {
            let mut state = self.lock();
            if !mkstream && !state.streams.contains_key(stream) {
                return Err(stream_not_found(stream));
            }
            let log = state.streams.entry(stream.to_string()).or_default();
            let id = log.next_id();
            log.entries.insert(id, fields.to_vec());
            log.last_id = id;
            if let Some(max) = max_len {
                log.trim_to(max);
            }
            id
        };
        self.shared.appended.notify_waiters();
        Ok(id)
    }

    async fn create_stream(&self, stream: &str) -> Result<bool> {
        let mut state = self.lock();
        if state.streams.contains_key(stream) {
            return Ok(false);
        }
        state.streams.insert(stream.to_string(), StreamLog::default());
        Ok(true)
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool> {
        Ok(self.lock().streams.contains_key(stream))
    }

    async fn delete_stream(&self, stream: &str) -> Result<bool> {
        let removed = self.lock().streams.remove(stream).is_some();
        if removed {
            self.shared.appended.notify_waiters();
        }
        Ok(removed)
    }

    async fn stream_length(&self, stream: &str) -> Result<u64> {
        Ok(self
            .lock()
            .streams
            .get(stream)
            .map_or(0, |log| log.entries.len() as u64))
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let state = self.lock();
        let log = state
            .streams
            .get(stream)
            .ok_or_else(|| stream_not_found(stream))?;
        Ok(StreamInfo {
            name: stream.to_string(),
            length: log.entries.len() as u64,
            first_entry_id: log.entries.keys().next().copied(),
            last_entry_id: log.entries.keys().next_back().copied(),
            groups: log.groups.len() as u64,
        })
    }

    async fn trim(&self, stream: &str, policy: TrimPolicy) -> Result<u64> {
        let mut state = self.lock();
        let Some(log) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let removed = match policy {
            TrimPolicy::MaxLen(max) => log.trim_to(max),
            TrimPolicy::MinId(min) => {
                let keep = log.entries.split_off(&min);
                let removed = log.entries.len() as u64;
                log.entries = keep;
                removed
            }
        };
        Ok(removed)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartId,
        mkstream: bool,
    ) -> Result<bool> {
        let mut state = self.lock();
        if !state.streams.contains_key(stream) {
            if !mkstream {
                return Err(stream_not_found(stream));
            }
            state.streams.insert(stream.to_string(), StreamLog::default());
        }
        let log = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| stream_not_found(stream))?;
        if log.groups.contains_key(group) {
            return Ok(false);
        }
        let last_delivered = match start {
            StartId::Beginning => EntryId::ZERO,
            StartId::NewOnly => log.last_id,
            StartId::At(id) => id,
        };
        log.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
                consumers: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<bool> {
        let mut state = self.lock();
        Ok(state
            .streams
            .get_mut(stream)
            .is_some_and(|log| log.groups.remove(group).is_some()))
    }

    async fn group_infos(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let state = self.lock();
        let log = state
            .streams
            .get(stream)
            .ok_or_else(|| stream_not_found(stream))?;
        Ok(log
            .groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                stream: stream.to_string(),
                consumers: g.consumers.len() as u64,
                pending: g.pending.len() as u64,
                last_delivered_id: g.last_delivered,
            })
            .collect())
    }

    async fn consumer_infos(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        let now = Instant::now();
        let state = self.lock();
        let log = state
            .streams
            .get(stream)
            .ok_or_else(|| stream_not_found(stream))?;
        let g = log
            .groups
            .get(group)
            .ok_or_else(|| group_not_found(stream, group))?;
        Ok(g.consumers
            .iter()
            .map(|(name, seen)| ConsumerInfo {
                name: name.clone(),
                pending: g.pending.values().filter(|p| &p.consumer == name).count() as u64,
                idle_ms: now.saturating_duration_since(*seen).as_millis() as u64,
            })
            .collect())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        position: ReadPosition,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>> {
        if let ReadPosition::After(id) = position {
            return self.take_history(stream, group, consumer, id, count);
        }

        let deadline = Instant::now() + block;
        loop {
            // Register for wakeups before looking, so an append between the check and
            // the await is not missed.
            let notified = self.shared.appended.notified();
            let fresh = self.take_new(stream, group, consumer, count)?;
            if !fresh.is_empty() || block.is_zero() {
                return Ok(fresh);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        let mut state = self.lock();
        let Some(g) = state
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| g.pending.remove(*id).is_some()).count() as u64)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let state = self.lock();
        state
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .ok_or_else(|| group_not_found(stream, group))
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let now = Instant::now();
        let state = self.lock();
        let g = state
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .ok_or_else(|| group_not_found(stream, group))?;
        Ok(g.pending
            .iter()
            .filter(|(_, p)| consumer.is_none_or(|c| p.consumer == c))
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: *id,
                consumer: p.consumer.clone(),
                idle_ms: now.saturating_duration_since(p.delivered_at).as_millis() as u64,
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<RawEntry>> {
        let now = Instant::now();
        let mut state = self.lock();
        let log = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| group_not_found(stream, group))?;
        let StreamLog {
            entries, groups, ..
        } = log;
        let g = groups
            .get_mut(group)
            .ok_or_else(|| group_not_found(stream, group))?;
        g.consumers.insert(consumer.to_string(), now);

        let mut claimed = Vec::new();
        for id in ids {
            let Some(pending) = g.pending.get_mut(id) else {
                continue;
            };
            if now.saturating_duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            match entries.get(id) {
                Some(fields) => {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.delivery_count += 1;
                    claimed.push(RawEntry {
                        id: *id,
                        fields: fields.clone(),
                    });
                }
                None => {
                    // The entry was trimmed; nothing left to deliver.
                    g.pending.remove(id);
                }
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl KeyValueStore for MemoryBroker {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .lock()
            .kv
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.lock().kv.insert(
            key.to_string(),
            KvValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .lock()
            .kv
            .remove(key)
            .is_some_and(|v| v.is_live(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .kv
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && v.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

//! Redis Streams implementation of the broker traits.
//!
//! Commands are issued with `redis::cmd(..).query_async` over a
//! [`ConnectionManager`], which reconnects transparently after a dropped connection.
//! Each call clones the manager (a cheap handle) so `RedisBroker` can be shared behind an
//! `Arc` without a lock.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamInfoConsumersReply, StreamInfoGroupsReply,
    StreamPendingCountReply, StreamPendingReply, StreamRangeReply, StreamReadReply,
};
use redis::RedisError;

use super::{KeyValueStore, StreamBroker, TrimPolicy};
use crate::error::{Error, Result};
use crate::types::{
    ConsumerInfo, EntryId, GroupInfo, PendingEntry, RawEntry, ReadPosition, StartId, StreamInfo,
};

/// Group created and destroyed again to materialize an empty stream.
const INIT_GROUP: &str = "__streamfold_init";

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 500;

/// Broker backed by a Redis server.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}

/// What a command was addressing, used to turn server errors into typed ones.
#[derive(Clone, Copy)]
struct Target<'a> {
    stream: &'a str,
    group: Option<&'a str>,
}

impl<'a> Target<'a> {
    fn stream(stream: &'a str) -> Self {
        Self {
            stream,
            group: None,
        }
    }

    fn group(stream: &'a str, group: &'a str) -> Self {
        Self {
            stream,
            group: Some(group),
        }
    }
}

/// Map a Redis error onto the crate taxonomy.
///
/// Connection-level failures become the transient [`Error::Broker`]. `NOGROUP` becomes
/// `GroupNotFound`, a missing key becomes `StreamNotFound`, everything else the server
/// rejects is a [`Error::Command`].
fn classify(err: RedisError, target: Target<'_>) -> Error {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        return Error::Broker(err.to_string());
    }
    let text = err.to_string();
    if err.code() == Some("NOGROUP") || text.contains("NOGROUP") {
        return match target.group {
            Some(group) => Error::GroupNotFound {
                group: group.to_string(),
                stream: target.stream.to_string(),
            },
            None => Error::StreamNotFound {
                stream: target.stream.to_string(),
            },
        };
    }
    let lower = text.to_lowercase();
    if lower.contains("requires the key to exist") || lower.contains("no such key") {
        return Error::StreamNotFound {
            stream: target.stream.to_string(),
        };
    }
    Error::Command(text)
}

fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP")
}

fn parse_id(raw: &str) -> Result<EntryId> {
    raw.parse()
}

fn raw_entry(id: &StreamId) -> Result<RawEntry> {
    let mut fields = Vec::with_capacity(id.map.len());
    for (key, value) in &id.map {
        let value: String = redis::from_redis_value(value)
            .map_err(|e| Error::Command(format!("field {key} of entry {}: {e}", id.id)))?;
        fields.push((key.clone(), value));
    }
    // Server field order is lost in the map; sort for stable output.
    fields.sort();
    Ok(RawEntry {
        id: parse_id(&id.id)?,
        fields,
    })
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Escape glob metacharacters for a SCAN MATCH pattern.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl RedisBroker {
    /// Connect to the server at `url` (e.g. `redis://localhost:6379/0`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a malformed URL and [`Error::Broker`] when the first
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("invalid redis url {url:?}: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Broker(e.to_string()))?;
        tracing::info!(url, "connected to redis");
        Ok(Self { conn })
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Broker(e.to_string()))?;
        Ok(())
    }

    async fn edge_id(&self, stream: &str, newest: bool) -> Result<Option<EntryId>> {
        let mut conn = self.conn.clone();
        let mut cmd = if newest {
            let mut c = redis::cmd("XREVRANGE");
            c.arg(stream).arg("+").arg("-");
            c
        } else {
            let mut c = redis::cmd("XRANGE");
            c.arg(stream).arg("-").arg("+");
            c
        };
        cmd.arg("COUNT").arg(1);
        let reply: StreamRangeReply = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::stream(stream)))?;
        reply.ids.first().map(|id| parse_id(&id.id)).transpose()
    }
}

#[async_trait]
impl StreamBroker for RedisBroker {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
        mkstream: bool,
    ) -> Result<EntryId> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if !mkstream {
            cmd.arg("NOMKSTREAM");
        }
        if let Some(max) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max);
        }
        cmd.arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }
        let id: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::stream(stream)))?;
        match id {
            Some(id) => parse_id(&id),
            None => Err(Error::StreamNotFound {
                stream: stream.to_string(),
            }),
        }
    }

    async fn create_stream(&self, stream: &str) -> Result<bool> {
        if self.stream_exists(stream).await? {
            return Ok(false);
        }
        let created = self
            .create_group(stream, INIT_GROUP, StartId::NewOnly, true)
            .await?;
        self.destroy_group(stream, INIT_GROUP).await?;
        Ok(created)
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("EXISTS")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::stream(stream)))?;
        Ok(n > 0)
    }

    async fn delete_stream(&self, stream: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("DEL")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::stream(stream)))?;
        Ok(n > 0)
    }

    async fn stream_length(&self, stream: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::stream(stream)))
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        if !self.stream_exists(stream).await? {
            return Err(Error::StreamNotFound {
                stream: stream.to_string(),
            });
        }
        let length = self.stream_length(stream).await?;
        let first_entry_id = self.edge_id(stream, false).await?;
        let last_entry_id = self.edge_id(stream, true).await?;
        let groups = self.group_infos(stream).await?.len() as u64;
        Ok(StreamInfo {
            name: stream.to_string(),
            length,
            first_entry_id,
            last_entry_id,
            groups,
        })
    }

    async fn trim(&self, stream: &str, policy: TrimPolicy) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XTRIM");
        cmd.arg(stream);
        match policy {
            TrimPolicy::MaxLen(max) => cmd.arg("MAXLEN").arg("~").arg(max),
            TrimPolicy::MinId(id) => cmd.arg("MINID").arg("~").arg(id.to_string()),
        };
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::stream(stream)))
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartId,
        mkstream: bool,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(start.as_arg());
        if mkstream {
            cmd.arg("MKSTREAM");
        }
        let reply: redis::RedisResult<()> = cmd.query_async(&mut conn).await;
        match reply {
            Ok(()) => Ok(true),
            Err(e) if is_busy_group(&e) => Ok(false),
            Err(e) => Err(classify(e, Target::group(stream, group))),
        }
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: redis::RedisResult<i64> = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(n) => Ok(n > 0),
            Err(e) => match classify(e, Target::group(stream, group)) {
                Error::StreamNotFound { .. } | Error::GroupNotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn group_infos(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoGroupsReply = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::stream(stream)))?;
        reply
            .groups
            .into_iter()
            .map(|g| {
                Ok(GroupInfo {
                    name: g.name,
                    stream: stream.to_string(),
                    consumers: g.consumers as u64,
                    pending: g.pending as u64,
                    last_delivered_id: parse_id(&g.last_delivered_id)?,
                })
            })
            .collect()
    }

    async fn consumer_infos(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoConsumersReply = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::group(stream, group)))?;
        Ok(reply
            .consumers
            .into_iter()
            .map(|c| ConsumerInfo {
                name: c.name,
                pending: c.pending as u64,
                idle_ms: c.idle as u64,
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
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count);
        // BLOCK 0 means wait forever on the server; a zero duration means do not wait.
        if position == ReadPosition::New && !block.is_zero() {
            cmd.arg("BLOCK").arg(millis(block));
        }
        cmd.arg("STREAMS").arg(stream).arg(position.as_arg());

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::group(stream, group)))?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for key in reply.keys.into_iter().filter(|k| k.key == stream) {
            for id in &key.ids {
                out.push(raw_entry(id)?);
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.to_string());
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::group(stream, group)))
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::group(stream, group)))?;
        Ok(reply.count() as u64)
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group).arg("-").arg("+").arg(count);
        if let Some(consumer) = consumer {
            cmd.arg(consumer);
        }
        let reply: StreamPendingCountReply = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::group(stream, group)))?;
        reply
            .ids
            .into_iter()
            .map(|p| {
                Ok(PendingEntry {
                    id: parse_id(&p.id)?,
                    consumer: p.consumer,
                    idle_ms: p.last_delivered_ms as u64,
                    delivery_count: p.times_delivered as u64,
                })
            })
            .collect()
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<RawEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(millis(min_idle));
        for id in ids {
            cmd.arg(id.to_string());
        }
        let reply: StreamClaimReply = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::group(stream, group)))?;
        reply.ids.iter().map(raw_entry).collect()
    }
}

#[async_trait]
impl KeyValueStore for RedisBroker {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::stream(key)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::stream(key)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, Target::stream(key)))?;
        Ok(n > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", glob_escape(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| classify(e, Target::stream(prefix)))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

//! Core domain types for streamfold.
//!
//! Entry identifiers, the decoded entry shape, consumer-group start and read positions,
//! pending-entry and group introspection records, and the name/size limits shared by the
//! producer and consumer sides.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Maximum serialized payload size in bytes (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Wire field carrying the event type tag.
pub const FIELD_EVENT_TYPE: &str = "event_type";
/// Wire field carrying the JSON-encoded payload.
pub const FIELD_PAYLOAD: &str = "payload";
/// Wire field carrying the RFC 3339 publish timestamp.
pub const FIELD_TIMESTAMP: &str = "timestamp";
/// Wire field carrying the JSON-encoded metadata object.
pub const FIELD_METADATA: &str = "metadata";

/// Opaque key/value metadata attached to an entry.
pub type Metadata = Map<String, Value>;

/// Broker-assigned entry identifier, `<ms>-<seq>`.
///
/// Ids are totally ordered by `(ms, seq)` compared numerically, which is the broker's
/// native order. The derived `Ord` relies on the field order below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    /// Millisecond timestamp part.
    pub ms: u64,
    /// Sequence number within the millisecond.
    pub seq: u64,
}

impl EntryId {
    /// The smallest possible id, `0-0`.
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    /// Build an id from its two components.
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Returns `true` if `s` has the `^\d+-\d+$` shape and both parts fit in a `u64`.
    pub fn is_valid(s: &str) -> bool {
        s.parse::<EntryId>().is_ok()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidEntryId(s.to_string());
        let (ms, seq) = s.split_once('-').ok_or_else(invalid)?;
        let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(ms) || !all_digits(seq) {
            return Err(invalid());
        }
        Ok(EntryId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for EntryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a newly created consumer group starts delivering from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartId {
    /// `"0"`: deliver every entry already in the stream.
    Beginning,
    /// `"$"`: deliver only entries appended after the group is created.
    NewOnly,
    /// Deliver entries strictly after the given id.
    At(EntryId),
}

impl StartId {
    /// The broker argument for this start policy.
    pub fn as_arg(&self) -> String {
        match self {
            StartId::Beginning => "0".to_string(),
            StartId::NewOnly => "$".to_string(),
            StartId::At(id) => id.to_string(),
        }
    }
}

impl FromStr for StartId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(StartId::Beginning),
            "$" => Ok(StartId::NewOnly),
            other => other.parse().map(StartId::At),
        }
    }
}

/// Position argument of a group read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPosition {
    /// `">"`: entries never delivered to any consumer of the group.
    New,
    /// Replay this consumer's own pending entries with ids strictly greater than the id.
    After(EntryId),
}

impl ReadPosition {
    /// The broker argument for this position.
    pub fn as_arg(&self) -> String {
        match self {
            ReadPosition::New => ">".to_string(),
            ReadPosition::After(id) => id.to_string(),
        }
    }
}

/// An entry exactly as the broker returns it: id plus flat string fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    /// Broker-assigned id.
    pub id: EntryId,
    /// Field/value pairs in append order.
    pub fields: Vec<(String, String)>,
}

impl RawEntry {
    /// Value of the first field named `name`, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A decoded stream entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    /// Broker-assigned id.
    pub id: EntryId,
    /// Stream the entry was read from.
    pub stream: String,
    /// Event type tag.
    pub event_type: String,
    /// Structured payload.
    pub payload: Value,
    /// RFC 3339 timestamp set by the producer.
    pub timestamp: String,
    /// Opaque metadata.
    pub metadata: Metadata,
}

impl Entry {
    /// Decode a raw broker entry.
    ///
    /// Missing fields decode to defaults (empty type, `{}` payload and metadata) and a
    /// payload that is not valid JSON is kept as a JSON string, so entries written by
    /// foreign producers still reach the handler.
    pub fn from_raw(stream: &str, raw: &RawEntry) -> Entry {
        let payload = match raw.field(FIELD_PAYLOAD) {
            Some(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
            }
            None => Value::Object(Map::new()),
        };
        let metadata = raw
            .field(FIELD_METADATA)
            .and_then(|text| serde_json::from_str::<Metadata>(text).ok())
            .unwrap_or_default();

        Entry {
            id: raw.id,
            stream: stream.to_string(),
            event_type: raw.field(FIELD_EVENT_TYPE).unwrap_or_default().to_string(),
            payload,
            timestamp: raw.field(FIELD_TIMESTAMP).unwrap_or_default().to_string(),
            metadata,
        }
    }
}

/// A delivered but unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
    /// Entry id.
    pub id: EntryId,
    /// Consumer the entry is currently assigned to.
    pub consumer: String,
    /// Milliseconds since the entry was last delivered or claimed.
    pub idle_ms: u64,
    /// Number of times the entry has been delivered.
    pub delivery_count: u64,
}

/// Consumer group summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    /// Group name.
    pub name: String,
    /// Stream the group reads.
    pub stream: String,
    /// Number of consumers known to the group.
    pub consumers: u64,
    /// Number of pending entries across all consumers.
    pub pending: u64,
    /// Id of the last entry delivered to any consumer.
    pub last_delivered_id: EntryId,
}

/// Per-consumer summary within a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerInfo {
    /// Consumer name.
    pub name: String,
    /// Pending entries assigned to this consumer.
    pub pending: u64,
    /// Milliseconds since the consumer last interacted with the group.
    pub idle_ms: u64,
}

/// Stream summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    /// Stream name.
    pub name: String,
    /// Number of entries currently stored.
    pub length: u64,
    /// Oldest retained entry, if any.
    pub first_entry_id: Option<EntryId>,
    /// Newest entry, if any.
    pub last_entry_id: Option<EntryId>,
    /// Number of consumer groups.
    pub groups: u64,
}

/// Validate a stream or group name against `^[A-Za-z0-9_-]+$`.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming `kind` (e.g. `"stream"`) when the name is empty or
/// contains any other character.
pub fn validate_name(kind: &str, name: &str) -> Result<(), Error> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid {kind} name: {name:?}. Use alphanumeric characters, hyphens, and underscores only."
        )))
    }
}

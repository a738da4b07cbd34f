//! Error types for streamfold.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. Callers decide whether to retry by asking
//! [`Error::is_transient`]; validation and size errors are raised before any broker call
//! and are never retried.

use crate::types::EntryId;

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all streamfold operations.
///
/// Variants fall into three groups:
///
/// - Caller errors: `Validation`, `PayloadTooLarge`, `InvalidEntryId`, `Config`
/// - Missing resources: `StreamNotFound`, `GroupNotFound`
/// - Broker failures: `Broker` (transient, retried) and `Command` (broker rejected the
///   command, not retried)
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A stream/group name or event type failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The serialized payload exceeds the maximum allowed size.
    #[error("payload size {size} bytes exceeds maximum {max} bytes")]
    PayloadTooLarge {
        /// Serialized payload size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// The requested stream does not exist.
    #[error("stream not found: {stream}")]
    StreamNotFound {
        /// Name of the missing stream.
        stream: String,
    },

    /// The requested consumer group does not exist on the stream.
    #[error("consumer group not found: {group} (stream: {stream})")]
    GroupNotFound {
        /// Name of the missing group.
        group: String,
        /// Stream the group was looked up on.
        stream: String,
    },

    /// Transient broker failure: connection dropped, timeout, or I/O error.
    #[error("broker unavailable: {0}")]
    Broker(String),

    /// The broker rejected a command. Retrying the same command will not help.
    #[error("broker command failed: {0}")]
    Command(String),

    /// A string is not a valid `<ms>-<seq>` entry id.
    #[error("invalid entry id: {0:?}")]
    InvalidEntryId(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A batch publish stopped at its first failure.
    #[error("batch publish failed after {} entries: {source}", published.len())]
    BatchFailed {
        /// Ids of the entries appended before the failure, in order.
        published: Vec<EntryId>,
        /// The error that stopped the batch.
        #[source]
        source: Box<Error>,
    },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error outside the broker (config files, process spawning).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for failures that may succeed when retried.
    ///
    /// Only `Broker` errors are transient. A `BatchFailed` is transient when the error
    /// that stopped it was.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Broker(_) => true,
            Error::BatchFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display() {
        let err = Error::Validation("event_type must be a non-empty string".into());
        let msg = err.to_string();
        assert!(msg.contains("validation error"), "got: {msg}");
        assert!(msg.contains("event_type"), "got: {msg}");
    }

    #[test]
    fn payload_too_large_display() {
        let err = Error::PayloadTooLarge {
            size: 2_000_000,
            max: 1_048_576,
        };
        let msg = err.to_string();
        assert!(msg.contains("2000000"), "got: {msg}");
        assert!(msg.contains("1048576"), "got: {msg}");
    }

    #[test]
    fn group_not_found_names_group_and_stream() {
        let err = Error::GroupNotFound {
            group: "workers".into(),
            stream: "jobs".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("workers"), "got: {msg}");
        assert!(msg.contains("jobs"), "got: {msg}");
    }

    #[test]
    fn only_broker_errors_are_transient() {
        assert!(Error::Broker("connection reset".into()).is_transient());
        assert!(!Error::Command("WRONGTYPE".into()).is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
        assert!(
            !Error::StreamNotFound {
                stream: "s".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn batch_failed_inherits_transience_and_counts_published() {
        let err = Error::BatchFailed {
            published: vec![EntryId::new(1, 0), EntryId::new(1, 1)],
            source: Box::new(Error::Broker("timeout".into())),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("after 2 entries"), "got: {err}");
    }

    #[test]
    fn serde_json_error_converts() {
        fn fallible() -> Result<serde_json::Value> {
            Ok(serde_json::from_str("{not json")?)
        }
        assert!(matches!(fallible(), Err(Error::Serialization(_))));
    }
}

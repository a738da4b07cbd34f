//! Single-writer checkpoint task.
//!
//! The consumer loop must never wait on the checkpoint store, and monotonic saves are a
//! read-compare-write that would race if two saves for the same key ran concurrently. Both
//! are solved by one task that owns a [`CheckpointStore`] for a single consumer and applies
//! saves strictly in the order they were submitted through a bounded `tokio::mpsc`
//! channel.

use crate::checkpoint::CheckpointStore;
use crate::types::EntryId;

/// The (stream, group, consumer) triple a writer saves checkpoints for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointKey {
    /// Stream name.
    pub stream: String,
    /// Consumer group name.
    pub group: String,
    /// Consumer name.
    pub consumer: String,
}

/// A save request sent to the writer task.
pub struct CheckpointRequest {
    /// Id to persist.
    pub id: EntryId,
    /// Receives whether the value was written. `None` for fire-and-forget saves.
    pub response_tx: Option<tokio::sync::oneshot::Sender<bool>>,
}

/// Cloneable handle for submitting saves to the writer task.
///
/// Dropping every handle closes the channel; the task then finishes the queued saves and
/// exits, so awaiting its `JoinHandle` flushes all submitted checkpoints.
#[derive(Clone)]
pub struct CheckpointHandle {
    tx: tokio::sync::mpsc::Sender<CheckpointRequest>,
}

impl CheckpointHandle {
    /// Create a handle from the sender half of the writer channel.
    pub fn new(tx: tokio::sync::mpsc::Sender<CheckpointRequest>) -> Self {
        Self { tx }
    }

    /// Queue a save without waiting for it.
    ///
    /// Returns `false` when the save was dropped because the queue is full or the task has
    /// exited. A later save for a higher id supersedes a dropped one.
    pub fn submit(&self, id: EntryId) -> bool {
        let request = CheckpointRequest {
            id,
            response_tx: None,
        };
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(id = %id, "checkpoint queue full, save dropped");
                false
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(id = %id, "checkpoint writer closed, save dropped");
                false
            }
        }
    }

    /// Queue a save and wait until the writer has applied it.
    ///
    /// Returns whether the value was written; `false` also when the writer has exited.
    pub async fn save(&self, id: EntryId) -> bool {
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        let request = CheckpointRequest {
            id,
            response_tx: Some(response_tx),
        };
        if self.tx.send(request).await.is_err() {
            tracing::warn!(id = %id, "checkpoint writer closed");
            return false;
        }
        response_rx.await.unwrap_or(false)
    }
}

/// Run the writer loop until every handle is dropped.
///
/// Each wake-up receives one request with `recv()` and drains whatever else is queued
/// with `try_recv()`, then applies the batch in order with monotonic saves.
pub(crate) async fn run_checkpoint_writer(
    store: CheckpointStore,
    key: CheckpointKey,
    mut rx: tokio::sync::mpsc::Receiver<CheckpointRequest>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(req) = rx.try_recv() {
            batch.push(req);
        }

        for req in batch {
            let written = store
                .save(&key.stream, &key.group, &key.consumer, req.id, true)
                .await;
            if let Some(tx) = req.response_tx
                && tx.send(written).is_err()
            {
                tracing::debug!(id = %req.id, "checkpoint response receiver dropped");
            }
        }
    }
    tracing::debug!(
        stream = %key.stream,
        group = %key.group,
        consumer = %key.consumer,
        "checkpoint writer stopped"
    );
}

/// Spawn a checkpoint writer for `key` on the tokio runtime.
///
/// `channel_capacity` bounds the number of queued saves; fire-and-forget saves beyond it
/// are dropped rather than blocking the caller.
pub fn spawn_checkpoint_writer(
    store: CheckpointStore,
    key: CheckpointKey,
    channel_capacity: usize,
) -> (CheckpointHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = tokio::sync::mpsc::channel(channel_capacity);
    let handle = CheckpointHandle::new(tx);
    let join_handle = tokio::spawn(run_checkpoint_writer(store, key, rx));
    (handle, join_handle)
}

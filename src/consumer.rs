//! Group consumer: read, dispatch, acknowledge, checkpoint.
//!
//! A [`StreamConsumer`] is one named consumer in a group. [`StreamConsumer::subscribe`]
//! runs the read loop on the calling task until [`StreamConsumer::close`] is called:
//!
//! 1. Ensure the group exists (created with `NewOnly` start when missing).
//! 2. If a checkpoint exists, replay this consumer's own pending entries after it, then
//!    switch to new entries. Without a checkpoint, only new entries are read.
//! 3. Each entry goes to the [`EntryHandler`]. `Ok(true)`, or `auto_ack`, acknowledges
//!    it; an `Err` is logged and the entry stays pending.
//! 4. Acknowledged ids are checkpointed through a dedicated writer task, so a slow or
//!    unavailable checkpoint store never holds up the loop.
//! 5. Every `reclaim_interval` the consumer claims entries that other consumers left idle
//!    for at least `reclaim_min_idle` and handles them immediately.
//!
//! The stop flag is checked between reads, so shutdown takes at most one `block`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::broker::StreamBroker;
use crate::checkpoint::CheckpointStore;
use crate::error::{Error, Result};
use crate::group::ConsumerGroupManager;
use crate::types::{Entry, EntryId, PendingEntry, ReadPosition, StartId, validate_name};
use crate::writer::{CheckpointHandle, CheckpointKey, spawn_checkpoint_writer};

/// Default blocking read timeout.
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(5);
/// Default maximum entries per read.
pub const DEFAULT_COUNT: usize = 10;
/// Default interval between stale-entry reclaim passes.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(30);
/// Default idle time after which a pending entry may be reclaimed.
pub const DEFAULT_RECLAIM_MIN_IDLE: Duration = Duration::from_secs(30);
/// Default pause after a failed read.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Default bound on pending entries fetched per introspection call.
pub const DEFAULT_PENDING_LIMIT: usize = 100;

const CHECKPOINT_QUEUE_CAPACITY: usize = 1024;

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stream to read.
    pub stream: String,
    /// Consumer group.
    pub group: String,
    /// Consumer name, unique within the group.
    pub consumer: String,
    /// How long one read waits for new entries. Must be non-zero.
    pub block: Duration,
    /// Maximum entries per read.
    pub count: usize,
    /// Acknowledge every entry the handler returns `Ok` for, regardless of its value.
    pub auto_ack: bool,
    /// Replay pending entries after the stored checkpoint on subscribe.
    pub resume_from_checkpoint: bool,
    /// Only these event types reach the handler; others are acknowledged and skipped.
    pub event_types: Option<Vec<String>>,
    /// Interval between reclaim passes. `None` disables reclaiming.
    pub reclaim_interval: Option<Duration>,
    /// Minimum idle time for an entry to be reclaimed.
    pub reclaim_min_idle: Duration,
    /// Pause after a failed read before trying again.
    pub retry_delay: Duration,
    /// Bound on pending entries fetched by [`StreamConsumer::get_pending`].
    pub pending_limit: usize,
}

impl ConsumerConfig {
    /// Defaults: 5 s block, 10 per read, manual ack, resume on, reclaim every 30 s.
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            block: DEFAULT_BLOCK,
            count: DEFAULT_COUNT,
            auto_ack: false,
            resume_from_checkpoint: true,
            event_types: None,
            reclaim_interval: Some(DEFAULT_RECLAIM_INTERVAL),
            reclaim_min_idle: DEFAULT_RECLAIM_MIN_IDLE,
            retry_delay: DEFAULT_RETRY_DELAY,
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }

    fn validate(&self) -> Result<()> {
        validate_name("stream", &self.stream)?;
        validate_name("group", &self.group)?;
        if self.consumer.is_empty() {
            return Err(Error::Validation("consumer name must not be empty".into()));
        }
        if self.count == 0 {
            return Err(Error::Validation("count must be at least 1".into()));
        }
        // A zero block turns the read loop into a busy poll that never yields.
        if self.block.is_zero() {
            return Err(Error::Validation("block must be greater than zero".into()));
        }
        Ok(())
    }

    fn accepts(&self, event_type: &str) -> bool {
        self.event_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t == event_type))
    }
}

/// Processes delivered entries.
///
/// Return `Ok(true)` to acknowledge, `Ok(false)` to leave the entry pending. An `Err` is
/// logged and the entry stays pending, eligible for reclaiming later.
#[async_trait]
pub trait EntryHandler: Send {
    /// Handle one entry.
    async fn handle(&mut self, entry: &Entry) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F> EntryHandler for F
where
    F: FnMut(&Entry) -> anyhow::Result<bool> + Send,
{
    async fn handle(&mut self, entry: &Entry) -> anyhow::Result<bool> {
        (self)(entry)
    }
}

/// One named consumer in a consumer group.
pub struct StreamConsumer {
    broker: Arc<dyn StreamBroker>,
    groups: ConsumerGroupManager,
    checkpoints: CheckpointStore,
    config: ConsumerConfig,
    stop: AtomicBool,
    subscribed: AtomicBool,
    /// Writer of the active subscription, so direct acks keep checkpoint order.
    writer: Mutex<Option<CheckpointHandle>>,
}

impl StreamConsumer {
    /// Build a consumer.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for invalid names or a zero `count`.
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        checkpoints: CheckpointStore,
        config: ConsumerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            groups: ConsumerGroupManager::new(broker.clone()),
            broker,
            checkpoints,
            config,
            stop: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            writer: Mutex::new(None),
        })
    }

    /// Consumer settings.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Returns `true` while [`subscribe`](Self::subscribe) is running.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Ask the subscribe loop to stop after the current read.
    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_writer(&self, handle: Option<CheckpointHandle>) {
        *self.writer.lock().expect("consumer writer mutex poisoned") = handle;
    }

    fn active_writer(&self) -> Option<CheckpointHandle> {
        self.writer
            .lock()
            .expect("consumer writer mutex poisoned")
            .clone()
    }

    /// Where the first read of a subscription starts.
    async fn resume_position(&self) -> ReadPosition {
        if !self.config.resume_from_checkpoint {
            return ReadPosition::New;
        }
        let c = &self.config;
        match self.checkpoints.load(&c.stream, &c.group, &c.consumer).await {
            Ok(Some(id)) => {
                tracing::info!(consumer = %c.consumer, checkpoint = %id, "resuming from checkpoint");
                ReadPosition::After(id)
            }
            Ok(None) => ReadPosition::New,
            Err(err) => {
                tracing::warn!(consumer = %c.consumer, error = %err, "checkpoint load failed, reading new entries only");
                ReadPosition::New
            }
        }
    }

    /// Run the read/dispatch/ack loop until [`close`](Self::close) is called.
    ///
    /// Read failures are logged and retried after `retry_delay`; a group that disappears
    /// is re-created. Returns once the loop has stopped and queued checkpoints are
    /// written.
    ///
    /// # Errors
    ///
    /// Only setup failures: the group could not be created on the first attempt.
    pub async fn subscribe<H: EntryHandler>(&self, mut handler: H) -> Result<()> {
        let c = &self.config;
        self.groups
            .create_group(&c.stream, &c.group, StartId::NewOnly)
            .await?;
        let mut position = self.resume_position().await;

        let (writer, writer_task) = spawn_checkpoint_writer(
            self.checkpoints.clone(),
            CheckpointKey {
                stream: c.stream.clone(),
                group: c.group.clone(),
                consumer: c.consumer.clone(),
            },
            CHECKPOINT_QUEUE_CAPACITY,
        );
        self.set_writer(Some(writer.clone()));
        self.subscribed.store(true, Ordering::SeqCst);
        tracing::info!(
            stream = %c.stream,
            group = %c.group,
            consumer = %c.consumer,
            "consumer started"
        );

        let mut last_reclaim = Instant::now();
        while !self.stopping() {
            if let Some(interval) = c.reclaim_interval
                && last_reclaim.elapsed() >= interval
            {
                last_reclaim = Instant::now();
                self.reclaim_and_handle(&mut handler, &writer).await;
            }

            let read = self
                .broker
                .read_group(&c.stream, &c.group, &c.consumer, position, c.count, c.block)
                .await;
            match read {
                Ok(entries) => {
                    if entries.is_empty() {
                        if let ReadPosition::After(_) = position {
                            tracing::debug!(consumer = %c.consumer, "pending history drained");
                            position = ReadPosition::New;
                        }
                        continue;
                    }
                    for raw in &entries {
                        let entry = Entry::from_raw(&c.stream, raw);
                        self.dispatch(&mut handler, &entry, &writer).await;
                        if let ReadPosition::After(_) = position {
                            position = ReadPosition::After(raw.id);
                        }
                    }
                }
                Err(Error::GroupNotFound { .. }) => {
                    tracing::warn!(stream = %c.stream, group = %c.group, "consumer group missing, re-creating");
                    if let Err(err) = self
                        .groups
                        .create_group(&c.stream, &c.group, StartId::NewOnly)
                        .await
                    {
                        tracing::error!(error = %err, "failed to re-create consumer group");
                        tokio::time::sleep(c.retry_delay).await;
                    }
                }
                Err(err) => {
                    tracing::error!(consumer = %c.consumer, error = %err, "read failed");
                    tokio::time::sleep(c.retry_delay).await;
                }
            }
        }

        self.set_writer(None);
        drop(writer);
        if let Err(err) = writer_task.await {
            tracing::error!(error = %err, "checkpoint writer task failed");
        }
        self.subscribed.store(false, Ordering::SeqCst);
        self.stop.store(false, Ordering::SeqCst);
        tracing::info!(consumer = %c.consumer, "consumer stopped");
        Ok(())
    }

    async fn dispatch<H: EntryHandler>(
        &self,
        handler: &mut H,
        entry: &Entry,
        writer: &CheckpointHandle,
    ) {
        let c = &self.config;
        if !c.accepts(&entry.event_type) {
            tracing::debug!(id = %entry.id, event_type = %entry.event_type, "skipping filtered event type");
            self.ack_with(entry.id, writer).await;
            return;
        }
        match handler.handle(entry).await {
            Ok(ack) if ack || c.auto_ack => self.ack_with(entry.id, writer).await,
            Ok(_) => {
                tracing::debug!(id = %entry.id, "handler left entry pending");
            }
            Err(err) => {
                crate::metrics::record_handler_error(&c.stream, &c.group);
                tracing::error!(id = %entry.id, error = %err, "handler failed, entry left pending");
            }
        }
    }

    async fn ack_with(&self, id: EntryId, writer: &CheckpointHandle) {
        let c = &self.config;
        match self.broker.ack(&c.stream, &c.group, &[id]).await {
            Ok(n) => {
                crate::metrics::record_acked(&c.stream, &c.group, n);
                writer.submit(id);
            }
            Err(err) => {
                tracing::warn!(id = %id, error = %err, "acknowledge failed");
            }
        }
    }

    async fn reclaim_and_handle<H: EntryHandler>(&self, handler: &mut H, writer: &CheckpointHandle) {
        match self.claim_stale_messages(self.config.reclaim_min_idle).await {
            Ok(entries) => {
                for entry in &entries {
                    self.dispatch(handler, entry, writer).await;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "reclaim pass failed");
            }
        }
    }

    /// Acknowledge `id` and checkpoint it.
    ///
    /// The checkpoint save never fails the acknowledgement. While subscribed, the save goes
    /// through the subscription's writer; otherwise it is awaited directly.
    pub async fn acknowledge(&self, id: EntryId) -> Result<u64> {
        let c = &self.config;
        let n = self.broker.ack(&c.stream, &c.group, &[id]).await?;
        crate::metrics::record_acked(&c.stream, &c.group, n);
        match self.active_writer() {
            Some(writer) => {
                writer.submit(id);
            }
            None => {
                self.checkpoints
                    .save(&c.stream, &c.group, &c.consumer, id, true)
                    .await;
            }
        }
        Ok(n)
    }

    /// Pending entries of the whole group, oldest first, up to `pending_limit`.
    pub async fn get_pending(&self) -> Result<Vec<PendingEntry>> {
        let c = &self.config;
        self.broker
            .pending_range(&c.stream, &c.group, None, c.pending_limit)
            .await
    }

    /// Number of entries pending for this consumer.
    pub async fn get_pending_count(&self) -> Result<u64> {
        let c = &self.config;
        let consumers = self.broker.consumer_infos(&c.stream, &c.group).await?;
        Ok(consumers
            .iter()
            .find(|info| info.name == c.consumer)
            .map_or(0, |info| info.pending))
    }

    /// Claim pending entries idle for at least `min_idle` and return them decoded.
    pub async fn claim_stale_messages(&self, min_idle: Duration) -> Result<Vec<Entry>> {
        let c = &self.config;
        let min_idle_ms = min_idle.as_millis() as u64;
        let stale: Vec<EntryId> = self
            .get_pending()
            .await?
            .into_iter()
            .filter(|p| p.idle_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        let claimed = self
            .broker
            .claim(&c.stream, &c.group, &c.consumer, min_idle, &stale)
            .await?;
        if !claimed.is_empty() {
            crate::metrics::record_claimed(&c.stream, &c.group, claimed.len() as u64);
            tracing::info!(consumer = %c.consumer, claimed = claimed.len(), "claimed stale entries");
        }
        Ok(claimed
            .iter()
            .map(|raw| Entry::from_raw(&c.stream, raw))
            .collect())
    }

    /// Stored checkpoint of this consumer.
    pub async fn load_checkpoint(&self) -> Result<Option<EntryId>> {
        let c = &self.config;
        self.checkpoints.load(&c.stream, &c.group, &c.consumer).await
    }

    /// Forget this consumer's checkpoint, so the next subscribe reads only new entries.
    pub async fn delete_checkpoint(&self) -> Result<bool> {
        let c = &self.config;
        self.checkpoints.delete(&c.stream, &c.group, &c.consumer).await
    }
}

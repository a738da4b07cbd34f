//! Streamfold: consumer-group stream processing with checkpoints, backpressure monitoring
//! and queue-depth driven worker autoscaling.

pub mod broker;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod error;
pub mod group;
pub mod metrics;
pub mod monitor;
pub mod producer;
pub mod retry;
pub mod scaling;
pub mod types;
pub mod writer;

pub use broker::{KeyValueStore, MemoryBroker, RedisBroker, StreamBroker, TrimPolicy};
pub use checkpoint::CheckpointStore;
pub use config::Settings;
pub use consumer::{ConsumerConfig, EntryHandler, StreamConsumer};
pub use error::{Error, Result};
pub use group::ConsumerGroupManager;
pub use monitor::{BackpressureMetrics, LagMonitor, MonitorThresholds, StreamMonitor};
pub use producer::{
    OutgoingEvent, ProducerConfig, StreamManager, StreamProducer, StreamRetention,
};
pub use retry::RetryPolicy;
pub use scaling::{ScalingAction, ScalingConfig, ScalingController, ScalingEvent};
pub use types::{
    ConsumerInfo, Entry, EntryId, GroupInfo, MAX_PAYLOAD_SIZE, Metadata, PendingEntry,
    ReadPosition, StartId, StreamInfo,
};
pub use writer::{CheckpointHandle, spawn_checkpoint_writer};

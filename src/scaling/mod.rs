//! Worker pool autoscaling.
//!
//! A [`ScalingController`] watches the pending count of one consumer group and grows or
//! shrinks a pool of `streamfold-worker` processes between configured bounds.

pub mod config;
pub mod controller;
pub mod launcher;

pub use config::ScalingConfig;
pub use controller::{ScalingAction, ScalingController, ScalingEvent, Worker, WorkerStatus};
pub use launcher::{ProcessLauncher, TerminateOutcome, WorkerLauncher};

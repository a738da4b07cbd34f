//! Pending-count driven worker pool controller.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::config::ScalingConfig;
use super::launcher::{TerminateOutcome, WorkerLauncher};
use crate::broker::StreamBroker;
use crate::error::Result;

/// Scaling events kept in memory.
pub const HISTORY_LIMIT: usize = 100;

/// How long [`ScalingController::shutdown_workers`] waits for workers to exit.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle of a tracked worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Counted towards the pool size.
    Running,
    /// Sent SIGTERM; tracked until the process exits.
    Stopping,
}

/// A worker process started by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Worker {
    /// OS process id.
    pub pid: u32,
    /// Consumer name passed to the worker with `--consumer`.
    pub consumer_name: String,
    /// When the controller started the process.
    pub started_at: DateTime<Utc>,
    /// Running or stopping.
    pub status: WorkerStatus,
}

/// What a scaling decision did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoChange,
}

impl ScalingAction {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
            ScalingAction::NoChange => "no_change",
        }
    }
}

/// One entry of the scaling history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvent {
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// What the decision did.
    pub action: ScalingAction,
    /// Group-wide pending entries the decision was based on.
    pub pending_count: u64,
    /// Running workers before the action.
    pub worker_count: usize,
    /// Running workers the action aimed for.
    pub target_count: usize,
    /// Short human-readable cause.
    pub reason: String,
}

/// Grows and shrinks a pool of worker processes from the pending count of one group.
///
/// Scale-up happens when `pending > workers * scale_up_threshold`, targeting
/// `min(pending / 2 + 1, max_workers)`. Scale-down happens one worker at a time when
/// `pending < workers * scale_down_threshold` and nothing has been pending for
/// `idle_timeout`. Two actions are always at least `scale_cooldown` apart.
pub struct ScalingController<L: WorkerLauncher> {
    config: ScalingConfig,
    broker: Arc<dyn StreamBroker>,
    stream: String,
    group: String,
    launcher: L,
    dry_run: bool,
    workers: Vec<Worker>,
    last_scale: Option<Instant>,
    last_activity: Instant,
    next_worker: u64,
    history: VecDeque<ScalingEvent>,
}

impl<L: WorkerLauncher> ScalingController<L> {
    /// Create a controller. Fails with [`crate::Error::Config`] on an invalid config.
    pub fn new(
        config: ScalingConfig,
        broker: Arc<dyn StreamBroker>,
        stream: impl Into<String>,
        group: impl Into<String>,
        launcher: L,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            broker,
            stream: stream.into(),
            group: group.into(),
            launcher,
            dry_run: false,
            workers: Vec::new(),
            last_scale: None,
            last_activity: Instant::now(),
            next_worker: 0,
            history: VecDeque::new(),
        })
    }

    /// In dry-run mode spawns and terminations are only logged.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The validated scaling configuration.
    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    /// Tracked workers, in start order.
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Number of tracked workers that are not stopping.
    pub fn running_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Running)
            .count()
    }

    /// Recent scaling events, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ScalingEvent> {
        self.history.iter()
    }

    /// The launcher that starts and stops worker processes.
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Pending entries of the controlled group; 0 when the lookup fails.
    pub async fn get_pending_count(&self) -> u64 {
        match self.broker.pending_count(&self.stream, &self.group).await {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(
                    stream = %self.stream,
                    group = %self.group,
                    error = %err,
                    "failed to get pending count"
                );
                0
            }
        }
    }

    /// Pool size wanted for `pending` entries.
    ///
    /// # Arguments
    ///
    /// * `pending` - Group-wide pending entries.
    /// * `_current` - Running workers; the target does not depend on it.
    ///
    /// # Returns
    ///
    /// `min(pending / 2 + 1, max_workers)`.
    pub fn calculate_scale_up_target(&self, pending: u64, _current: usize) -> usize {
        let wanted = usize::try_from(pending / 2 + 1).unwrap_or(usize::MAX);
        wanted.min(self.config.max_workers)
    }

    /// Pool size after removing one worker, never below `min_workers`.
    ///
    /// # Arguments
    ///
    /// * `_pending` - Group-wide pending entries; the target does not depend on it.
    /// * `current` - Running workers.
    ///
    /// # Returns
    ///
    /// `max(current - 1, min_workers)`.
    pub fn calculate_scale_down_target(&self, _pending: u64, current: usize) -> usize {
        current.saturating_sub(1).max(self.config.min_workers)
    }

    /// Returns `true` when `current < max_workers` and
    /// `pending > current * scale_up_threshold`.
    pub fn should_scale_up(&self, pending: u64, current: usize) -> bool {
        current < self.config.max_workers
            && pending as f64 > current as f64 * self.config.scale_up_threshold
    }

    /// Returns `true` when `current > min_workers`,
    /// `pending < current * scale_down_threshold`, and `idle_timeout` has passed since
    /// entries were last pending.
    pub fn should_scale_down(&self, pending: u64, current: usize) -> bool {
        current > self.config.min_workers
            && self.last_activity.elapsed() >= self.config.idle_timeout
            && (pending as f64) < current as f64 * self.config.scale_down_threshold
    }

    fn in_cooldown(&self) -> bool {
        self.last_scale
            .is_some_and(|at| at.elapsed() < self.config.scale_cooldown)
    }

    fn next_consumer_name(&mut self) -> String {
        self.next_worker += 1;
        format!("worker-{}", self.next_worker)
    }

    fn spawn_worker(&mut self) -> bool {
        let name = self.next_consumer_name();
        if self.dry_run {
            tracing::info!(consumer = %name, "[DRY RUN] Would spawn worker");
            return false;
        }
        match self.launcher.spawn(&name) {
            Ok(pid) => {
                tracing::info!(pid, consumer = %name, "spawned worker");
                self.workers.push(Worker {
                    pid,
                    consumer_name: name,
                    started_at: Utc::now(),
                    status: WorkerStatus::Running,
                });
                true
            }
            Err(err) => {
                tracing::error!(consumer = %name, error = %err, "failed to spawn worker");
                false
            }
        }
    }

    /// Signal the most recently started running worker to stop.
    fn terminate_newest(&mut self) -> bool {
        let Some(idx) = self
            .workers
            .iter()
            .rposition(|w| w.status == WorkerStatus::Running)
        else {
            return false;
        };
        let pid = self.workers[idx].pid;
        if self.dry_run {
            tracing::info!(pid, "[DRY RUN] Would terminate worker");
            return false;
        }
        match self.launcher.terminate(pid) {
            TerminateOutcome::Signalled => {
                tracing::info!(pid, consumer = %self.workers[idx].consumer_name, "terminating worker");
                self.workers[idx].status = WorkerStatus::Stopping;
                true
            }
            TerminateOutcome::AlreadyDead => {
                self.workers.remove(idx);
                true
            }
            TerminateOutcome::Failed(reason) => {
                tracing::error!(pid, error = %reason, "failed to terminate worker");
                false
            }
        }
    }

    fn record(
        &mut self,
        action: ScalingAction,
        pending: u64,
        current: usize,
        target: usize,
        reason: &str,
    ) -> ScalingEvent {
        let event = ScalingEvent {
            timestamp: Utc::now(),
            action,
            pending_count: pending,
            worker_count: current,
            target_count: target,
            reason: reason.to_string(),
        };
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(event.clone());
        crate::metrics::record_scaling_event(action.as_str());
        crate::metrics::set_workers(self.running_count());
        event
    }

    /// Grow the pool to the scale-up target. `None` when nothing was done.
    pub fn scale_up(&mut self, pending: u64) -> Option<ScalingEvent> {
        if self.in_cooldown() {
            tracing::debug!("scale up suppressed by cooldown");
            return None;
        }
        let current = self.running_count();
        let target = self.calculate_scale_up_target(pending, current);
        if target <= current {
            return None;
        }
        // Stopping workers still hold a process slot until they exit.
        let room = self.config.max_workers.saturating_sub(self.workers.len());
        let to_start = (target - current).min(room);
        if to_start == 0 {
            tracing::debug!(
                stopping = self.workers.len() - current,
                "scale up deferred until stopping workers exit"
            );
            return None;
        }
        tracing::info!("SCALE_UP: pending={pending}, workers={current} -> target={target}");
        for _ in 0..to_start {
            self.spawn_worker();
        }
        self.last_scale = Some(Instant::now());
        Some(self.record(ScalingAction::ScaleUp, pending, current, target, "threshold exceeded"))
    }

    /// Shrink the pool by one worker. `None` when nothing was done.
    pub fn scale_down(&mut self, pending: u64) -> Option<ScalingEvent> {
        if self.in_cooldown() {
            tracing::debug!("scale down suppressed by cooldown");
            return None;
        }
        let current = self.running_count();
        let target = self.calculate_scale_down_target(pending, current);
        if target >= current {
            return None;
        }
        tracing::info!("SCALE_DOWN: pending={pending}, workers={current} -> target={target}");
        for _ in target..current {
            self.terminate_newest();
        }
        self.last_scale = Some(Instant::now());
        Some(self.record(ScalingAction::ScaleDown, pending, current, target, "idle timeout"))
    }

    /// Decide from a known pending count.
    ///
    /// Returns the event of the action taken; a `NoChange` event when no scaling was
    /// called for; `None` when scaling was called for but suppressed.
    pub fn decide(&mut self, pending: u64) -> Option<ScalingEvent> {
        if pending > 0 {
            self.last_activity = Instant::now();
        }
        // Stopping workers are left out so scale-down never signals the same worker twice;
        // scale-up still caps the process count at `max_workers` including them.
        let current = self.running_count();
        if self.should_scale_up(pending, current) {
            self.scale_up(pending)
        } else if self.should_scale_down(pending, current) {
            self.scale_down(pending)
        } else {
            Some(self.record(ScalingAction::NoChange, pending, current, current, "within bounds"))
        }
    }

    /// Fetch the pending count and [`decide`](Self::decide).
    pub async fn make_scaling_decision(&mut self) -> Option<ScalingEvent> {
        let pending = self.get_pending_count().await;
        crate::metrics::set_pending(&self.stream, &self.group, pending);
        self.decide(pending)
    }

    /// Forget workers whose process has exited. Returns how many were removed.
    pub fn cleanup_dead_workers(&mut self) -> usize {
        let before = self.workers.len();
        let launcher = &mut self.launcher;
        self.workers.retain(|w| {
            let alive = launcher.is_alive(w.pid);
            if !alive {
                tracing::info!(pid = w.pid, consumer = %w.consumer_name, "worker exited");
            }
            alive
        });
        let removed = before - self.workers.len();
        if removed > 0 {
            crate::metrics::set_workers(self.running_count());
        }
        removed
    }

    /// Start workers until `target` are running. Returns how many were started.
    ///
    /// A no-op in dry-run mode, where nothing is tracked and the floor would otherwise be
    /// "spawned" again on every tick.
    fn top_up(&mut self, target: usize) -> usize {
        if self.dry_run {
            return 0;
        }
        let missing = target.saturating_sub(self.running_count());
        let mut started = 0;
        for _ in 0..missing {
            if self.spawn_worker() {
                started += 1;
            }
        }
        if started > 0 {
            crate::metrics::set_workers(self.running_count());
        }
        started
    }

    /// Start workers until `min_workers` are running.
    pub fn ensure_min_workers(&mut self) -> usize {
        self.top_up(self.config.min_workers)
    }

    /// SIGTERM every tracked worker and wait up to [`SHUTDOWN_GRACE`] for them to exit.
    pub async fn shutdown_workers(&mut self) {
        if self.dry_run {
            self.workers.clear();
            return;
        }
        let pids: Vec<u32> = self.workers.iter().map(|w| w.pid).collect();
        for pid in pids {
            if let TerminateOutcome::Failed(reason) = self.launcher.terminate(pid) {
                tracing::error!(pid, error = %reason, "failed to terminate worker");
            }
        }
        for w in &mut self.workers {
            w.status = WorkerStatus::Stopping;
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.workers.is_empty() && Instant::now() < deadline {
            self.cleanup_dead_workers();
            if self.workers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for w in &self.workers {
            tracing::warn!(pid = w.pid, consumer = %w.consumer_name, "worker did not exit in time");
        }
        self.workers.clear();
        crate::metrics::set_workers(0);
    }

    /// Autoscale until `shutdown` resolves, then stop every worker.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            stream = %self.stream,
            group = %self.group,
            min = self.config.min_workers,
            max = self.config.max_workers,
            dry_run = self.dry_run,
            "scaling controller started"
        );
        if self.dry_run {
            tracing::info!(
                count = self.config.min_workers,
                "[DRY RUN] Would keep the minimum number of workers running"
            );
        }
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.cleanup_dead_workers();
                    self.ensure_min_workers();
                    self.make_scaling_decision().await;
                }
            }
        }
        tracing::info!("scaling controller stopping");
        self.shutdown_workers().await;
    }

    /// Keep exactly `count` workers alive until `shutdown` resolves, restarting any that
    /// exit, then stop them all.
    pub async fn run_static<F>(&mut self, count: usize, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(stream = %self.stream, group = %self.group, count, "static worker pool started");
        if self.dry_run {
            tracing::info!(count, "[DRY RUN] Would keep this many workers running");
        }
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.cleanup_dead_workers();
                    let started = self.top_up(count);
                    if started > 0 {
                        tracing::info!(started, "restarted workers");
                    }
                }
            }
        }
        self.shutdown_workers().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::broker::MemoryBroker;

    /// Launcher that tracks fake pids in memory.
    #[derive(Default)]
    struct FakeLauncher {
        next_pid: u32,
        alive: HashSet<u32>,
        spawned: Vec<String>,
        fail_spawn: bool,
    }

    impl WorkerLauncher for FakeLauncher {
        fn spawn(&mut self, consumer_name: &str) -> Result<u32> {
            if self.fail_spawn {
                return Err(crate::Error::Io(std::io::Error::other("no fork")));
            }
            self.next_pid += 1;
            self.alive.insert(self.next_pid);
            self.spawned.push(consumer_name.to_string());
            Ok(self.next_pid)
        }

        fn terminate(&mut self, pid: u32) -> TerminateOutcome {
            if self.alive.remove(&pid) {
                TerminateOutcome::Signalled
            } else {
                TerminateOutcome::AlreadyDead
            }
        }

        fn is_alive(&mut self, pid: u32) -> bool {
            self.alive.contains(&pid)
        }
    }

    fn controller(config: ScalingConfig) -> ScalingController<FakeLauncher> {
        ScalingController::new(
            config,
            Arc::new(MemoryBroker::new()),
            "s",
            "g",
            FakeLauncher::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn targets_follow_the_formulas() {
        let c = controller(ScalingConfig::default());
        assert_eq!(c.calculate_scale_up_target(10, 3), 6);
        assert_eq!(c.calculate_scale_up_target(100, 3), 10);
        assert_eq!(c.calculate_scale_up_target(0, 0), 1);
        assert_eq!(c.calculate_scale_down_target(0, 5), 4);
        assert_eq!(c.calculate_scale_down_target(0, 1), 1);
        assert!(c.should_scale_up(10, 3));
        assert!(!c.should_scale_up(6, 3));
        assert!(!c.should_scale_up(1000, 10));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = ScalingController::new(
            ScalingConfig {
                min_workers: 0,
                ..Default::default()
            },
            Arc::new(MemoryBroker::new()),
            "s",
            "g",
            FakeLauncher::default(),
        );
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_waits_for_idle_timeout() {
        let c = controller(ScalingConfig::default());
        assert!(!c.should_scale_down(0, 5));
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!c.should_scale_down(0, 5));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(c.should_scale_down(0, 5));
        assert!(!c.should_scale_down(2, 5));
        assert!(!c.should_scale_down(0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn scale_up_spawns_named_workers_and_respects_cooldown() {
        let mut c = controller(ScalingConfig::default());
        let event = c.decide(10).expect("scale up");
        assert_eq!(event.action, ScalingAction::ScaleUp);
        assert_eq!(event.target_count, 6);
        assert_eq!(event.reason, "threshold exceeded");
        assert_eq!(c.running_count(), 6);
        assert_eq!(c.launcher().spawned[0], "worker-1");
        assert_eq!(c.launcher().spawned[5], "worker-6");

        // 100 pending wants 10 workers but the cooldown holds.
        assert!(c.decide(100).is_none());
        tokio::time::advance(Duration::from_secs(60)).await;
        let event = c.decide(100).unwrap();
        assert_eq!(event.worker_count, 6);
        assert_eq!(c.running_count(), 10);
        assert_eq!(c.launcher().spawned.len(), 10);
        assert_eq!(c.history().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_pool_shrinks_one_at_a_time_to_the_floor() {
        let mut c = controller(ScalingConfig::default());
        c.decide(8);
        assert_eq!(c.running_count(), 5);
        tokio::time::advance(Duration::from_secs(300)).await;

        for expected in [4, 3, 2, 1] {
            let event = c.decide(0).unwrap();
            assert_eq!(event.action, ScalingAction::ScaleDown);
            assert_eq!(event.reason, "idle timeout");
            assert_eq!(c.running_count(), expected);
            c.cleanup_dead_workers();
            tokio::time::advance(Duration::from_secs(60)).await;
        }
        let event = c.decide(0).unwrap();
        assert_eq!(event.action, ScalingAction::NoChange);
        assert_eq!(event.target_count, 1);
        assert_eq!(c.workers().len(), 1);
        assert_eq!(c.workers()[0].consumer_name, "worker-1");
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_idle_clock() {
        let mut c = controller(ScalingConfig::default());
        c.decide(4);
        tokio::time::advance(Duration::from_secs(250)).await;
        c.decide(1);
        tokio::time::advance(Duration::from_secs(250)).await;
        assert!(!c.should_scale_down(0, c.running_count()));
    }

    #[tokio::test]
    async fn dry_run_tracks_nothing() {
        let mut c = controller(ScalingConfig::default()).with_dry_run(true);
        let event = c.decide(10).unwrap();
        assert_eq!(event.action, ScalingAction::ScaleUp);
        assert!(c.workers().is_empty());
        assert!(c.launcher().spawned.is_empty());
    }

    #[tokio::test]
    async fn dry_run_floor_spawns_nothing_and_keeps_names() {
        let mut c = controller(ScalingConfig {
            min_workers: 3,
            ..Default::default()
        })
        .with_dry_run(true);
        for _ in 0..5 {
            assert_eq!(c.ensure_min_workers(), 0);
        }
        assert!(c.launcher().spawned.is_empty());
        assert_eq!(c.next_worker, 0, "worker names must not be used up");
    }

    #[tokio::test(start_paused = true)]
    async fn scale_up_counts_stopping_workers_against_max() {
        // Arrange: a full pool of 3, one of which is then told to stop.
        let mut c = controller(ScalingConfig {
            max_workers: 3,
            ..Default::default()
        });
        assert_eq!(c.decide(10).unwrap().target_count, 3);
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(c.decide(0).unwrap().action, ScalingAction::ScaleDown);
        assert_eq!(c.running_count(), 2);
        assert_eq!(c.workers().len(), 3);
        tokio::time::advance(Duration::from_secs(60)).await;

        // Act: load returns before the stopping worker has been reaped.
        let deferred = c.decide(10);

        // Assert
        assert!(deferred.is_none());
        assert_eq!(c.launcher().spawned.len(), 3);
        assert_eq!(c.workers().len(), 3);

        // Once it is reaped there is room again.
        assert_eq!(c.cleanup_dead_workers(), 1);
        let event = c.decide(10).unwrap();
        assert_eq!(event.action, ScalingAction::ScaleUp);
        assert_eq!(c.running_count(), 3);
        assert_eq!(c.launcher().spawned.len(), 4);
    }

    #[tokio::test]
    async fn dead_workers_are_cleaned_and_replaced() {
        let mut c = controller(ScalingConfig {
            min_workers: 2,
            ..Default::default()
        });
        assert_eq!(c.ensure_min_workers(), 2);
        let pid = c.workers()[0].pid;
        c.launcher.alive.remove(&pid);
        assert_eq!(c.cleanup_dead_workers(), 1);
        assert_eq!(c.ensure_min_workers(), 1);
        assert_eq!(c.running_count(), 2);
        assert_eq!(c.launcher().spawned.last().unwrap(), "worker-3");
    }

    #[tokio::test]
    async fn spawn_failures_are_not_tracked() {
        let mut c = controller(ScalingConfig::default());
        c.launcher.fail_spawn = true;
        assert_eq!(c.ensure_min_workers(), 0);
        assert!(c.workers().is_empty());
    }

    #[tokio::test]
    async fn pending_count_comes_from_the_group() {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .create_group("s", "g", crate::types::StartId::NewOnly, true)
            .await
            .unwrap();
        for i in 0..3 {
            broker
                .append("s", &[("i".into(), i.to_string())], None, false)
                .await
                .unwrap();
        }
        broker
            .read_group("s", "g", "c", crate::types::ReadPosition::New, 10, Duration::ZERO)
            .await
            .unwrap();
        let mut c = ScalingController::new(
            ScalingConfig::default(),
            broker,
            "s",
            "g",
            FakeLauncher::default(),
        )
        .unwrap();
        assert_eq!(c.get_pending_count().await, 3);
        let event = c.make_scaling_decision().await.unwrap();
        assert_eq!(event.action, ScalingAction::ScaleUp);
        assert_eq!(event.target_count, 2);
    }

    #[tokio::test]
    async fn missing_group_counts_as_zero_pending() {
        let c = controller(ScalingConfig::default());
        assert_eq!(c.get_pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_workers_on_shutdown() {
        let mut c = controller(ScalingConfig {
            min_workers: 2,
            ..Default::default()
        });
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            let _ = tx.send(());
        });
        c.run(async {
            let _ = rx.await;
        })
        .await;
        assert!(c.workers().is_empty());
        assert!(c.launcher().alive.is_empty());
        assert_eq!(c.launcher().spawned.len(), 2);
        assert!(c.history().all(|e| e.action == ScalingAction::NoChange));
    }
}

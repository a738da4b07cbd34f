//! Integration tests for the worker pool controller.
//!
//! The control loops run on a paused tokio clock against the in-memory broker, with a
//! launcher that records spawns and terminations instead of starting processes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use streamfold::scaling::{
    ProcessLauncher, ScalingAction, ScalingConfig, ScalingController, TerminateOutcome,
    WorkerLauncher,
};
use streamfold::{EntryId, MemoryBroker, ReadPosition, StartId, StreamBroker};

/// Launcher whose liveness table is shared with the test.
#[derive(Clone, Default)]
struct RecordingLauncher {
    alive: Arc<Mutex<HashSet<u32>>>,
    spawned: Arc<Mutex<Vec<String>>>,
    terminated: Arc<Mutex<Vec<u32>>>,
    next_pid: u32,
}

impl RecordingLauncher {
    fn kill(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }
}

impl WorkerLauncher for RecordingLauncher {
    fn spawn(&mut self, consumer_name: &str) -> streamfold::Result<u32> {
        self.next_pid += 1;
        self.alive.lock().unwrap().insert(self.next_pid);
        self.spawned.lock().unwrap().push(consumer_name.to_string());
        Ok(self.next_pid)
    }

    fn terminate(&mut self, pid: u32) -> TerminateOutcome {
        self.terminated.lock().unwrap().push(pid);
        if self.alive.lock().unwrap().remove(&pid) {
            TerminateOutcome::Signalled
        } else {
            TerminateOutcome::AlreadyDead
        }
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }
}

/// Append `n` entries and deliver them to one consumer without acknowledging.
async fn make_pending(broker: &MemoryBroker, n: usize) -> Vec<EntryId> {
    broker
        .create_group("jobs", "workers", StartId::NewOnly, true)
        .await
        .unwrap();
    for i in 0..n {
        broker
            .append("jobs", &[("i".to_string(), i.to_string())], None, false)
            .await
            .unwrap();
    }
    broker
        .read_group("jobs", "workers", "busy", ReadPosition::New, n, Duration::ZERO)
        .await
        .unwrap()
        .into_iter()
        .map(|raw| raw.id)
        .collect()
}

fn shutdown_after(delay: Duration) -> impl std::future::Future<Output = ()> {
    async move { tokio::time::sleep(delay).await }
}

#[tokio::test(start_paused = true)]
async fn pool_grows_under_load_and_shrinks_when_idle() {
    let broker = Arc::new(MemoryBroker::new());
    let ids = make_pending(&broker, 10).await;
    let launcher = RecordingLauncher::default();
    let mut controller = ScalingController::new(
        ScalingConfig::default(),
        broker.clone(),
        "jobs",
        "workers",
        launcher.clone(),
    )
    .unwrap();

    // The backlog drains between the ticks at 20 s and 30 s.
    let acker = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(25)).await;
        acker.ack("jobs", "workers", &ids).await.unwrap();
    });

    controller.run(shutdown_after(Duration::from_secs(590))).await;

    let actions: Vec<ScalingAction> = controller
        .history()
        .map(|e| e.action)
        .filter(|a| *a != ScalingAction::NoChange)
        .collect();
    assert_eq!(actions[0], ScalingAction::ScaleUp);
    assert_eq!(
        actions[1..],
        [ScalingAction::ScaleDown; 5],
        "expected five single-step scale-downs, got {actions:?}"
    );

    let first = controller
        .history()
        .find(|e| e.action == ScalingAction::ScaleUp)
        .unwrap();
    assert_eq!(first.pending_count, 10);
    assert_eq!(first.worker_count, 1);
    assert_eq!(first.target_count, 6);

    let last_down = controller
        .history()
        .filter(|e| e.action == ScalingAction::ScaleDown)
        .last()
        .unwrap();
    assert_eq!(last_down.target_count, 1);

    assert_eq!(launcher.spawned.lock().unwrap().len(), 6);
    assert_eq!(launcher.terminated.lock().unwrap().len(), 6);
    assert!(launcher.alive.lock().unwrap().is_empty());
    assert!(controller.workers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn static_pool_restarts_exited_workers() {
    let broker = Arc::new(MemoryBroker::new());
    let launcher = RecordingLauncher::default();
    let mut controller = ScalingController::new(
        ScalingConfig::default(),
        broker,
        "jobs",
        "workers",
        launcher.clone(),
    )
    .unwrap();

    let killer = launcher.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        killer.kill(2);
    });

    controller
        .run_static(3, shutdown_after(Duration::from_secs(25)))
        .await;

    let spawned = launcher.spawned.lock().unwrap().clone();
    assert_eq!(spawned, vec!["worker-1", "worker-2", "worker-3", "worker-4"]);
    assert!(launcher.alive.lock().unwrap().is_empty());
    assert!(
        controller.history().next().is_none(),
        "static pools record no scaling events"
    );
}

#[tokio::test(start_paused = true)]
async fn dry_run_never_touches_processes() {
    let broker = Arc::new(MemoryBroker::new());
    make_pending(&broker, 10).await;
    let launcher = RecordingLauncher::default();
    let mut controller = ScalingController::new(
        ScalingConfig::default(),
        broker,
        "jobs",
        "workers",
        launcher.clone(),
    )
    .unwrap()
    .with_dry_run(true);

    controller.run(shutdown_after(Duration::from_secs(5))).await;

    assert!(launcher.spawned.lock().unwrap().is_empty());
    assert!(launcher.terminated.lock().unwrap().is_empty());
    let up = controller.history().next().unwrap();
    assert_eq!(up.action, ScalingAction::ScaleUp);
    assert_eq!(up.target_count, 6);
}

#[tokio::test]
async fn process_launcher_workers_stop_on_shutdown() {
    let launcher = ProcessLauncher::new("sh", vec!["-c".into(), "sleep 30".into(), "sh".into()]);
    let mut controller = ScalingController::new(
        ScalingConfig {
            min_workers: 2,
            ..ScalingConfig::default()
        },
        Arc::new(MemoryBroker::new()),
        "jobs",
        "workers",
        launcher,
    )
    .unwrap();

    assert_eq!(controller.ensure_min_workers(), 2);
    assert_eq!(controller.running_count(), 2);
    assert_eq!(controller.cleanup_dead_workers(), 0);

    tokio::time::timeout(Duration::from_secs(15), controller.shutdown_workers())
        .await
        .expect("workers should stop within the grace period");
    assert!(controller.workers().is_empty());
}

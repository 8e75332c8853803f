//! Lifecycle controller tests driven by a scripted coordinator and a
//! recording serving engine. Ticks are issued by hand except where the
//! clock task itself is under test.

use edge_node::coordinator::{Coordinator, NodeSession, TlsCert};
use edge_node::disk_cache::DiskCache;
use edge_node::lifecycle::{
    LifecycleConfig, NodeLifecycleController, NodeState, RequestActivity, ServingEngine,
    SessionHandle,
};
use edge_node::shutdown::ShutdownCoordinator;
use edge_node::statistics::{self, Statistics};
use edge_node::{NodeError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn session(image_server: &str, tls_created_at: &str) -> NodeSession {
    NodeSession {
        image_server: image_server.to_string(),
        latest_build: 13,
        url: Some("https://node.example".to_string()),
        compromised: false,
        tls: Some(TlsCert {
            created_at: tls_created_at.to_string(),
            private_key: "key".to_string(),
            certificate: "cert".to_string(),
        }),
    }
}

/// Coordinator that replays queued answers. An empty register queue
/// answers with a default session; an empty heartbeat queue echoes the
/// current session.
#[derive(Default)]
struct ScriptedCoordinator {
    registers: Mutex<VecDeque<Option<NodeSession>>>,
    heartbeats: Mutex<VecDeque<Option<NodeSession>>>,
    register_calls: AtomicUsize,
    heartbeat_calls: AtomicUsize,
    deregister_calls: AtomicUsize,
}

impl ScriptedCoordinator {
    fn queue_register(&self, answer: Option<NodeSession>) {
        self.registers.lock().unwrap().push_back(answer);
    }

    fn queue_heartbeat(&self, answer: Option<NodeSession>) {
        self.heartbeats.lock().unwrap().push_back(answer);
    }
}

impl Coordinator for ScriptedCoordinator {
    async fn register(&self) -> Option<NodeSession> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.registers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Some(session("https://img.example", "t1")))
    }

    async fn heartbeat(&self, current: &NodeSession) -> Option<NodeSession> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        self.heartbeats
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Some(current.clone()))
    }

    async fn deregister(&self) -> bool {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[derive(Clone, Default)]
struct EngineLog {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    sessions: Arc<Mutex<Vec<Arc<NodeSession>>>>,
}

struct RecordingEngine {
    log: EngineLog,
    fail_starts: bool,
}

impl ServingEngine for RecordingEngine {
    async fn start(&mut self, session: Arc<NodeSession>) -> Result<()> {
        if self.fail_starts {
            return Err(NodeError::IoError("bind failed".to_string()));
        }
        self.log.starts.fetch_add(1, Ordering::SeqCst);
        self.log.sessions.lock().unwrap().push(session);
        Ok(())
    }

    async fn stop(&mut self) {
        self.log.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    _temp_dir: TempDir,
    cache: Arc<DiskCache>,
    statistics: Arc<Statistics>,
    activity: RequestActivity,
    session: SessionHandle,
    coordinator: Arc<ScriptedCoordinator>,
    log: EngineLog,
}

fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        tick_interval: Duration::from_millis(10),
        heartbeat_every_ticks: 3,
        bandwidth_window_ticks: 10,
        drain_max_attempts: 2,
        hourly_bandwidth_cap: 100,
    }
}

fn harness() -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let cache = DiskCache::open(temp_dir.path(), 2, 13, 1024 * 1024).unwrap();
    Harness {
        _temp_dir: temp_dir,
        cache,
        statistics: Arc::new(Statistics::new()),
        activity: RequestActivity::new(),
        session: SessionHandle::new(),
        coordinator: Arc::new(ScriptedCoordinator::default()),
        log: EngineLog::default(),
    }
}

fn controller(
    h: &Harness,
    config: LifecycleConfig,
    fail_starts: bool,
) -> (
    NodeLifecycleController<ScriptedCoordinator, RecordingEngine>,
    edge_node::lifecycle::ControllerHandle,
) {
    NodeLifecycleController::new(
        config,
        Arc::clone(&h.coordinator),
        RecordingEngine {
            log: h.log.clone(),
            fail_starts,
        },
        Arc::clone(&h.cache),
        Arc::clone(&h.statistics),
        h.activity.clone(),
        h.session.clone(),
    )
}

async fn tick_n(
    controller: &mut NodeLifecycleController<ScriptedCoordinator, RecordingEngine>,
    n: usize,
) {
    for _ in 0..n {
        controller.tick().await;
    }
}

#[tokio::test]
async fn test_start_registers_and_serves() {
    let h = harness();
    let (mut controller, handle) = controller(&h, test_config(), false);

    controller.start().await.unwrap();

    assert_eq!(controller.state(), NodeState::Running);
    assert_eq!(handle.state(), NodeState::Running);
    assert_eq!(h.log.starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.get().unwrap().image_server, "https://img.example");
}

#[tokio::test]
async fn test_failed_registration_is_fatal() {
    let h = harness();
    h.coordinator.queue_register(None);
    let (mut controller, _handle) = controller(&h, test_config(), false);

    let result = controller.start().await;

    assert!(matches!(result, Err(NodeError::CoordinatorError(_))));
    assert_eq!(controller.state(), NodeState::Stopped);
    assert_eq!(h.log.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_engine_start_is_fatal() {
    let h = harness();
    let (mut controller, _handle) = controller(&h, test_config(), true);

    assert!(controller.start().await.is_err());
    assert_eq!(controller.state(), NodeState::Stopped);
    assert!(h.session.get().is_none());
}

#[tokio::test]
async fn test_heartbeat_every_third_tick() {
    let h = harness();
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();

    tick_n(&mut controller, 2).await;
    assert_eq!(h.coordinator.heartbeat_calls.load(Ordering::SeqCst), 0);
    tick_n(&mut controller, 1).await;
    assert_eq!(h.coordinator.heartbeat_calls.load(Ordering::SeqCst), 1);
    tick_n(&mut controller, 3).await;
    assert_eq!(h.coordinator.heartbeat_calls.load(Ordering::SeqCst), 2);

    // unchanged session: no restart
    assert_eq!(controller.state(), NodeState::Running);
    assert_eq!(h.log.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_heartbeat_keeps_serving() {
    let h = harness();
    h.coordinator.queue_heartbeat(None);
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();

    tick_n(&mut controller, 3).await;

    assert_eq!(controller.state(), NodeState::Running);
    assert_eq!(h.session.get().unwrap().tls_created_at(), Some("t1"));
    assert_eq!(h.log.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bandwidth_cap_suspends_until_window_reset() {
    let h = harness();
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();

    h.statistics.add_bytes_sent(150);

    // over the cap with plenty of window left: drain for suspension
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Draining);
    assert_eq!(h.coordinator.deregister_calls.load(Ordering::SeqCst), 1);

    // no requests during the drain: it completes on the next tick
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::BandwidthSuspended);
    assert_eq!(h.log.stops.load(Ordering::SeqCst), 1);

    tick_n(&mut controller, 7).await;
    assert_eq!(controller.state(), NodeState::BandwidthSuspended);
    assert_eq!(h.coordinator.register_calls.load(Ordering::SeqCst), 1);

    // tenth tick closes the window
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Running);
    assert_eq!(h.coordinator.register_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.log.starts.load(Ordering::SeqCst), 2);

    // the new window starts from the bytes already sent
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Running);
}

#[tokio::test]
async fn test_cap_reached_near_window_end_is_deferred() {
    let h = harness();
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();

    tick_n(&mut controller, 7).await;
    h.statistics.add_bytes_sent(150);

    // two ticks left is within the drain budget
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Running);
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Running);

    // window resets, usage is measured afresh
    tick_n(&mut controller, 2).await;
    assert_eq!(controller.state(), NodeState::Running);
    assert_eq!(h.coordinator.deregister_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_drain_waits_for_quiet_tick_within_budget() {
    let h = harness();
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();
    h.statistics.add_bytes_sent(150);

    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Draining);

    h.activity.mark();
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Draining);

    // still busy, but the budget of two attempts is spent
    h.activity.mark();
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::BandwidthSuspended);
}

#[tokio::test]
async fn test_certificate_change_restarts_engine() {
    let h = harness();
    h.coordinator
        .queue_heartbeat(Some(session("https://img.example", "t2")));
    h.coordinator
        .queue_register(Some(session("https://img.example", "t1")));
    h.coordinator
        .queue_register(Some(session("https://img.example", "t2")));
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();

    tick_n(&mut controller, 3).await;
    assert_eq!(controller.state(), NodeState::Draining);

    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Running);
    assert_eq!(h.log.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.log.starts.load(Ordering::SeqCst), 2);

    let sessions = h.log.sessions.lock().unwrap();
    assert_eq!(sessions.last().unwrap().tls_created_at(), Some("t2"));
}

#[tokio::test]
async fn test_image_server_change_restarts_engine() {
    let h = harness();
    h.coordinator
        .queue_heartbeat(Some(session("https://other.example", "t1")));
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();

    tick_n(&mut controller, 3).await;
    assert_eq!(controller.state(), NodeState::Draining);
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Running);
    assert_eq!(h.log.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_restart_with_failed_registration_retries_each_heartbeat() {
    let h = harness();
    h.coordinator
        .queue_heartbeat(Some(session("https://img.example", "t2")));
    h.coordinator
        .queue_register(Some(session("https://img.example", "t1")));
    h.coordinator.queue_register(None);
    h.coordinator.queue_register(None);
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();

    tick_n(&mut controller, 4).await;
    assert_eq!(controller.state(), NodeState::BandwidthSuspended);
    assert_eq!(h.log.starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.coordinator.register_calls.load(Ordering::SeqCst), 2);

    // sixth tick is a heartbeat tick: retry fails again
    tick_n(&mut controller, 2).await;
    assert_eq!(controller.state(), NodeState::BandwidthSuspended);
    assert_eq!(h.coordinator.register_calls.load(Ordering::SeqCst), 3);

    // ninth tick retries again, well before the window boundary
    tick_n(&mut controller, 2).await;
    assert_eq!(h.coordinator.register_calls.load(Ordering::SeqCst), 3);
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Running);
    assert_eq!(h.coordinator.register_calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.log.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shutdown_while_suspended_is_immediate() {
    let h = harness();
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();
    h.statistics.add_bytes_sent(150);
    tick_n(&mut controller, 2).await;
    assert_eq!(controller.state(), NodeState::BandwidthSuspended);

    controller.begin_shutdown().await;

    assert_eq!(controller.state(), NodeState::Stopped);
    assert!(h.cache.is_closed());
    assert!(h.session.get().is_none());
}

#[tokio::test]
async fn test_shutdown_during_suspend_drain_is_rebound() {
    let h = harness();
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();
    h.statistics.add_bytes_sent(150);
    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Draining);

    controller.begin_shutdown().await;
    assert_eq!(controller.state(), NodeState::Draining);

    tick_n(&mut controller, 1).await;
    assert_eq!(controller.state(), NodeState::Stopped);
    assert!(h.cache.is_closed());
}

#[tokio::test]
async fn test_shutdown_through_handle_drains_and_persists_statistics() {
    let h = harness();
    let (mut controller, handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();
    h.statistics.record_request();
    h.statistics.add_bytes_sent(42);

    let task = tokio::spawn(controller.run());
    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .unwrap()
        .unwrap();
    task.await.unwrap();

    assert_eq!(handle.state(), NodeState::Stopped);
    assert_eq!(h.coordinator.deregister_calls.load(Ordering::SeqCst), 1);
    assert!(h.log.stops.load(Ordering::SeqCst) >= 1);
    assert!(h.cache.is_closed());

    // reopen once every handle to the closed cache is gone
    let Harness {
        _temp_dir: temp_dir,
        cache,
        ..
    } = h;
    drop(cache);
    let reopened = DiskCache::open(temp_dir.path(), 2, 13, 1024 * 1024).unwrap();
    let snapshot = statistics::load(&reopened).unwrap().unwrap();
    assert_eq!(snapshot.requests_served, 1);
    assert_eq!(snapshot.bytes_sent, 42);
}

#[tokio::test]
async fn test_shutdown_coordinator_waits_for_stop() {
    let h = harness();
    let (mut controller, handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();
    let task = tokio::spawn(controller.run());

    let coordinator = ShutdownCoordinator::new(handle.clone(), Duration::from_secs(5));
    coordinator.initiate_shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(handle.state(), NodeState::Stopped);
    // a second request after stop is a no-op
    coordinator.initiate_shutdown().await.unwrap();
}

#[tokio::test]
async fn test_statistics_history_records_each_tick() {
    let h = harness();
    let (mut controller, _handle) = controller(&h, test_config(), false);
    controller.start().await.unwrap();

    tick_n(&mut controller, 5).await;

    assert_eq!(controller.history().len(), 5);
    let reopened = statistics::load(&h.cache).unwrap();
    assert!(reopened.is_some());
}

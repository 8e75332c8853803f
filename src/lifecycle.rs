//! Lifecycle Module
//!
//! State machine that keeps the node registered with the coordinator and
//! decides when the serving engine runs. Everything happens on one clock
//! task: ticks and external commands are handled one at a time, so the state
//! itself needs no locking.
//!
//! ```text
//!   STOPPED --start()--> RUNNING --over hourly cap--> DRAINING(suspend) --> BANDWIDTH_SUSPENDED
//!                          |  ^                                                  |
//!                          |  +------------- register at window boundary -------+
//!                          +--cert/upstream change--> DRAINING(restart) --> RUNNING
//!                                      failed register: BANDWIDTH_SUSPENDED, retried each heartbeat
//!   any state --shutdown()--> DRAINING(shutdown) --> STOPPED
//! ```

use crate::config::Config;
use crate::coordinator::{Coordinator, NodeSession, CLIENT_BUILD};
use crate::disk_cache::DiskCache;
use crate::statistics::{self, Statistics, StatisticsHistory};
use crate::{NodeError, Result};
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Externally visible controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Running,
    BandwidthSuspended,
    Draining,
}

/// What happens once a drain completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainAction {
    /// Stop the engine and wait for the next bandwidth window
    Suspend,
    /// Stop the engine, register again and restart it
    Restart,
    /// Stop the engine, persist statistics, close the cache and stop the clock
    Shutdown,
}

/// The component that actually serves requests.
pub trait ServingEngine: Send + 'static {
    /// Start serving with `session`.
    fn start(&mut self, session: Arc<NodeSession>) -> impl Future<Output = Result<()>> + Send;

    /// Stop serving. Stopping an engine that is not running is a no-op.
    fn stop(&mut self) -> impl Future<Output = ()> + Send;
}

/// Flag set by the serving path on every request and cleared by the clock.
#[derive(Debug, Clone, Default)]
pub struct RequestActivity(Arc<AtomicBool>);

impl RequestActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Return whether a request was seen since the last call, and reset.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

/// Current session shared with the serving path.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle(Arc<RwLock<Option<Arc<NodeSession>>>>);

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<NodeSession>> {
        self.0
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, session: Option<Arc<NodeSession>>) {
        *self
            .0
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
    }
}

/// Clock and drain parameters.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub tick_interval: Duration,
    pub heartbeat_every_ticks: u64,
    /// Length of the bandwidth accounting window
    pub bandwidth_window_ticks: u64,
    /// Ticks a drain may wait for in-flight requests
    pub drain_max_attempts: u64,
    /// Bytes allowed per window, 0 for unlimited
    pub hourly_bandwidth_cap: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            heartbeat_every_ticks: 3,
            bandwidth_window_ticks: 240,
            drain_max_attempts: 4,
            hourly_bandwidth_cap: 0,
        }
    }
}

impl LifecycleConfig {
    pub fn from_config(config: &Config) -> Self {
        let tick = config.server.tick_interval.max(Duration::from_millis(1));
        let hour = Duration::from_secs(3600);
        Self {
            tick_interval: tick,
            heartbeat_every_ticks: 3,
            bandwidth_window_ticks: (hour.as_millis() / tick.as_millis()).max(1) as u64,
            drain_max_attempts: (config.server.graceful_shutdown_wait.as_millis() / tick.as_millis())
                .max(1) as u64,
            hourly_bandwidth_cap: config.server.max_mebibytes_per_hour * 1024 * 1024,
        }
    }
}

enum Command {
    Shutdown(oneshot::Sender<()>),
}

struct Drain {
    action: DrainAction,
    attempts: u64,
    waiters: Vec<oneshot::Sender<()>>,
}

enum State {
    Stopped,
    Running,
    BandwidthSuspended,
    Draining(Drain),
}

impl State {
    fn public(&self) -> NodeState {
        match self {
            State::Stopped => NodeState::Stopped,
            State::Running => NodeState::Running,
            State::BandwidthSuspended => NodeState::BandwidthSuspended,
            State::Draining(_) => NodeState::Draining,
        }
    }
}

/// Handle used outside the clock task to observe the state and shut down.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<NodeState>,
}

impl ControllerHandle {
    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Drain and stop the node, returning once the cache is closed.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_err() {
            debug!("Lifecycle clock already exited");
            return Ok(());
        }

        match rx.await {
            Ok(()) => Ok(()),
            Err(_) if self.state() == NodeState::Stopped => Ok(()),
            Err(_) => Err(NodeError::SystemError(
                "lifecycle clock exited before shutdown completed".to_string(),
            )),
        }
    }
}

/// Orchestrates registration, heartbeats, bandwidth suspension and drains.
pub struct NodeLifecycleController<C: Coordinator, E: ServingEngine> {
    config: LifecycleConfig,
    coordinator: Arc<C>,
    engine: E,
    cache: Arc<DiskCache>,
    statistics: Arc<Statistics>,
    history: Arc<StatisticsHistory>,
    activity: RequestActivity,
    session: SessionHandle,
    state: State,
    tick_count: u64,
    window_ticks: u64,
    window_start_bytes: u64,
    /// Suspended by a failed re-registration rather than the bandwidth cap
    retry_registration: bool,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<NodeState>,
}

impl<C: Coordinator, E: ServingEngine> NodeLifecycleController<C, E> {
    pub fn new(
        config: LifecycleConfig,
        coordinator: Arc<C>,
        engine: E,
        cache: Arc<DiskCache>,
        statistics: Arc<Statistics>,
        activity: RequestActivity,
        session: SessionHandle,
    ) -> (Self, ControllerHandle) {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(NodeState::Stopped);

        let controller = Self {
            config,
            coordinator,
            engine,
            cache,
            statistics,
            history: Arc::new(StatisticsHistory::default()),
            activity,
            session,
            state: State::Stopped,
            tick_count: 0,
            window_ticks: 0,
            window_start_bytes: 0,
            retry_registration: false,
            commands: command_rx,
            state_tx,
        };
        let handle = ControllerHandle {
            commands: command_tx,
            state: state_rx,
        };
        (controller, handle)
    }

    pub fn state(&self) -> NodeState {
        self.state.public()
    }

    pub fn history(&self) -> Arc<StatisticsHistory> {
        Arc::clone(&self.history)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn set_state(&mut self, state: State) {
        let public = state.public();
        if public != self.state.public() {
            info!("Node state: {:?} -> {:?}", self.state.public(), public);
        }
        self.state = state;
        self.state_tx.send_replace(public);
    }

    /// Register and start serving.
    ///
    /// # Errors
    /// Registration failure or an engine that fails to start is fatal to
    /// startup.
    pub async fn start(&mut self) -> Result<()> {
        if !matches!(self.state, State::Stopped) {
            return Err(NodeError::SystemError(
                "controller already started".to_string(),
            ));
        }

        let session = self.coordinator.register().await.ok_or_else(|| {
            NodeError::CoordinatorError("initial registration failed".to_string())
        })?;
        self.begin_serving(session).await?;
        self.window_ticks = 0;
        self.window_start_bytes = self.statistics.bytes_sent();
        Ok(())
    }

    async fn begin_serving(&mut self, session: NodeSession) -> Result<()> {
        self.check_session(&session);
        let session = Arc::new(session);
        self.session.set(Some(Arc::clone(&session)));
        if let Err(e) = self.engine.start(session).await {
            self.session.set(None);
            return Err(e);
        }
        self.set_state(State::Running);
        Ok(())
    }

    fn check_session(&self, session: &NodeSession) {
        if session.latest_build > CLIENT_BUILD {
            warn!(
                "Outdated build: running {}, latest is {}",
                CLIENT_BUILD, session.latest_build
            );
        }
        if session.compromised {
            warn!("Coordinator reports this node's secret as compromised");
        }
    }

    /// Drive the clock until the node reaches `STOPPED`.
    pub async fn run(mut self) {
        let period = self.config.tick_interval;
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        info!("Lifecycle clock started: tick_interval={:?}", period);

        while !matches!(self.state, State::Stopped) {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::Shutdown(done)) => self.request_shutdown(Some(done)).await,
                    None => commands_open = false,
                },
            }
        }

        info!("Lifecycle clock stopped");
    }

    /// Run one clock tick.
    pub async fn tick(&mut self) {
        if matches!(self.state, State::Stopped) {
            return;
        }

        self.tick_count += 1;
        self.window_ticks += 1;
        let boundary = self.window_ticks >= self.config.bandwidth_window_ticks;
        if boundary {
            self.window_ticks = 0;
            self.window_start_bytes = self.statistics.bytes_sent();
            debug!("Bandwidth window reset");
        }

        self.flush_statistics();

        match &mut self.state {
            State::Stopped => {}
            State::Running => self.tick_running().await,
            State::BandwidthSuspended => {
                if boundary || (self.retry_registration && self.is_heartbeat_tick()) {
                    self.resume().await;
                }
            }
            State::Draining(drain) => {
                if boundary && drain.action == DrainAction::Suspend {
                    info!("Bandwidth window reset while draining, restarting instead");
                    drain.action = DrainAction::Restart;
                }
                drain.attempts += 1;
                let active = self.activity.take();
                if !active || drain.attempts >= self.config.drain_max_attempts {
                    debug!(
                        "Drain complete: attempts={}, requests_seen={}",
                        drain.attempts, active
                    );
                    self.complete_drain().await;
                }
            }
        }
    }

    async fn tick_running(&mut self) {
        let cap = self.config.hourly_bandwidth_cap;
        let used = self
            .statistics
            .bytes_sent()
            .saturating_sub(self.window_start_bytes);
        if cap > 0 && used > cap {
            let remaining = self
                .config
                .bandwidth_window_ticks
                .saturating_sub(self.window_ticks);
            if remaining > self.config.drain_max_attempts {
                info!(
                    "Hourly bandwidth cap reached: used={} bytes, cap={} bytes",
                    used, cap
                );
                self.enter_drain(DrainAction::Suspend, None).await;
                return;
            }
            debug!(
                "Hourly bandwidth cap reached but window ends in {} ticks, deferring",
                remaining
            );
        }

        if self.is_heartbeat_tick() {
            self.heartbeat().await;
        }
    }

    fn is_heartbeat_tick(&self) -> bool {
        self.tick_count % self.config.heartbeat_every_ticks.max(1) == 0
    }

    async fn heartbeat(&mut self) {
        let Some(current) = self.session.get() else {
            return;
        };
        let Some(next) = self.coordinator.heartbeat(&current).await else {
            return;
        };

        self.check_session(&next);
        let changed = next.tls_created_at() != current.tls_created_at()
            || next.image_server != current.image_server;
        self.session.set(Some(Arc::new(next)));

        if changed {
            info!("Certificate or image server changed, restarting engine");
            self.enter_drain(DrainAction::Restart, None).await;
        }
    }

    async fn resume(&mut self) {
        if self.retry_registration {
            info!("Retrying registration");
        } else {
            info!("Bandwidth window reset, resuming");
        }
        match self.coordinator.register().await {
            Some(session) => match self.begin_serving(session).await {
                Ok(()) => self.retry_registration = false,
                Err(e) => error!("Failed to start serving engine: {}", e),
            },
            None => warn!("Registration failed, staying suspended"),
        }
    }

    async fn enter_drain(&mut self, action: DrainAction, waiter: Option<oneshot::Sender<()>>) {
        info!("Draining before {:?}", action);
        if !self.coordinator.deregister().await {
            warn!("Deregistration failed, draining anyway");
        }
        self.activity.take();
        self.set_state(State::Draining(Drain {
            action,
            attempts: 0,
            waiters: waiter.into_iter().collect(),
        }));
    }

    async fn complete_drain(&mut self) {
        let (action, waiters) = match &mut self.state {
            State::Draining(drain) => (drain.action, std::mem::take(&mut drain.waiters)),
            _ => return,
        };

        self.engine.stop().await;

        match action {
            DrainAction::Suspend => {
                self.retry_registration = false;
                self.set_state(State::BandwidthSuspended);
            }
            DrainAction::Restart => match self.coordinator.register().await {
                Some(session) => {
                    if let Err(e) = self.begin_serving(session).await {
                        error!("Failed to restart serving engine: {}", e);
                        self.retry_registration = true;
                        self.set_state(State::BandwidthSuspended);
                    }
                }
                None => {
                    warn!("Registration failed during restart, retrying at the next heartbeat");
                    self.retry_registration = true;
                    self.set_state(State::BandwidthSuspended);
                }
            },
            DrainAction::Shutdown => self.finish_shutdown(),
        }

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Begin a graceful shutdown without waiting for it.
    pub async fn begin_shutdown(&mut self) {
        self.request_shutdown(None).await;
    }

    async fn request_shutdown(&mut self, waiter: Option<oneshot::Sender<()>>) {
        match &mut self.state {
            State::Draining(drain) => {
                info!("Shutdown requested during drain, rebinding");
                drain.action = DrainAction::Shutdown;
                drain.waiters.extend(waiter);
            }
            State::Running => self.enter_drain(DrainAction::Shutdown, waiter).await,
            State::BandwidthSuspended | State::Stopped => {
                info!("Shutdown requested while not serving");
                self.engine.stop().await;
                self.finish_shutdown();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(());
                }
            }
        }
    }

    fn finish_shutdown(&mut self) {
        self.session.set(None);
        if !self.cache.is_closed() {
            self.flush_statistics();
            if let Err(e) = self.cache.close() {
                error!("Failed to close cache: {}", e);
            }
        }
        self.set_state(State::Stopped);
    }

    fn flush_statistics(&self) {
        if self.cache.is_closed() {
            return;
        }
        self.statistics.set_bytes_on_disk(self.cache.size());
        let snapshot = self.statistics.snapshot();
        self.history.push(Utc::now(), snapshot.clone());
        if let Err(e) = statistics::persist(&self.cache, &snapshot) {
            error!("Failed to persist statistics: {}", e);
        }
    }
}

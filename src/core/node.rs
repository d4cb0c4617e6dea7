/// Connection pool and health state for one Riak node
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify, Semaphore, SemaphorePermit, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::core::connection::{ConnectOptions, Connection};
use crate::core::tls::SecurityContext;
use crate::core::Command;
use crate::error::{RiakError, RiakResult, TimeoutKind};
use crate::health::{self, HealthCheck, HealthTracker, PingHealthCheck, Transition};
use crate::utils::{format_duration, jitter, split_address};

/// Reaper never runs more often than this
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
}

/// Node lifecycle; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Created,
    Running,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Created => write!(f, "created"),
            NodeState::Running => write!(f, "running"),
            NodeState::ShuttingDown => write!(f, "shutting-down"),
            NodeState::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Default)]
struct Pool {
    /// Most recently returned at the back
    idle: VecDeque<Arc<Connection>>,
    in_use: HashMap<u64, Arc<Connection>>,
    opening: usize,
}

impl Pool {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.opening
    }
}

/// A pool of connections to one `host:port`
///
/// Every in-use or opening connection holds one permit of `slots`, so the
/// pool never exceeds `max_connections`. Idle connections hold none; a new
/// connection is only opened when no idle one is available.
pub struct Node {
    config: NodeConfig,
    options: ConnectOptions,
    queue_timeout: Option<Duration>,
    health_check: Arc<dyn HealthCheck>,
    slots: Semaphore,
    pool: Mutex<Pool>,
    tracker: HealthTracker,
    state: watch::Sender<NodeState>,
    replenish: Notify,
    active: AtomicUsize,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the connection to the pool before its slot is released
struct Lease<'a> {
    node: &'a Node,
    connection: Arc<Connection>,
    _slot: SemaphorePermit<'a>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.node.release(&self.connection);
    }
}

struct Opening<'a>(&'a Node);

impl Drop for Opening<'_> {
    fn drop(&mut self) {
        let mut pool = lock(&self.0.pool);
        pool.opening = pool.opening.saturating_sub(1);
    }
}

struct Active<'a>(&'a AtomicUsize);

impl<'a> Active<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Active(counter)
    }
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Node {
    /// Validate `config` and build TLS material; no sockets are opened
    pub fn new(config: NodeConfig) -> RiakResult<Self> {
        config.validate()?;
        let (host, _) = split_address(&config.address)
            .map_err(|e| RiakError::internal(format!("invalid node address: {}", e)))?;

        let security = match &config.security {
            Some(security) => Some(SecurityContext::from_config(security, &host)?),
            None => None,
        };

        let options = ConnectOptions {
            address: config.address.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            security,
        };
        let (state, _) = watch::channel(NodeState::Created);

        Ok(Self {
            slots: Semaphore::new(config.max_connections),
            tracker: HealthTracker::new(config.failure_threshold, config.success_threshold),
            options,
            queue_timeout: Some(Duration::from_secs(5)),
            health_check: Arc::new(PingHealthCheck::new()),
            pool: Mutex::new(Pool::default()),
            state,
            replenish: Notify::new(),
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    /// How long `execute` waits for a free slot; `None` fails fast with `PoolExhausted`
    pub fn with_queue_timeout(mut self, queue_timeout: Option<Duration>) -> Self {
        self.queue_timeout = queue_timeout;
        self
    }

    pub fn with_health_check(mut self, health_check: Arc<dyn HealthCheck>) -> Self {
        self.health_check = health_check;
        self
    }

    /// Start background connection maintenance and health checking
    ///
    /// Calling it on a running node is a no-op.
    pub fn start(self: &Arc<Self>) -> RiakResult<()> {
        let mut started = false;
        self.state.send_if_modified(|state| {
            if *state == NodeState::Created {
                *state = NodeState::Running;
                started = true;
            }
            started
        });

        if !started {
            return match self.state() {
                NodeState::Running => Ok(()),
                _ => Err(self.not_running()),
            };
        }

        let maintenance = tokio::spawn(self.clone().maintenance_loop(self.state.subscribe()));
        let health = tokio::spawn(self.clone().health_loop(self.state.subscribe()));
        lock(&self.tasks).extend([maintenance, health]);

        info!(
            "Node {} started (connections {}..{}, tls: {})",
            self.config.address,
            self.config.min_connections,
            self.config.max_connections,
            self.options.security.is_some()
        );
        Ok(())
    }

    /// Run `command` on a pooled connection
    pub async fn execute<C: Command + ?Sized>(&self, command: &mut C) -> RiakResult<()> {
        if self.state() != NodeState::Running {
            return Err(self.not_running());
        }
        let _active = Active::enter(&self.active);

        let slot = self.acquire_slot().await?;
        let connection = match self.checkout().await {
            Ok(connection) => connection,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };
        let lease = Lease {
            node: self,
            connection,
            _slot: slot,
        };

        let result = lease.connection.execute(command).await;
        match &result {
            Ok(()) => self.tracker.record_success(),
            Err(e) if e.counts_against_node() => self.record_failure(e),
            Err(_) => {}
        }
        result
    }

    async fn acquire_slot(&self) -> RiakResult<SemaphorePermit<'_>> {
        match self.queue_timeout {
            None => self.slots.try_acquire().map_err(|e| match e {
                TryAcquireError::NoPermits => RiakError::PoolExhausted {
                    address: self.config.address.clone(),
                },
                TryAcquireError::Closed => self.not_running(),
            }),
            Some(limit) => match timeout(limit, self.slots.acquire()).await {
                Ok(Ok(slot)) => Ok(slot),
                Ok(Err(_)) => Err(self.not_running()),
                Err(_) => Err(RiakError::timeout(TimeoutKind::Queue)),
            },
        }
    }

    /// Pop a ready idle connection or open a new one; the caller holds a slot
    async fn checkout(&self) -> RiakResult<Arc<Connection>> {
        {
            let mut pool = lock(&self.pool);
            let mut discarded = 0;
            while let Some(connection) = pool.idle.pop_back() {
                // a peer that hung up while we were idle says nothing about the node
                if connection.is_alive() {
                    pool.in_use.insert(connection.id(), connection.clone());
                    if discarded > 0 {
                        self.replenish.notify_one();
                    }
                    return Ok(connection);
                }
                connection.close();
                discarded += 1;
            }
            if discarded > 0 {
                debug!(
                    "Node {}: discarded {} dead idle connection(s)",
                    self.config.address, discarded
                );
                self.replenish.notify_one();
            }
            pool.opening += 1;
        }
        let opening = Opening(self);

        let connection = Arc::new(self.open_connection().await?);
        lock(&self.pool)
            .in_use
            .insert(connection.id(), connection.clone());
        drop(opening);
        Ok(connection)
    }

    async fn open_connection(&self) -> RiakResult<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Connection::connect(id, self.options.clone()).await
    }

    fn release(&self, connection: &Arc<Connection>) {
        let running = self.state() == NodeState::Running;
        let mut pool = lock(&self.pool);
        pool.in_use.remove(&connection.id());

        if running && connection.is_ready() {
            pool.idle.push_back(connection.clone());
            return;
        }

        connection.close();
        if running {
            if pool.total() < self.config.min_connections {
                self.replenish.notify_one();
            }
        } else if pool.in_use.is_empty() && self.state() == NodeState::ShuttingDown {
            drop(pool);
            self.state.send_if_modified(|state| {
                let done = *state == NodeState::ShuttingDown;
                if done {
                    *state = NodeState::Shutdown;
                }
                done
            });
        }
    }

    fn record_failure(&self, error: &RiakError) {
        debug!("Node {} failure: {}", self.config.address, error);
        if self.tracker.record_failure() == Some(Transition::BecameUnhealthy) {
            warn!(
                "Node {} marked unhealthy after {} consecutive failures: {}",
                self.config.address,
                self.tracker.consecutive_failures(),
                error
            );
        }
    }

    async fn maintenance_loop(self: Arc<Self>, mut state: watch::Receiver<NodeState>) {
        let reap_interval = (self.config.idle_timeout() / 2).max(MIN_REAP_INTERVAL);
        let mut reap = tokio::time::interval(reap_interval);
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.fill_to_min().await;
        loop {
            tokio::select! {
                _ = reap.tick() => self.reap_idle(),
                _ = self.replenish.notified() => {}
                _ = state.wait_for(|s| *s != NodeState::Running) => return,
            }
            self.fill_to_min().await;
        }
    }

    /// Open connections until the pool holds `min_connections`
    async fn fill_to_min(&self) {
        while self.state() == NodeState::Running {
            {
                let mut pool = lock(&self.pool);
                if pool.total() >= self.config.min_connections {
                    return;
                }
                pool.opening += 1;
            }
            let opening = Opening(self);

            // in-use connections will come back; don't fight executes for slots
            let Ok(_slot) = self.slots.try_acquire() else {
                return;
            };

            match self.open_connection().await {
                Ok(connection) => {
                    lock(&self.pool).idle.push_front(Arc::new(connection));
                    drop(opening);
                }
                Err(e) => {
                    self.record_failure(&e);
                    return;
                }
            }
        }
    }

    /// Close idle connections past their idle timeout or lifetime
    fn reap_idle(&self) {
        let idle_timeout = self.config.idle_timeout();
        let max_lifetime = self.config.max_lifetime();
        let mut closed = 0;

        let mut pool = lock(&self.pool);
        let mut total = pool.total();
        let mut keep = VecDeque::with_capacity(pool.idle.len());
        // oldest-used first
        while let Some(connection) = pool.idle.pop_front() {
            let retire = !connection.is_ready()
                || max_lifetime.map_or(false, |max| connection.age() >= max)
                || (total > self.config.min_connections
                    && connection.is_expired(idle_timeout, None));
            if retire {
                connection.close();
                total -= 1;
                closed += 1;
            } else {
                keep.push_back(connection);
            }
        }
        pool.idle = keep;
        drop(pool);

        if closed > 0 {
            trace!(
                "Node {}: reaped {} idle connection(s) (idle timeout {})",
                self.config.address,
                closed,
                format_duration(idle_timeout)
            );
        }
    }

    async fn health_loop(self: Arc<Self>, mut state: watch::Receiver<NodeState>) {
        let interval = self.config.health_check_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(jitter(interval, 0.1)) => {}
                _ = state.wait_for(|s| *s != NodeState::Running) => return,
            }
            self.run_health_check().await;
        }
    }

    async fn run_health_check(&self) {
        let slot = match self.slots.try_acquire() {
            Ok(slot) => slot,
            Err(_) => {
                trace!("Node {}: pool busy, skipping health check", self.config.address);
                return;
            }
        };

        let connection = match self.checkout().await {
            Ok(connection) => connection,
            Err(e) => {
                self.record_failure(&e);
                return;
            }
        };
        let lease = Lease {
            node: self,
            connection,
            _slot: slot,
        };

        let status = health::run_check(
            self.health_check.as_ref(),
            &lease.connection,
            self.config.health_check_timeout(),
        )
        .await;
        drop(lease);

        if status.is_healthy() {
            if self.tracker.record_check_success() == Some(Transition::BecameHealthy) {
                info!("Node {} is healthy again", self.config.address);
            }
        } else {
            debug!("Node {} health check: {}", self.config.address, status);
            if self.tracker.record_failure() == Some(Transition::BecameUnhealthy) {
                warn!(
                    "Node {} marked unhealthy by health check: {}",
                    self.config.address, status
                );
            }
        }
    }

    /// Stop background work and close idle connections; idempotent
    ///
    /// In-use connections are closed as their commands return.
    pub fn shutdown(&self) {
        let mut changed = false;
        self.state.send_if_modified(|state| {
            if *state < NodeState::ShuttingDown {
                *state = NodeState::ShuttingDown;
                changed = true;
            }
            changed
        });
        if !changed {
            return;
        }

        self.slots.close();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        let mut pool = lock(&self.pool);
        for connection in pool.idle.drain(..) {
            connection.close();
        }
        let drained = pool.in_use.is_empty();
        drop(pool);

        if drained {
            self.state.send_replace(NodeState::Shutdown);
        }
        info!("Node {} shut down", self.config.address);
    }

    /// Shut down and close in-use connections too
    pub fn force_close(&self) {
        self.shutdown();
        let mut pool = lock(&self.pool);
        for connection in pool.in_use.values() {
            connection.close();
        }
        pool.in_use.clear();
        drop(pool);
        self.state.send_replace(NodeState::Shutdown);
    }

    fn not_running(&self) -> RiakError {
        RiakError::NodeNotRunning {
            address: self.config.address.clone(),
        }
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn health(&self) -> NodeHealth {
        if self.tracker.is_healthy() {
            NodeHealth::Healthy
        } else {
            NodeHealth::Unhealthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.tracker.is_healthy()
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Executes currently inside this node, including those queued for a slot
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.pool).idle.len()
    }

    pub fn in_use_count(&self) -> usize {
        lock(&self.pool).in_use.len()
    }

    /// Idle plus in-use connections
    pub fn total_connections(&self) -> usize {
        let pool = lock(&self.pool);
        pool.idle.len() + pool.in_use.len()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.config.address)
            .field("state", &self.state())
            .field("health", &self.health())
            .field("active", &self.active_count())
            .finish()
    }
}

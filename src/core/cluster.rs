/// Cluster: node selection, retries and shutdown
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{watch, Notify, OnceCell};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{ClusterConfig, Config, ConfigError, NodeConfig};
use crate::core::balancer::{create_node_manager, NodeManager};
use crate::core::{Command, Node, NodeState};
use crate::error::{ErrorSeverity, RiakError, RiakResult, TimeoutKind};
use crate::health::HealthCheck;

/// Cluster lifecycle; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClusterState {
    Created,
    Running,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Created => write!(f, "created"),
            ClusterState::Running => write!(f, "running"),
            ClusterState::ShuttingDown => write!(f, "shutting-down"),
            ClusterState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Entry point for executing commands against a set of nodes
///
/// Each execute picks a healthy node through the `NodeManager`, and retries
/// recoverable failures on other nodes until the attempt budget is spent.
/// A request that may already have reached a server is only retried when
/// the command is idempotent.
pub struct Cluster {
    config: ClusterConfig,
    nodes: RwLock<Vec<Arc<Node>>>,
    node_manager: Box<dyn NodeManager>,
    state: watch::Sender<ClusterState>,
    in_flight: AtomicUsize,
    drained: Notify,
    shutdown: OnceCell<()>,
}

struct InFlight<'a>(&'a Cluster);

impl<'a> InFlight<'a> {
    fn enter(cluster: &'a Cluster) -> Self {
        cluster.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(cluster)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

impl Cluster {
    /// Cluster over already built nodes, in selection order
    pub fn new(config: ClusterConfig, nodes: Vec<Node>) -> RiakResult<Self> {
        config.validate()?;
        let queue_timeout = config.queue_timeout();
        let nodes = nodes
            .into_iter()
            .map(|node| Arc::new(node.with_queue_timeout(queue_timeout)))
            .collect();
        let (state, _) = watch::channel(ClusterState::Created);

        Ok(Self {
            node_manager: create_node_manager(config.selection),
            nodes: RwLock::new(nodes),
            state,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            shutdown: OnceCell::new(),
            config,
        })
    }

    /// Build every configured node
    pub fn from_config(config: &Config) -> RiakResult<Self> {
        Self::build(config, None)
    }

    /// Build every configured node with `health_check` replacing the default ping
    pub fn from_config_with(config: &Config, health_check: Arc<dyn HealthCheck>) -> RiakResult<Self> {
        Self::build(config, Some(health_check))
    }

    fn build(config: &Config, health_check: Option<Arc<dyn HealthCheck>>) -> RiakResult<Self> {
        config.validate()?;
        let nodes = config
            .nodes
            .iter()
            .map(|node| node_with(node.clone(), health_check.clone()))
            .collect::<RiakResult<Vec<_>>>()?;
        Self::new(config.cluster.clone(), nodes)
    }

    /// Replace the configured selection policy
    pub fn with_node_manager(mut self, node_manager: Box<dyn NodeManager>) -> Self {
        self.node_manager = node_manager;
        self
    }

    /// Start every node; a no-op when already running
    pub fn start(&self) -> RiakResult<()> {
        let mut started = false;
        self.state.send_if_modified(|state| {
            if *state == ClusterState::Created {
                *state = ClusterState::Running;
                started = true;
            }
            started
        });

        if !started {
            return match self.state() {
                ClusterState::Running => Ok(()),
                state => Err(RiakError::ClusterNotRunning {
                    state: state.to_string(),
                }),
            };
        }

        let nodes = self.nodes();
        for node in &nodes {
            node.start()?;
        }
        info!("Cluster started with {} node(s)", nodes.len());
        Ok(())
    }

    /// Execute `command` and return its output
    pub async fn execute<C: Command>(&self, mut command: C) -> RiakResult<C::Output> {
        let _in_flight = InFlight::enter(self);
        let state = self.state();
        if state != ClusterState::Running {
            return Err(RiakError::ClusterNotRunning {
                state: state.to_string(),
            });
        }

        let result = match self.config.execute_timeout() {
            Some(limit) => match timeout(limit, self.run(&mut command)).await {
                Ok(result) => result,
                Err(_) => Err(RiakError::timeout(TimeoutKind::Execute)),
            },
            None => self.run(&mut command).await,
        };

        match result {
            Ok(()) => Ok(command.into_output()),
            Err(e) => {
                match e.severity() {
                    ErrorSeverity::Critical | ErrorSeverity::Error => {
                        error!("{} failed: {}", command.name(), e)
                    }
                    ErrorSeverity::Warning => warn!("{} failed: {}", command.name(), e),
                    ErrorSeverity::Info => debug!("{} failed: {}", command.name(), e),
                }
                Err(e)
            }
        }
    }

    async fn run<C: Command>(&self, command: &mut C) -> RiakResult<()> {
        let budget = command
            .retries()
            .unwrap_or(self.config.execute_retry_count);
        let mut retries = 0;
        let mut last_failed: Option<String> = None;
        let mut last_error: Option<RiakError> = None;

        loop {
            let candidates = self.candidates(last_failed.as_deref());
            if candidates.is_empty() {
                // the previous failure may have just marked the last node unhealthy
                return Err(last_error.unwrap_or(RiakError::NoHealthyNodes));
            }

            let (error, address) = match self.attempt(candidates, command).await {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };

            let retryable = error.is_recoverable() && (!error.request_sent() || command.idempotent());
            if !retryable || retries >= budget || self.state() != ClusterState::Running {
                return Err(error);
            }

            retries += 1;
            warn!(
                "{} failed on {}: {}; retrying ({}/{})",
                command.name(),
                address.as_deref().unwrap_or("-"),
                error,
                retries,
                budget
            );
            command.reset();
            last_failed = address;
            last_error = Some(error);
        }
    }

    /// One attempt; nodes whose pool is exhausted are skipped in favour of the rest
    async fn attempt<C: Command>(
        &self,
        mut candidates: Vec<Arc<Node>>,
        command: &mut C,
    ) -> Result<(), (RiakError, Option<String>)> {
        loop {
            let node = match self.node_manager.select_node(&candidates) {
                Some(index) if index < candidates.len() => candidates.remove(index),
                _ => return Err((RiakError::NoHealthyNodes, None)),
            };
            debug!("Executing {} on {}", command.name(), node.address());

            match node.execute(command).await {
                Ok(()) => return Ok(()),
                Err(RiakError::PoolExhausted { address }) if !candidates.is_empty() => {
                    debug!("Pool for {} exhausted, trying another node", address);
                }
                Err(e) => return Err((e, Some(node.address().to_string()))),
            }
        }
    }

    /// Healthy running nodes, minus the node that just failed when others exist
    fn candidates(&self, exclude: Option<&str>) -> Vec<Arc<Node>> {
        let mut candidates: Vec<Arc<Node>> = self
            .read_nodes()
            .iter()
            .filter(|node| node.is_healthy() && node.state() == NodeState::Running)
            .cloned()
            .collect();

        if let Some(exclude) = exclude {
            if candidates.len() > 1 {
                candidates.retain(|node| node.address() != exclude);
            }
        }
        candidates
    }

    /// Stop accepting work, wait for in-flight executes, then close every node
    ///
    /// Concurrent and repeated calls all complete with the same shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.get_or_init(|| self.shutdown_inner()).await;
    }

    async fn shutdown_inner(&self) {
        self.state.send_if_modified(|state| {
            let changed = *state < ClusterState::ShuttingDown;
            if changed {
                *state = ClusterState::ShuttingDown;
            }
            changed
        });
        info!(
            "Cluster shutting down ({} execute(s) in flight)",
            self.in_flight.load(Ordering::Acquire)
        );

        let drained = timeout(self.config.shutdown_timeout(), self.wait_drained())
            .await
            .is_ok();

        for node in self.nodes() {
            if drained {
                node.shutdown();
            } else {
                node.force_close();
            }
        }
        if !drained {
            warn!(
                "Shutdown timeout elapsed, forced {} execute(s) closed",
                self.in_flight.load(Ordering::Acquire)
            );
        }

        self.state.send_replace(ClusterState::Shutdown);
        info!("Cluster shut down");
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Add a node; it is started immediately when the cluster is running
    pub fn add_node(&self, config: NodeConfig) -> RiakResult<Arc<Node>> {
        self.insert_node(node_with(config, None)?)
    }

    /// Add a node health-checked by `health_check` instead of the default ping
    pub fn add_node_with(
        &self,
        config: NodeConfig,
        health_check: Arc<dyn HealthCheck>,
    ) -> RiakResult<Arc<Node>> {
        self.insert_node(node_with(config, Some(health_check))?)
    }

    fn insert_node(&self, node: Node) -> RiakResult<Arc<Node>> {
        let node = Arc::new(node.with_queue_timeout(self.config.queue_timeout()));

        let mut nodes = self.write_nodes();
        if nodes.iter().any(|existing| existing.address() == node.address()) {
            return Err(ConfigError::ValidationError(format!(
                "node {} is already a member",
                node.address()
            ))
            .into());
        }
        match self.state() {
            ClusterState::Running => node.start()?,
            ClusterState::Created => {}
            state => {
                return Err(RiakError::ClusterNotRunning {
                    state: state.to_string(),
                })
            }
        }
        nodes.push(node.clone());
        drop(nodes);

        info!("Node {} added", node.address());
        Ok(node)
    }

    /// Remove a node and shut it down; in-flight commands on it complete
    pub fn remove_node(&self, address: &str) -> Option<Arc<Node>> {
        let node = {
            let mut nodes = self.write_nodes();
            let index = nodes.iter().position(|node| node.address() == address)?;
            nodes.remove(index)
        };
        node.shutdown();
        info!("Node {} removed", address);
        Some(node)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.read_nodes().clone()
    }

    pub fn state(&self) -> ClusterState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ClusterState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn read_nodes(&self) -> RwLockReadGuard<'_, Vec<Arc<Node>>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_nodes(&self) -> RwLockWriteGuard<'_, Vec<Arc<Node>>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn node_with(config: NodeConfig, health_check: Option<Arc<dyn HealthCheck>>) -> RiakResult<Node> {
    let node = Node::new(config)?;
    Ok(match health_check {
        Some(health_check) => node.with_health_check(health_check),
        None => node,
    })
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("state", &self.state())
            .field("nodes", &self.read_nodes().len())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

//! riak-pool - connection management core for Riak protocol-buffers clients
//!
//! Commands are written as length-prefixed frames over pooled TCP (optionally
//! TLS) connections. A `Cluster` spreads them over `Node`s, each of which owns
//! a bounded connection pool and a health state, and retries recoverable
//! failures on other nodes.
//!
//! ```no_run
//! use riak_pool::commands::Ping;
//! use riak_pool::config::{ClusterConfig, NodeConfig};
//! use riak_pool::{Cluster, Node};
//!
//! # async fn run() -> riak_pool::RiakResult<()> {
//! let node = Node::new(NodeConfig::new("127.0.0.1:8087"))?;
//! let cluster = Cluster::new(ClusterConfig::default(), vec![node])?;
//! cluster.start()?;
//! cluster.execute(Ping::new()).await?;
//! cluster.shutdown().await;
//! # Ok(())
//! # }
//! ```
pub mod codec;
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use crate::codec::{Frame, FrameBuffer, FrameCodec};
pub use crate::core::{
    Cluster, ClusterState, Command, Connection, ConnectionState, LeastActive, Node, NodeHealth,
    NodeManager, NodeState, RoundRobin,
};
pub use crate::error::{RiakError, RiakResult, ServerError};
pub use crate::health::{HealthCheck, HealthStatus};

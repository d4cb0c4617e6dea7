//! Core execution layer: connections, node pools and the cluster scheduler
pub mod balancer;
pub mod cluster;
pub mod connection;
pub mod node;
pub mod tls;

pub use balancer::{LeastActive, NodeManager, RoundRobin};
pub use cluster::{Cluster, ClusterState};
pub use connection::{Connection, ConnectionState};
pub use node::{Node, NodeHealth, NodeState};

use bytes::Bytes;

use crate::error::{RiakResult, ServerError};

/// Behaviour every request/response pair provides to the core
///
/// The cluster holds the command mutably for the whole execution, including
/// retries, and consumes it through `into_output` once a final response has
/// been accepted.
pub trait Command: Send {
    type Output: Send;

    /// Short name used in log events
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Message code of the request frame
    fn request_code(&self) -> u8;

    /// Message code every successful response frame must carry
    fn response_code(&self) -> u8;

    /// Serialized request body; `None` sends a code-only frame
    fn encode_body(&self) -> RiakResult<Option<Bytes>>;

    /// Consume one response frame, returning `true` when it is the last one
    fn on_response(&mut self, body: Option<Bytes>) -> RiakResult<bool>;

    /// Notification of an error response; return `true` to close the connection
    fn on_server_error(&mut self, _error: &ServerError) -> bool {
        false
    }

    /// Retry budget overriding the cluster default
    fn retries(&self) -> Option<u32> {
        None
    }

    /// Whether re-sending after the request reached the server is safe
    fn idempotent(&self) -> bool {
        false
    }

    /// Discard partial state before another attempt
    fn reset(&mut self) {}

    fn into_output(self) -> Self::Output
    where
        Self: Sized;
}

/// Unified error handling for riak-pool
///
/// Every layer (codec, connection, node, cluster) reports failures through
/// `RiakError`. The cluster is the only component that retries, and it uses
/// `is_recoverable` and `request_sent` to decide.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for riak-pool operations
#[derive(Debug, Error)]
pub enum RiakError {
    /// Raw socket errors not attributed to a specific phase
    #[error("Network error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TCP connect failed (refused, timed out, name resolution)
    #[error("Connect to {address} failed: {message}")]
    Connect { address: String, message: String },

    /// StartTls or authentication exchange failed
    #[error("Handshake with {address} failed: {message}")]
    Handshake { address: String, message: String },

    /// Framing violation or unexpected response code
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request would not fit in one frame
    #[error("Request frame of {length} bytes exceeds limit {limit}")]
    FrameTooLarge { length: usize, limit: usize },

    /// A command could not decode a well-framed response body
    #[error("Decode error: {0}")]
    Decode(String),

    /// The peer closed the socket or a read/write failed mid-exchange
    #[error("Connection to {address} lost: {message}")]
    ConnectionLost {
        address: String,
        message: String,
        request_sent: bool,
    },

    /// The connection was closed locally before or during the exchange
    #[error("Connection closed")]
    ConnectionClosed,

    /// A second command was submitted while one is in flight
    #[error("Connection busy: a command is already in flight")]
    ConnectionBusy,

    /// Well-formed error response from the server
    #[error("Server error: {0}")]
    Server(ServerError),

    /// Timeout errors
    #[error("Operation timed out: {kind}")]
    Timeout { kind: TimeoutKind, request_sent: bool },

    /// Node pool is at its connection limit and queueing is disabled
    #[error("Connection pool for {address} exhausted")]
    PoolExhausted { address: String },

    /// Every node in the cluster is unhealthy
    #[error("No healthy nodes available")]
    NoHealthyNodes,

    /// Node was not started or is shutting down
    #[error("Node {address} is not running")]
    NodeNotRunning { address: String },

    /// Cluster was not started or is shutting down
    #[error("Cluster is not running (state: {state})")]
    ClusterNotRunning { state: String },

    /// TLS material could not be loaded or the session could not be set up
    #[error("TLS error: {0}")]
    Tls(String),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Error response sent by the server (`RpbErrorResp`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u32,
    pub message: String,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Which deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Request,
    Queue,
    Execute,
    HealthCheck,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Request => write!(f, "request"),
            TimeoutKind::Queue => write!(f, "queue"),
            TimeoutKind::Execute => write!(f, "execute"),
            TimeoutKind::HealthCheck => write!(f, "health check"),
        }
    }
}

/// Result type alias for riak-pool operations
pub type RiakResult<T> = Result<T, RiakError>;

/// Convenience methods for creating specific error types
impl RiakError {
    pub fn connect<A: Into<String>, S: Into<String>>(address: A, message: S) -> Self {
        RiakError::Connect {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn handshake<A: Into<String>, S: Into<String>>(address: A, message: S) -> Self {
        RiakError::Handshake {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        RiakError::Protocol(message.into())
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        RiakError::Decode(message.into())
    }

    pub fn timeout(kind: TimeoutKind) -> Self {
        RiakError::Timeout {
            kind,
            request_sent: false,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        RiakError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (another attempt may succeed)
    pub fn is_recoverable(&self) -> bool {
        match self {
            RiakError::Io(_) => true,
            RiakError::Connect { .. } => true,
            RiakError::Handshake { .. } => true,
            RiakError::Protocol(_) => true,
            RiakError::ConnectionLost { .. } => true,
            RiakError::ConnectionClosed => true,
            RiakError::Timeout { kind, .. } => *kind != TimeoutKind::Execute,
            RiakError::NodeNotRunning { .. } => true,
            _ => false,
        }
    }

    /// Whether request bytes may have reached the server before the failure
    pub fn request_sent(&self) -> bool {
        match self {
            RiakError::ConnectionLost { request_sent, .. } => *request_sent,
            RiakError::Timeout { request_sent, .. } => *request_sent,
            // A protocol error means a response was read, so the request went out
            RiakError::Protocol(_) => true,
            RiakError::Server(_) | RiakError::Decode(_) => true,
            _ => false,
        }
    }

    /// Whether the failure says something about the node rather than the command
    pub fn counts_against_node(&self) -> bool {
        matches!(
            self,
            RiakError::Io(_)
                | RiakError::Connect { .. }
                | RiakError::Handshake { .. }
                | RiakError::ConnectionLost { .. }
                | RiakError::Timeout {
                    kind: TimeoutKind::Request | TimeoutKind::HealthCheck,
                    ..
                }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RiakError::Config(_) => ErrorSeverity::Critical,
            RiakError::Internal { .. } => ErrorSeverity::Critical,
            RiakError::Tls(_) => ErrorSeverity::Critical,
            RiakError::Io(_) => ErrorSeverity::Warning,
            RiakError::Connect { .. } => ErrorSeverity::Warning,
            RiakError::ConnectionLost { .. } => ErrorSeverity::Warning,
            RiakError::Timeout { .. } => ErrorSeverity::Warning,
            RiakError::PoolExhausted { .. } => ErrorSeverity::Warning,
            RiakError::Server(_) => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }

    /// Mark a transport failure as having happened after the request was written
    pub(crate) fn after_write(self) -> Self {
        match self {
            RiakError::ConnectionLost {
                address, message, ..
            } => RiakError::ConnectionLost {
                address,
                message,
                request_sent: true,
            },
            RiakError::Timeout { kind, .. } => RiakError::Timeout {
                kind,
                request_sent: true,
            },
            other => other,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

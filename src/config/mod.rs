/// Configuration management for riak-pool

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::split_address;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster-wide execution settings
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Server nodes, in selection order
    pub nodes: Vec<NodeConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    RoundRobin,
    LeastActive,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// How a node is picked for each command
    pub selection: SelectionPolicy,
    /// How long an execute may wait for a pool slot; 0 fails fast
    pub queue_timeout_ms: u64,
    /// Retries after the first attempt, unless a command overrides it
    pub execute_retry_count: u32,
    /// Bound on one execute including retries; 0 disables
    pub execute_timeout_ms: u64,
    /// How long shutdown waits for in-flight commands before forcing closure
    pub shutdown_timeout_ms: u64,
}

/// Per-node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// host:port of the protocol-buffers listener
    pub address: String,
    #[serde(default = "defaults::min_connections")]
    pub min_connections: usize,
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-frame response deadline; 0 disables
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Idle connections above `min_connections` are closed after this long
    #[serde(default = "defaults::idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Connections older than this are retired; 0 disables
    #[serde(default)]
    pub max_lifetime_ms: u64,
    #[serde(default = "defaults::health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "defaults::health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    /// Consecutive failures before the node is marked unhealthy
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successful health checks before it is healthy again
    #[serde(default = "defaults::success_threshold")]
    pub success_threshold: u32,
    /// TLS upgrade and authentication; absent means plain TCP
    #[serde(default)]
    pub security: Option<SecurityConfig>,
}

/// TLS and authentication settings for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// PEM bundle of trusted CAs; the webpki roots are used when absent
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate chain for certificate authentication
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Overrides the host part of the address for SNI and verification
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default = "defaults::verify_peer")]
    pub verify_peer: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

mod defaults {
    pub fn min_connections() -> usize {
        1
    }
    pub fn max_connections() -> usize {
        16
    }
    pub fn connect_timeout_ms() -> u64 {
        3000
    }
    pub fn request_timeout_ms() -> u64 {
        5000
    }
    pub fn idle_timeout_ms() -> u64 {
        10_000
    }
    pub fn health_check_interval_ms() -> u64 {
        5000
    }
    pub fn health_check_timeout_ms() -> u64 {
        2000
    }
    pub fn failure_threshold() -> u32 {
        3
    }
    pub fn success_threshold() -> u32 {
        1
    }
    pub fn verify_peer() -> bool {
        true
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            selection: SelectionPolicy::RoundRobin,
            queue_timeout_ms: 5000,
            execute_retry_count: 2,
            execute_timeout_ms: 0,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            nodes: vec![NodeConfig::new("127.0.0.1:8087")],
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Node configuration with defaults for everything but the address
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            min_connections: defaults::min_connections(),
            max_connections: defaults::max_connections(),
            connect_timeout_ms: defaults::connect_timeout_ms(),
            request_timeout_ms: defaults::request_timeout_ms(),
            idle_timeout_ms: defaults::idle_timeout_ms(),
            max_lifetime_ms: 0,
            health_check_interval_ms: defaults::health_check_interval_ms(),
            health_check_timeout_ms: defaults::health_check_timeout_ms(),
            failure_threshold: defaults::failure_threshold(),
            success_threshold: defaults::success_threshold(),
            security: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        split_address(&self.address).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid node address '{}': {}", self.address, e))
        })?;

        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: max_connections must be greater than 0",
                self.address
            )));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::ValidationError(format!(
                "{}: min_connections ({}) exceeds max_connections ({})",
                self.address, self.min_connections, self.max_connections
            )));
        }

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: connect_timeout_ms must be greater than 0",
                self.address
            )));
        }

        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: health_check_interval_ms must be greater than 0",
                self.address
            )));
        }

        if self.health_check_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: health_check_timeout_ms must be greater than 0",
                self.address
            )));
        }

        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: idle_timeout_ms must be greater than 0",
                self.address
            )));
        }

        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: health thresholds must be greater than 0",
                self.address
            )));
        }

        if let Some(security) = &self.security {
            security.validate()?;
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        non_zero_millis(self.max_lifetime_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "security.username cannot be empty".to_string(),
            ));
        }

        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::ValidationError(
                "security.cert_file and security.key_file must be set together".to_string(),
            ));
        }

        Ok(())
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "shutdown_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.queue_timeout_ms)
    }

    pub fn execute_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.execute_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cluster.validate()?;

        if self.nodes.is_empty() {
            return Err(ConfigError::ValidationError(
                "nodes cannot be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !seen.insert(node.address.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate node address: {}",
                    node.address
                )));
            }
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, secure: bool) -> Result<(), ConfigError> {
        let mut nodes: Vec<NodeConfig> = ["10.0.1.10:8087", "10.0.1.11:8087", "10.0.1.12:8087"]
            .iter()
            .map(|address| NodeConfig::new(*address))
            .collect();

        if secure {
            for node in &mut nodes {
                node.security = Some(SecurityConfig {
                    username: "riakuser".to_string(),
                    password: Some("change-me".to_string()),
                    ca_file: Some(PathBuf::from("certs/ca.pem")),
                    cert_file: None,
                    key_file: None,
                    server_name: None,
                    verify_peer: true,
                });
            }
        }

        let config = Config {
            nodes,
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

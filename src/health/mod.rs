//! Node health checking
//!
//! A `HealthCheck` runs against one borrowed connection; the `HealthTracker`
//! turns a stream of outcomes into Healthy/Unhealthy transitions using
//! consecutive-failure and consecutive-success thresholds.
pub mod ping;

pub use ping::{CommandHealthCheck, PingHealthCheck};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::core::Connection;

/// Outcome of one health check
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Probe the node over `connection`
    async fn check(&self, connection: &Connection) -> HealthStatus;
}

/// Run `checker` bounded by `limit`
pub async fn run_check(
    checker: &dyn HealthCheck,
    connection: &Connection,
    limit: Duration,
) -> HealthStatus {
    match timeout(limit, checker.check(connection)).await {
        Ok(status) => status,
        Err(_) => {
            // the exchange was abandoned mid-flight
            connection.close();
            HealthStatus::Timeout
        }
    }
}

/// Health change caused by a recorded outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameHealthy,
    BecameUnhealthy,
}

/// Consecutive outcome counters for one node
#[derive(Debug)]
pub struct HealthTracker {
    failure_threshold: u32,
    success_threshold: u32,
    healthy: AtomicBool,
    failures: AtomicU32,
    successes: AtomicU32,
}

impl HealthTracker {
    /// Thresholds below 1 are treated as 1
    pub fn new(failure_threshold: u32, success_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            healthy: AtomicBool::new(true),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn record_failure(&self) -> Option<Transition> {
        self.successes.store(0, Ordering::Release);
        let failures = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if failures >= self.failure_threshold
            && self
                .healthy
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Some(Transition::BecameUnhealthy);
        }
        None
    }

    /// A successful command; clears the failure streak but never revives an
    /// unhealthy node on its own
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
    }

    /// A successful health check
    pub fn record_check_success(&self) -> Option<Transition> {
        self.failures.store(0, Ordering::Release);
        if self.is_healthy() {
            return None;
        }
        let successes = self.successes.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if successes >= self.success_threshold
            && self
                .healthy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.successes.store(0, Ordering::Release);
            return Some(Transition::BecameHealthy);
        }
        None
    }
}

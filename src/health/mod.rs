/// Cluster monitoring
///
/// Periodically checks every known server and keeps the topology current:
/// successful checks refresh role and latency, failed ones mark the server
/// unreachable so selection skips it.
pub mod handshake;

use crate::cluster::{Cluster, ClusterStats};
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use handshake::HandshakeChecker;

/// Outcome of one server check
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
    /// Check if the status represents a healthy server
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Check one server. Implementations may update the topology themselves.
    async fn check_health(&self, address: &str) -> HealthStatus;

    /// Get the check interval for this health checker
    fn check_interval(&self) -> Duration;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// Runs a [`HealthChecker`] over every server in a cluster
pub struct ClusterMonitor {
    checker: Box<dyn HealthChecker>,
    cluster: Arc<Cluster>,
}

impl ClusterMonitor {
    pub fn new(checker: Box<dyn HealthChecker>, cluster: Arc<Cluster>) -> Self {
        Self { checker, cluster }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Perform health check with timeout
    pub async fn check_server(&self, address: &str) -> HealthStatus {
        let check_timeout = self.checker.check_timeout();

        let status = match timeout(check_timeout, self.checker.check_health(address)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };

        if !status.is_healthy() {
            self.cluster.mark_unreachable(address);
        }

        status
    }

    /// Check every known server once. Checks run concurrently; results keep
    /// topology order.
    pub async fn check_all(&self) -> Vec<(String, HealthStatus)> {
        let addresses: Vec<String> = self
            .cluster
            .snapshot()
            .servers()
            .iter()
            .map(|server| server.address.clone())
            .collect();

        let statuses = join_all(addresses.iter().map(|address| self.check_server(address))).await;

        let results: Vec<(String, HealthStatus)> = addresses.into_iter().zip(statuses).collect();
        for (address, status) in &results {
            match status {
                HealthStatus::Healthy => {
                    debug!("Server {} is healthy", address);
                }
                HealthStatus::Unhealthy { reason } => {
                    warn!("Server {} is unhealthy: {}", address, reason);
                }
                HealthStatus::Timeout => {
                    warn!("Health check timeout for server {}", address);
                }
                HealthStatus::Unknown => {
                    warn!("Unknown health status for server {}", address);
                }
            }
        }
        results
    }

    /// Run continuous checking until the task is dropped or aborted.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.checker.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_stats = None;

        loop {
            interval.tick().await;
            self.check_all().await;

            let stats = self.cluster.stats();
            if last_stats
                .as_ref()
                .map_or(true, |last: &ClusterStats| !last.same_shape(&stats))
            {
                info!("Cluster: {}", stats);
                last_stats = Some(stats);
            } else {
                debug!("Cluster unchanged: {}", stats);
            }
        }
    }

    /// Run the monitor on its own task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }
}

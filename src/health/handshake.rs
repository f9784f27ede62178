/// Identity handshake health checker
use super::{HealthChecker, HealthStatus};
use crate::cluster::factory::ConnectionFactory;
use crate::config::MonitorConfig;
use crate::core::codec::Codec;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Checks a server by opening a fresh connection and running the identity
/// handshake on it. The factory records the reported role and round trip.
pub struct HandshakeChecker<C: Codec> {
    factory: Arc<ConnectionFactory<C>>,
    check_interval: Duration,
    check_timeout: Duration,
}

impl<C: Codec> HandshakeChecker<C> {
    pub fn new(factory: Arc<ConnectionFactory<C>>, config: &MonitorConfig) -> Self {
        Self {
            factory,
            check_interval: config.interval(),
            check_timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl<C: Codec> HealthChecker for HandshakeChecker<C> {
    async fn check_health(&self, address: &str) -> HealthStatus {
        match self.factory.connect_to(address).await {
            Ok(connection) => {
                connection.close().await;
                HealthStatus::Healthy
            }
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    fn check_interval(&self) -> Duration {
        self.check_interval
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}

/// Reconnect and failover policy
///
/// Stateless apart from its configuration: every call reads a fresh cluster
/// snapshot, asks the selector for a server and retries with exponential
/// backoff until it connects or runs out of attempts or time.
use super::selector::{Routing, ServerSelector};
use super::Cluster;
use crate::config::ReconnectConfig;
use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Something that can open a connection to an address
#[async_trait]
pub trait Connect: Send + Sync {
    type Connection: Send;

    async fn connect_to(&self, address: &str) -> DriverResult<Self::Connection>;
}

/// Delays slept between consecutive attempts
pub fn backoff_schedule(config: &ReconnectConfig) -> Vec<Duration> {
    let cap = config.max_backoff();
    let mut delay = config.initial_backoff();
    (1..config.max_attempts)
        .map(|_| {
            let current = delay.min(cap);
            delay = delay.saturating_mul(2);
            current
        })
        .collect()
}

pub struct ReconnectStrategy<K: Connect> {
    connector: Arc<K>,
    cluster: Arc<Cluster>,
    selector: Arc<dyn ServerSelector>,
    routing: Routing,
    config: ReconnectConfig,
}

impl<K: Connect> ReconnectStrategy<K> {
    pub fn new(
        connector: Arc<K>,
        cluster: Arc<Cluster>,
        selector: Arc<dyn ServerSelector>,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            connector,
            cluster,
            selector,
            routing: Routing::Primary,
            config,
        }
    }

    /// Routing requirement the replacement server must satisfy
    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Find and connect to a replacement for the connection to `previous`.
    ///
    /// When no known server is eligible, `previous` itself is retried.
    pub async fn reconnect(&self, previous: &str) -> DriverResult<K::Connection> {
        let started = Instant::now();
        let delays = backoff_schedule(&self.config);
        let budget = self.config.time_budget();
        let mut attempts = 0u32;
        let mut last_error = String::from("no attempt made");

        info!("Reconnecting after losing {}", previous);
        while attempts < self.config.max_attempts {
            if attempts > 0 {
                let delay = delays
                    .get(attempts as usize - 1)
                    .copied()
                    .unwrap_or_else(|| self.config.max_backoff());
                if started.elapsed() + delay > budget {
                    debug!("Reconnect time budget of {:?} exhausted", budget);
                    break;
                }
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            let snapshot = self.cluster.snapshot();
            let address = match self.selector.select(snapshot.servers(), &self.routing) {
                Ok(server) => server.address,
                Err(e) => {
                    debug!("{}; retrying {}", e, previous);
                    previous.to_string()
                }
            };

            match self.connector.connect_to(&address).await {
                Ok(connection) => {
                    info!("Reconnected to {} after {} attempts", address, attempts);
                    return Ok(connection);
                }
                Err(e) => {
                    warn!("Reconnect attempt {} to {} failed: {}", attempts, address, e);
                    self.cluster.mark_unreachable(&address);
                    last_error = e.to_string();
                }
            }
        }

        Err(DriverError::ReconnectExhausted {
            attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::selector::LatencyWindowSelector;
    use crate::core::{HandshakeResult, ServerRole};
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct MockConnector {
        live: HashSet<String>,
        attempts: Mutex<Vec<String>>,
    }

    impl MockConnector {
        fn new(live: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                live: live.iter().map(|s| s.to_string()).collect(),
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connect for MockConnector {
        type Connection = String;

        async fn connect_to(&self, address: &str) -> DriverResult<String> {
            self.attempts.lock().unwrap().push(address.to_string());
            if self.live.contains(address) {
                Ok(address.to_string())
            } else {
                Err(DriverError::connect(format!("{} refused", address)))
            }
        }
    }

    fn fast_config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            time_budget_ms: 5_000,
        }
    }

    fn cluster_with(servers: &[(&str, ServerRole)]) -> Arc<Cluster> {
        let cluster = Arc::new(Cluster::default());
        for (address, role) in servers {
            let handshake = HandshakeResult {
                role: *role,
                ..Default::default()
            };
            cluster.add_or_update(address, &handshake, Duration::from_millis(1));
        }
        cluster
    }

    fn selector() -> Arc<dyn ServerSelector> {
        Arc::new(LatencyWindowSelector::new(Duration::from_millis(15)))
    }

    #[test]
    fn test_backoff_schedule_doubles_and_caps() {
        let config = ReconnectConfig {
            max_attempts: 6,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            time_budget_ms: 30_000,
        };
        let millis: Vec<u128> = backoff_schedule(&config)
            .iter()
            .map(Duration::as_millis)
            .collect();
        assert_eq!(millis, vec![100, 200, 400, 500, 500]);

        assert!(backoff_schedule(&fast_config(1)).is_empty());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let cluster = cluster_with(&[("a:27017", ServerRole::Mongos)]);
        let connector = MockConnector::new(&[]);
        let strategy = ReconnectStrategy::new(
            Arc::clone(&connector),
            Arc::clone(&cluster),
            selector(),
            fast_config(3),
        );

        match strategy.reconnect("a:27017").await {
            Err(DriverError::ReconnectExhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("refused"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(connector.attempts().len(), 3);
        assert!(!cluster.get("a:27017").unwrap().reachable);
    }

    #[tokio::test]
    async fn test_fails_over_to_another_server() {
        let cluster = cluster_with(&[
            ("a:27017", ServerRole::Mongos),
            ("b:27017", ServerRole::Mongos),
        ]);
        let connector = MockConnector::new(&["b:27017"]);
        let strategy = ReconnectStrategy::new(
            Arc::clone(&connector),
            Arc::clone(&cluster),
            selector(),
            fast_config(5),
        )
        .with_routing(Routing::Nearest);

        let connected = strategy.reconnect("a:27017").await.unwrap();
        assert_eq!(connected, "b:27017");
        assert!(connector.attempts().len() <= 2);
    }

    #[tokio::test]
    async fn test_retries_previous_when_nothing_eligible() {
        let cluster = Arc::new(Cluster::default());
        let connector = MockConnector::new(&["a:27017"]);
        let strategy = ReconnectStrategy::new(
            Arc::clone(&connector),
            cluster,
            selector(),
            fast_config(2),
        );

        assert_eq!(strategy.reconnect("a:27017").await.unwrap(), "a:27017");
        assert_eq!(connector.attempts(), vec!["a:27017".to_string()]);
    }

    #[tokio::test]
    async fn test_time_budget_stops_early() {
        let connector = MockConnector::new(&[]);
        let config = ReconnectConfig {
            max_attempts: 10,
            initial_backoff_ms: 50,
            max_backoff_ms: 50,
            time_budget_ms: 20,
        };
        let strategy =
            ReconnectStrategy::new(Arc::clone(&connector), Arc::new(Cluster::default()), selector(), config);

        match strategy.reconnect("a:27017").await {
            Err(DriverError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

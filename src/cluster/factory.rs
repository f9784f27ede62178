/// Connection factory
///
/// Opens sockets to cluster members, runs the identity handshake on each new
/// connection and feeds the result into the shared topology.
use super::reconnect::{Connect, ReconnectStrategy};
use super::selector::{self, Routing, ServerSelector};
use super::Cluster;
use crate::config::Config;
use crate::core::codec::Codec;
use crate::core::connection::{Connection, ConnectionConfig};
use crate::core::HandshakeResult;
use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use socket2::SockRef;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct ConnectionFactory<C: Codec> {
    config: Config,
    connection_config: ConnectionConfig,
    codec: Arc<C>,
    cluster: Arc<Cluster>,
    selector: Arc<dyn ServerSelector>,
}

impl<C: Codec> ConnectionFactory<C> {
    /// Build a factory with a fresh topology and the configured selector.
    pub fn new(config: Config, codec: C) -> Self {
        let cluster = Arc::new(Cluster::new(config.selection.latency_smoothing));
        let selector = selector::from_config(&config.selection);
        Self::with_parts(config, Arc::new(codec), cluster, selector)
    }

    /// Build a factory around an existing topology and selector.
    pub fn with_parts(
        config: Config,
        codec: Arc<C>,
        cluster: Arc<Cluster>,
        selector: Arc<dyn ServerSelector>,
    ) -> Self {
        let connection_config = ConnectionConfig::from(&config.client);
        Self {
            config,
            connection_config,
            codec,
            cluster,
            selector,
        }
    }

    /// Connect to the first seed that answers, trying seeds in random order.
    pub async fn connect(&self) -> DriverResult<Arc<Connection<C>>> {
        let mut seeds = self.config.client.servers.clone();
        for seed in &seeds {
            self.cluster.add(seed);
        }
        seeds.shuffle(&mut rand::thread_rng());

        let mut last_error = None;
        for seed in &seeds {
            match self.connect_to(seed).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!("Seed {} unavailable: {}", seed, e);
                    last_error = Some(e);
                }
            }
        }

        Err(DriverError::connect(match last_error {
            Some(e) => format!("no seed reachable, last error: {}", e),
            None => "no seed addresses configured".to_string(),
        }))
    }

    /// Open a connection to `address` and run the identity handshake on it.
    ///
    /// The address is marked unreachable if either step fails.
    pub async fn connect_to(&self, address: &str) -> DriverResult<Arc<Connection<C>>> {
        self.cluster.add(address);

        let stream = match self.open_socket(address).await {
            Ok(stream) => stream,
            Err(e) => {
                self.cluster.mark_unreachable(address);
                return Err(e);
            }
        };

        let connection = Connection::open(
            stream,
            address,
            Arc::clone(&self.codec),
            self.connection_config.clone(),
        );

        match self.identify(&connection).await {
            Ok(handshake) => {
                info!(
                    "Connected to {} ({}, wire version {})",
                    address, handshake.role, handshake.wire_version
                );
                Ok(connection)
            }
            Err(e) => {
                connection.close().await;
                self.cluster.mark_unreachable(address);
                Err(DriverError::connect(format!(
                    "handshake with {} failed: {}",
                    address, e
                )))
            }
        }
    }

    /// Connect to a server chosen for `routing`.
    pub async fn connect_for(&self, routing: Routing) -> DriverResult<Arc<Connection<C>>> {
        let snapshot = self.cluster.snapshot();
        let server = self.selector.select(snapshot.servers(), &routing)?;
        debug!("Selected {} for {} routing", server.address, routing);
        self.connect_to(&server.address).await
    }

    /// Run the identity handshake over `connection` and record the outcome.
    ///
    /// The round trip feeds the latency average and the advertised message
    /// size limit is applied to the connection.
    pub async fn identify(&self, connection: &Connection<C>) -> DriverResult<HandshakeResult> {
        let limit = self.config.client.connect_timeout();
        let started = Instant::now();

        let reply = connection.send(self.codec.identity_request()?).await?;
        let reply = timeout(limit, reply)
            .await
            .map_err(|_| DriverError::timeout(format!("handshake with {}", connection.address())))??;
        let round_trip = started.elapsed();

        let handshake = self.codec.parse_identity(&reply)?;
        connection.set_max_message_size(handshake.max_message_size);
        self.cluster
            .add_or_update(connection.address(), &handshake, round_trip);
        debug!(
            "{}: handshake took {:?}, role {}",
            connection.name(),
            round_trip,
            handshake.role
        );
        Ok(handshake)
    }

    async fn open_socket(&self, address: &str) -> DriverResult<TcpStream> {
        let limit = self.config.client.connect_timeout();
        let stream = timeout(limit, TcpStream::connect(address))
            .await
            .map_err(|_| DriverError::timeout(format!("connect to {}", address)))?
            .map_err(|e| DriverError::connect(format!("{}: {}", address, e)))?;

        let socket = SockRef::from(&stream);
        if let Err(e) = socket.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }
        if self.config.client.keepalive {
            if let Err(e) = socket.set_keepalive(true) {
                warn!("Failed to enable keepalive for {}: {}", address, e);
            }
        }

        Ok(stream)
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn selector(&self) -> &Arc<dyn ServerSelector> {
        &self.selector
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    pub fn connect_timeout(&self) -> Duration {
        self.config.client.connect_timeout()
    }

    /// Reconnect policy that opens connections through this factory
    pub fn reconnect_strategy(self: Arc<Self>) -> ReconnectStrategy<Self> {
        let cluster = Arc::clone(&self.cluster);
        let selector = Arc::clone(&self.selector);
        let config = self.config.reconnect.clone();
        let routing = self.config.selection.default_routing;
        ReconnectStrategy::new(self, cluster, selector, config).with_routing(routing)
    }
}

#[async_trait]
impl<C: Codec> Connect for ConnectionFactory<C> {
    type Connection = Arc<Connection<C>>;

    async fn connect_to(&self, address: &str) -> DriverResult<Arc<Connection<C>>> {
        ConnectionFactory::connect_to(self, address).await
    }
}

/// Client facade over the cluster
///
/// Keeps one pipelined connection per server and routes each request to a
/// server picked for its routing requirement. A connection found closed is
/// replaced through the reconnect strategy, and requests it never wrote are
/// carried over to the replacement.
use crate::cluster::factory::ConnectionFactory;
use crate::cluster::selector::Routing;
use crate::cluster::{Cluster, ClusterStats};
use crate::config::Config;
use crate::core::codec::Codec;
use crate::core::connection::{Connection, ConnectionState};
use crate::core::envelope::ReplyHandle;
use crate::error::{DriverError, DriverResult};
use fnv::FnvHashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct Client<C: Codec> {
    factory: Arc<ConnectionFactory<C>>,
    connections: Mutex<FnvHashMap<String, Arc<Connection<C>>>>,
    /// Serializes opening and replacing per address
    openers: std::sync::Mutex<FnvHashMap<String, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl<C: Codec> Client<C> {
    /// Connect to the configured seeds and keep the first live connection.
    pub async fn connect(config: Config, codec: C) -> DriverResult<Self> {
        let factory = Arc::new(ConnectionFactory::new(config, codec));
        let seed = factory.connect().await?;

        let client = Self::from_factory(factory);
        client
            .connections
            .lock()
            .await
            .insert(seed.address().to_string(), seed);
        Ok(client)
    }

    pub fn from_factory(factory: Arc<ConnectionFactory<C>>) -> Self {
        Self {
            factory,
            connections: Mutex::new(FnvHashMap::default()),
            openers: std::sync::Mutex::new(FnvHashMap::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Send a request to a server satisfying `routing`.
    pub async fn send(&self, request: C::Request, routing: Routing) -> DriverResult<ReplyHandle<C::Reply>> {
        let connection = self.connection_for(routing).await?;
        connection.send(request).await
    }

    /// Send a request using the configured default routing.
    pub async fn send_default(&self, request: C::Request) -> DriverResult<ReplyHandle<C::Reply>> {
        self.send(request, self.default_routing()).await
    }

    /// Send a request that expects no reply.
    pub async fn send_no_reply(&self, request: C::Request, routing: Routing) -> DriverResult<()> {
        let connection = self.connection_for(routing).await?;
        connection.send_no_reply(request).await
    }

    /// Open connection to a server chosen for `routing`.
    ///
    /// The connection map is only locked for lookups and inserts. Opening or
    /// replacing a connection holds the opener for that address alone.
    pub async fn connection_for(&self, routing: Routing) -> DriverResult<Arc<Connection<C>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::ConnectionClosed);
        }

        let snapshot = self.factory.cluster().snapshot();
        let server = self.factory.selector().select(snapshot.servers(), &routing)?;
        if let Some(connection) = self.cached(&server.address).await {
            return Ok(connection);
        }

        let opener = self.opener(&server.address);
        let _opening = opener.lock().await;

        let dead = self.connections.lock().await.get(&server.address).cloned();
        let connection = match dead {
            Some(connection) if connection.is_open() => return Ok(connection),
            Some(dead) => {
                self.evict(&dead).await;
                let replacement = self.replace(&dead, routing).await;
                self.retire(dead);
                replacement?
            }
            None => {
                debug!("Opening connection to {} for {} routing", server.address, routing);
                self.factory.connect_to(&server.address).await?
            }
        };
        self.cache(connection).await
    }

    async fn cached(&self, address: &str) -> Option<Arc<Connection<C>>> {
        self.connections
            .lock()
            .await
            .get(address)
            .filter(|connection| connection.is_open())
            .cloned()
    }

    fn opener(&self, address: &str) -> Arc<Mutex<()>> {
        let mut openers = self.openers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(openers.entry(address.to_string()).or_default())
    }

    /// Drop `dead` from the map unless another caller already replaced it.
    async fn evict(&self, dead: &Arc<Connection<C>>) {
        let mut connections = self.connections.lock().await;
        if connections
            .get(dead.address())
            .map_or(false, |cached| Arc::ptr_eq(cached, dead))
        {
            connections.remove(dead.address());
        }
    }

    /// Publish `connection`, retiring whatever it displaces.
    async fn cache(&self, connection: Arc<Connection<C>>) -> DriverResult<Arc<Connection<C>>> {
        let previous = self
            .connections
            .lock()
            .await
            .insert(connection.address().to_string(), Arc::clone(&connection));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &connection) {
                debug!("Replacing cached connection {}", previous.name());
                self.retire(previous);
            }
        }

        // A close that ran while this connection was being opened has already
        // drained the map.
        if self.closed.load(Ordering::Acquire) {
            self.connections.lock().await.remove(connection.address());
            connection.close().await;
            return Err(DriverError::ConnectionClosed);
        }
        Ok(connection)
    }

    /// Let a connection that is no longer cached finish its outstanding work.
    fn retire(&self, connection: Arc<Connection<C>>) {
        if connection.state() == ConnectionState::Closed {
            return;
        }
        let limit = self.factory.config().reconnect.time_budget();
        tokio::spawn(async move {
            connection.shutdown().await;
            if !connection.wait_for_closed(limit).await {
                connection.close().await;
            }
        });
    }

    async fn replace(
        &self,
        dead: &Arc<Connection<C>>,
        routing: Routing,
    ) -> DriverResult<Arc<Connection<C>>> {
        warn!("Connection {} is {}, replacing it", dead.name(), dead.state());
        let unsent = dead.drain_pending();

        let strategy = Arc::clone(&self.factory)
            .reconnect_strategy()
            .with_routing(routing);
        let replacement = match strategy.reconnect(dead.address()).await {
            Ok(connection) => connection,
            Err(e) => {
                for envelope in unsent {
                    envelope.fail(e.duplicate());
                }
                return Err(e);
            }
        };

        if !unsent.is_empty() {
            info!(
                "Moving {} unsent requests from {} to {}",
                unsent.len(),
                dead.name(),
                replacement.name()
            );
            replacement.add_pending(unsent).await?;
        }
        Ok(replacement)
    }

    /// Close every connection. Later sends fail with `ConnectionClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        let count = connections.len();
        join_all(connections.iter().map(|(address, connection)| async move {
            debug!("Closing connection to {}", address);
            connection.close().await
        }))
        .await;
        info!("Client closed {} connections", count);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of cached connections, open or not
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub fn default_routing(&self) -> Routing {
        self.factory.config().selection.default_routing
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        self.factory.cluster()
    }

    pub fn stats(&self) -> ClusterStats {
        self.factory.cluster().stats()
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory<C>> {
        &self.factory
    }
}

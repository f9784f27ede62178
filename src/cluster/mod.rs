/// Cluster topology tracking
///
/// Holds one record per server address the client has heard of. Readers take an
/// immutable snapshot; writers build a modified copy and swap it in, so a
/// snapshot can be iterated while handshakes keep updating the cluster.
pub mod factory;
pub mod reconnect;
pub mod selector;

use crate::core::{HandshakeResult, ServerRecord, ServerRole};
use fnv::FnvHashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Default weight of a new latency sample
pub const DEFAULT_LATENCY_SMOOTHING: f64 = 0.25;

/// Shape of the deployment, derived from server roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    StandAlone,
    ReplicaSet,
    Sharded,
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterType::StandAlone => write!(f, "standalone"),
            ClusterType::ReplicaSet => write!(f, "replica set"),
            ClusterType::Sharded => write!(f, "sharded"),
        }
    }
}

/// Immutable view of the cluster at one point in time
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    servers: Vec<ServerRecord>,
    index: FnvHashMap<String, usize>,
    cluster_type: ClusterType,
}

impl ClusterSnapshot {
    fn empty() -> Self {
        Self {
            servers: Vec::new(),
            index: FnvHashMap::default(),
            cluster_type: ClusterType::StandAlone,
        }
    }

    /// Records in the order their addresses were first seen
    pub fn servers(&self) -> &[ServerRecord] {
        &self.servers
    }

    pub fn get(&self, address: &str) -> Option<&ServerRecord> {
        self.index.get(address).map(|&i| &self.servers[i])
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.cluster_type
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Reachable servers that accept writes
    pub fn writable(&self) -> impl Iterator<Item = &ServerRecord> {
        self.servers.iter().filter(|s| s.is_writable())
    }

    /// Reachable servers that do not accept writes
    pub fn non_writable(&self) -> impl Iterator<Item = &ServerRecord> {
        self.servers
            .iter()
            .filter(|s| s.reachable && !s.role.is_writable())
    }

    fn entry(&mut self, address: &str) -> &mut ServerRecord {
        let next = self.servers.len();
        let i = *self.index.entry(address.to_string()).or_insert(next);
        if i == next {
            self.servers.push(ServerRecord::new(address));
        }
        &mut self.servers[i]
    }

    fn classify(&self) -> ClusterType {
        if self.servers.iter().any(|s| s.role == ServerRole::Mongos) {
            ClusterType::Sharded
        } else if self
            .servers
            .iter()
            .any(|s| s.role.is_replica_set_member() || s.set_name.is_some())
        {
            ClusterType::ReplicaSet
        } else {
            ClusterType::StandAlone
        }
    }
}

/// Summary counts for logging and the CLI
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStats {
    pub cluster_type: ClusterType,
    pub servers: usize,
    pub reachable: usize,
    pub writable: usize,
    /// Mean over servers with a latency sample
    pub mean_latency: Option<Duration>,
}

impl ClusterStats {
    /// Same type and counts; latency drift alone is not a topology change.
    pub fn same_shape(&self, other: &ClusterStats) -> bool {
        self.cluster_type == other.cluster_type
            && self.servers == other.servers
            && self.reachable == other.reachable
            && self.writable == other.writable
    }
}

impl fmt::Display for ClusterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} servers, {} reachable, {} writable",
            self.cluster_type, self.servers, self.reachable, self.writable
        )?;
        if let Some(latency) = self.mean_latency {
            write!(f, ", mean latency {:?}", latency)?;
        }
        Ok(())
    }
}

/// Shared, internally synchronized topology
#[derive(Debug)]
pub struct Cluster {
    state: RwLock<Arc<ClusterSnapshot>>,
    smoothing: f64,
}

impl Cluster {
    /// `smoothing` is the weight of each new latency sample, in (0, 1].
    pub fn new(smoothing: f64) -> Self {
        let smoothing = if smoothing > 0.0 && smoothing <= 1.0 {
            smoothing
        } else {
            DEFAULT_LATENCY_SMOOTHING
        };
        Self {
            state: RwLock::new(Arc::new(ClusterSnapshot::empty())),
            smoothing,
        }
    }

    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Copy, modify and publish a new snapshot.
    fn update<R>(&self, change: impl FnOnce(&mut ClusterSnapshot) -> R) -> R {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = ClusterSnapshot::clone(&current);
        let result = change(&mut next);

        let shape = next.classify();
        if shape != next.cluster_type {
            info!("Cluster shape changed from {} to {}", next.cluster_type, shape);
            next.cluster_type = shape;
        }

        *current = Arc::new(next);
        result
    }

    /// Register an address if it has not been seen yet.
    pub fn add(&self, address: &str) -> ServerRecord {
        if let Some(record) = self.get(address) {
            return record;
        }
        self.update(|snapshot| {
            let record = snapshot.entry(address);
            debug!("Added server {}", address);
            record.clone()
        })
    }

    /// Apply a handshake result and a round-trip sample.
    pub fn add_or_update(
        &self,
        address: &str,
        handshake: &HandshakeResult,
        round_trip: Duration,
    ) -> ServerRecord {
        let smoothing = self.smoothing;
        self.update(|snapshot| {
            let record = snapshot.entry(address);
            if record.role != handshake.role {
                debug!(
                    "Server {} role changed from {} to {}",
                    address, record.role, handshake.role
                );
            }

            record.role = handshake.role;
            record.wire_version = handshake.wire_version;
            record.max_message_size = handshake.max_message_size;
            record.set_name = handshake.set_name.clone();
            record.latency = Some(smooth(record.latency, round_trip, smoothing));
            record.last_contact = Some(SystemTime::now());
            record.reachable = true;
            record.clone()
        })
    }

    /// Fold a latency sample into a known server's average.
    pub fn update_latency(&self, address: &str, sample: Duration) -> Option<ServerRecord> {
        self.get(address)?;
        let smoothing = self.smoothing;
        Some(self.update(|snapshot| {
            let record = snapshot.entry(address);
            record.latency = Some(smooth(record.latency, sample, smoothing));
            record.last_contact = Some(SystemTime::now());
            record.clone()
        }))
    }

    /// Flag a server as not answering. The record itself is kept.
    pub fn mark_unreachable(&self, address: &str) -> bool {
        match self.get(address) {
            Some(record) if record.reachable => {}
            Some(_) => return true,
            None => return false,
        }
        self.update(|snapshot| {
            snapshot.entry(address).reachable = false;
        });
        info!("Server {} marked unreachable", address);
        true
    }

    pub fn get(&self, address: &str) -> Option<ServerRecord> {
        self.snapshot().get(address).cloned()
    }

    pub fn servers(&self) -> Vec<ServerRecord> {
        self.snapshot().servers().to_vec()
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.snapshot().cluster_type()
    }

    pub fn writable_servers(&self) -> Vec<ServerRecord> {
        self.snapshot().writable().cloned().collect()
    }

    pub fn non_writable_servers(&self) -> Vec<ServerRecord> {
        self.snapshot().non_writable().cloned().collect()
    }

    pub fn stats(&self) -> ClusterStats {
        let snapshot = self.snapshot();
        let latencies: Vec<Duration> = snapshot.servers().iter().filter_map(|s| s.latency).collect();
        let mean_latency = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<Duration>() / latencies.len() as u32)
        };

        ClusterStats {
            cluster_type: snapshot.cluster_type(),
            servers: snapshot.len(),
            reachable: snapshot.servers().iter().filter(|s| s.reachable).count(),
            writable: snapshot.writable().count(),
            mean_latency,
        }
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_SMOOTHING)
    }
}

/// Exponentially weighted moving average; the first sample is taken as is.
fn smooth(previous: Option<Duration>, sample: Duration, alpha: f64) -> Duration {
    match previous {
        None => sample,
        Some(old) => {
            Duration::from_secs_f64(alpha * sample.as_secs_f64() + (1.0 - alpha) * old.as_secs_f64())
        }
    }
}

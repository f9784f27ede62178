pub mod client;
pub mod cluster;
pub mod config;
/// Corredor - pipelined MongoDB wire-protocol transport with cluster awareness
///
/// Corredor keeps pipelined connections to the members of a MongoDB deployment:
/// 1. Transport: each connection writes queued requests from one task and
///    matches replies in send order on another
/// 2. Cluster: server identities from handshakes feed a shared topology that
///    selection, reconnect and monitoring all read from
pub mod core;
pub mod error;
pub mod health;
pub mod protocol;
pub mod utils;

pub use crate::client::Client;
pub use crate::cluster::factory::ConnectionFactory;
pub use crate::cluster::reconnect::{Connect, ReconnectStrategy};
pub use crate::cluster::selector::{LatencyWindowSelector, RoundRobinSelector, Routing, ServerSelector};
pub use crate::cluster::{Cluster, ClusterSnapshot, ClusterStats, ClusterType};
pub use crate::config::Config;
pub use crate::core::codec::{Codec, Frame};
pub use crate::core::connection::{Connection, ConnectionConfig, ConnectionState};
pub use crate::core::envelope::{ReplyHandle, ReplySlot};
pub use crate::core::queue::{LockType, PendingQueue};
pub use crate::core::{HandshakeResult, ServerRecord, ServerRole};
pub use crate::error::{DriverError, DriverResult};
pub use crate::health::{ClusterMonitor, HandshakeChecker, HealthChecker, HealthStatus};
pub use crate::protocol::{Message, WireCodec};

/// Crate version, as reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

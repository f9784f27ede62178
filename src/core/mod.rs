/// Core transport abstractions: queues, envelopes, the codec boundary and
/// per-server connections
pub mod codec;
pub mod connection;
pub mod envelope;
pub mod queue;

use std::fmt;
use std::time::{Duration, SystemTime};

/// Default maximum message size assumed before a server says otherwise
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Role a server reported in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerRole {
    Primary,
    Secondary,
    Arbiter,
    Standalone,
    /// Shard router
    Mongos,
    /// Not contacted yet, or the reply did not say
    Unknown,
}

impl ServerRole {
    /// Accepts writes
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            ServerRole::Primary | ServerRole::Standalone | ServerRole::Mongos
        )
    }

    /// Only meaningful inside a replica set
    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            ServerRole::Primary | ServerRole::Secondary | ServerRole::Arbiter
        )
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerRole::Primary => "primary",
            ServerRole::Secondary => "secondary",
            ServerRole::Arbiter => "arbiter",
            ServerRole::Standalone => "standalone",
            ServerRole::Mongos => "mongos",
            ServerRole::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// What a server said about itself during the identity handshake
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResult {
    pub role: ServerRole,
    pub wire_version: i32,
    pub max_message_size: usize,
    pub set_name: Option<String>,
}

impl Default for HandshakeResult {
    fn default() -> Self {
        Self {
            role: ServerRole::Unknown,
            wire_version: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            set_name: None,
        }
    }
}

/// Everything known about one server address
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRecord {
    pub address: String,
    /// Smoothed round-trip time; `None` until the first sample
    pub latency: Option<Duration>,
    pub role: ServerRole,
    pub wire_version: i32,
    pub max_message_size: usize,
    pub set_name: Option<String>,
    pub last_contact: Option<SystemTime>,
    pub reachable: bool,
}

impl ServerRecord {
    /// Record for an address that has not answered a handshake yet
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            latency: None,
            role: ServerRole::Unknown,
            wire_version: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            set_name: None,
            last_contact: None,
            reachable: true,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.reachable && self.role.is_writable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_unknown() {
        let record = ServerRecord::new("db1:27017");
        assert_eq!(record.role, ServerRole::Unknown);
        assert!(record.latency.is_none());
        assert!(record.reachable);
        assert!(!record.is_writable());
    }

    #[test]
    fn test_role_classes() {
        assert!(ServerRole::Primary.is_writable());
        assert!(ServerRole::Mongos.is_writable());
        assert!(!ServerRole::Secondary.is_writable());
        assert!(!ServerRole::Arbiter.is_writable());

        assert!(ServerRole::Arbiter.is_replica_set_member());
        assert!(!ServerRole::Standalone.is_replica_set_member());
        assert_eq!(ServerRole::Mongos.to_string(), "mongos");
    }
}

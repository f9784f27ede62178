/// Configuration management for corredor

use crate::cluster::selector::Routing;
use crate::core::queue::LockType;
use crate::utils::split_host_port;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use crate::error::ConfigError;

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection and transport settings
    pub client: ClientConfig,
    /// Server selection tuning
    pub selection: SelectionConfig,
    /// Reconnect policy
    pub reconnect: ReconnectConfig,
    /// Background cluster monitor
    pub monitor: MonitorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Connection and transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Seed addresses (host:port)
    pub servers: Vec<String>,
    /// Bound on TCP connect and the identity handshake
    pub connect_timeout_ms: u64,
    /// Receiver liveness tick; a read timeout is never an error
    pub read_timeout_ms: u64,
    /// Depth of each per-connection queue
    pub max_pending_operations_per_connection: usize,
    /// How queue waiters park
    pub lock_type: LockType,
    /// Unflushed bytes the sender accumulates before writing
    pub write_buffer_size: usize,
    /// Enable SO_KEEPALIVE on server sockets
    pub keepalive: bool,
    /// Largest frame accepted from a server
    pub max_message_size: usize,
}

/// Server selection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Selection bias among eligible servers
    pub policy: SelectionPolicy,
    /// Servers within this distance of the fastest are equally preferred
    pub latency_window_ms: u64,
    /// Weight of a new latency sample in the moving average
    pub latency_smoothing: f64,
    /// Routing used when the caller does not specify one
    pub default_routing: Routing,
}

/// Selection bias among eligible servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    LatencyWindow,
    RoundRobin,
}

/// Reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_backoff_ms: u64,
    /// Cap for the doubling backoff
    pub max_backoff_ms: u64,
    /// Overall wall-clock budget for one reconnect
    pub time_budget_ms: u64,
}

/// Background cluster monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Time between checks of the whole cluster
    pub interval_ms: u64,
    /// Per-server check deadline
    pub timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl SelectionConfig {
    pub fn latency_window(&self) -> Duration {
        Duration::from_millis(self.latency_window_ms)
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:27017".to_string()],
            connect_timeout_ms: 10_000,
            read_timeout_ms: 1_000,
            max_pending_operations_per_connection: 1024,
            lock_type: LockType::Mutex,
            write_buffer_size: 8192,
            keepalive: true,
            max_message_size: 48_000_000,
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::LatencyWindow,
            latency_window_ms: 15,
            latency_smoothing: 0.25,
            default_routing: Routing::Primary,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            time_budget_ms: 30_000,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 5_000,
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
            client: ClientConfig::default(),
            selection: SelectionConfig::default(),
            reconnect: ReconnectConfig::default(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let client = &self.client;
        if client.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "servers cannot be empty".to_string(),
            ));
        }

        for server in &client.servers {
            if split_host_port(server).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid server address '{}': must be host:port",
                    server
                )));
            }
        }

        if client.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if client.read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "read_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // A send pair needs room for two entries.
        if client.max_pending_operations_per_connection < 2 {
            return Err(ConfigError::ValidationError(
                "max_pending_operations_per_connection must be at least 2".to_string(),
            ));
        }

        if client.write_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "write_buffer_size must be greater than 0".to_string(),
            ));
        }

        if client.max_message_size < crate::protocol::HEADER_LENGTH {
            return Err(ConfigError::ValidationError(
                "max_message_size is smaller than a message header".to_string(),
            ));
        }

        let alpha = self.selection.latency_smoothing;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "latency_smoothing must be in (0, 1], got {}",
                alpha
            )));
        }

        let reconnect = &self.reconnect;
        if reconnect.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect max_attempts must be greater than 0".to_string(),
            ));
        }

        if reconnect.initial_backoff_ms > reconnect.max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "reconnect initial_backoff_ms must not exceed max_backoff_ms".to_string(),
            ));
        }

        if reconnect.time_budget_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect time_budget_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.timeout_ms >= self.monitor.interval_ms {
            return Err(ConfigError::ValidationError(
                "monitor timeout_ms must be less than interval_ms".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, kind: &str) -> Result<(), ConfigError> {
        let config = match kind {
            "standalone" => Config::default(),
            "replica-set" => Config {
                client: ClientConfig {
                    servers: vec![
                        "10.0.1.10:27017".to_string(),
                        "10.0.1.11:27017".to_string(),
                        "10.0.1.12:27017".to_string(),
                    ],
                    ..Default::default()
                },
                selection: SelectionConfig {
                    default_routing: Routing::SecondaryPreferred,
                    ..Default::default()
                },
                ..Default::default()
            },
            "sharded" => Config {
                client: ClientConfig {
                    servers: vec![
                        "10.0.2.10:27017".to_string(),
                        "10.0.2.11:27017".to_string(),
                    ],
                    ..Default::default()
                },
                selection: SelectionConfig {
                    default_routing: Routing::Nearest,
                    ..Default::default()
                },
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Kind must be 'standalone', 'replica-set' or 'sharded'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

/// Unified error handling for corredor
///
/// Every failure a caller can observe travels through [`DriverError`], whether it
/// is returned synchronously (connect, selection, submit on a closed connection) or
/// delivered later through an operation's continuation (send, no-reply,
/// connection-lost).

use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for driver operations
#[derive(Debug, Error)]
pub enum DriverError {
    /// No server could be reached, or the handshake with it failed
    #[error("Connect error: {message}")]
    Connect { message: String },

    /// Writing a specific request to the socket failed
    #[error("Send error: {message}")]
    Send { message: String },

    /// The request was skipped while matching replies in send order
    #[error("No reply received for request {request_id}")]
    NoReply { request_id: i32 },

    /// The connection failed or was closed while the request was outstanding
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// Work was submitted to a connection that is already closed
    #[error("Connection is closed")]
    ConnectionClosed,

    /// No known server satisfies the routing requirement
    #[error("No eligible server for {routing}")]
    Selection { routing: String },

    /// The reconnect strategy ran out of attempts or time
    #[error("Reconnect exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// The encoded request is larger than the server accepts
    #[error("Message of {size} bytes exceeds the server maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Malformed frame or handshake reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connect or handshake deadline elapsed
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Raw network errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Convenience methods for creating specific error types
impl DriverError {
    pub fn connect<S: Into<String>>(message: S) -> Self {
        DriverError::Connect {
            message: message.into(),
        }
    }

    pub fn send<S: Into<String>>(message: S) -> Self {
        DriverError::Send {
            message: message.into(),
        }
    }

    pub fn connection_lost<S: Into<String>>(message: S) -> Self {
        DriverError::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn selection<S: Into<String>>(routing: S) -> Self {
        DriverError::Selection {
            routing: routing.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        DriverError::Protocol(message.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        DriverError::Timeout {
            operation: operation.into(),
        }
    }

    /// Rebuild an equivalent error so one failure can be delivered to many callers.
    ///
    /// `io::Error` is not `Clone`, so network errors keep their kind and message.
    pub fn duplicate(&self) -> Self {
        match self {
            DriverError::Connect { message } => DriverError::connect(message.clone()),
            DriverError::Send { message } => DriverError::send(message.clone()),
            DriverError::NoReply { request_id } => DriverError::NoReply {
                request_id: *request_id,
            },
            DriverError::ConnectionLost { message } => {
                DriverError::connection_lost(message.clone())
            }
            DriverError::ConnectionClosed => DriverError::ConnectionClosed,
            DriverError::Selection { routing } => DriverError::selection(routing.clone()),
            DriverError::ReconnectExhausted {
                attempts,
                last_error,
            } => DriverError::ReconnectExhausted {
                attempts: *attempts,
                last_error: last_error.clone(),
            },
            DriverError::MessageTooLarge { size, max } => DriverError::MessageTooLarge {
                size: *size,
                max: *max,
            },
            DriverError::Protocol(message) => DriverError::Protocol(message.clone()),
            DriverError::Timeout { operation } => DriverError::timeout(operation.clone()),
            DriverError::Network(e) => DriverError::Network(io::Error::new(e.kind(), e.to_string())),
            DriverError::Config(e) => DriverError::Config(match e {
                ConfigError::IoError(m) => ConfigError::IoError(m.clone()),
                ConfigError::ParseError(m) => ConfigError::ParseError(m.clone()),
                ConfigError::SerializeError(m) => ConfigError::SerializeError(m.clone()),
                ConfigError::ValidationError(m) => ConfigError::ValidationError(m.clone()),
            }),
        }
    }

    /// Check if this error is recoverable (can retry, possibly on another connection)
    pub fn is_recoverable(&self) -> bool {
        match self {
            DriverError::Connect { .. } => true,
            DriverError::Send { .. } => true,
            DriverError::ConnectionLost { .. } => true,
            DriverError::ConnectionClosed => true,
            DriverError::Selection { .. } => true,
            DriverError::Timeout { .. } => true,
            DriverError::Network(_) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DriverError::Config(_) => ErrorSeverity::Critical,
            DriverError::ReconnectExhausted { .. } => ErrorSeverity::Critical,
            DriverError::Network(_) => ErrorSeverity::Warning,
            DriverError::Connect { .. } => ErrorSeverity::Warning,
            DriverError::ConnectionLost { .. } => ErrorSeverity::Warning,
            DriverError::Timeout { .. } => ErrorSeverity::Warning,
            DriverError::Selection { .. } => ErrorSeverity::Info,
            DriverError::ConnectionClosed => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

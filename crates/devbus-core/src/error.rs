//! Core error types for devbus

use devbus_protocol::{Protocol, ProtocolError, ResultCode, Version};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for applications built on devbus
#[derive(Error, Debug)]
pub enum DevbusError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Bus error
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Session manager error
    #[error("Session manager error: {0}")]
    Manager(#[from] ManagerError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a message bus
#[derive(Error, Debug)]
pub enum BusError {
    /// The outgoing path is momentarily full; the caller may retry
    #[error("Bus not ready")]
    NotReady,

    /// The bus connection is gone
    #[error("Bus disconnected")]
    Disconnected,

    /// A frame could not be encoded or decoded
    #[error("Frame error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error from the underlying transport
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-related errors
///
/// Every fallible session call yields either a retryable condition
/// ([`SessionError::is_retryable`]) or a terminal one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No window slot or message became available in time
    #[error("Session operation timed out")]
    Timeout,

    /// The session has not finished its handshake yet
    #[error("Session not ready")]
    NotReady,

    /// The session reached the closed state
    #[error("Session closed: {0}")]
    Closed(ResultCode),

    /// A call argument is unusable
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The call is not allowed in the current session state
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Payload exceeds a single frame
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Receive buffer cannot hold the next message; the message stays queued
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The negotiated version is outside the requested range
    #[error("Version mismatch: negotiated {negotiated}, wanted {min}..={max}")]
    VersionMismatch {
        negotiated: Version,
        min: Version,
        max: Version,
    },
}

impl SessionError {
    /// Whether re-issuing the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Timeout | SessionError::NotReady | SessionError::BufferTooSmall { .. }
        )
    }

    /// The reason code this error maps to
    pub fn result_code(&self) -> ResultCode {
        match self {
            SessionError::Timeout | SessionError::NotReady => ResultCode::NotReady,
            SessionError::Closed(reason) => *reason,
            SessionError::InvalidParameter(_) => ResultCode::InvalidParameter,
            SessionError::InvalidState(_) => ResultCode::Error,
            SessionError::PayloadTooLarge { .. } | SessionError::BufferTooSmall { .. } => {
                ResultCode::InsufficientMemory
            }
            SessionError::VersionMismatch { .. } => ResultCode::VersionMismatch,
        }
    }
}

/// Session manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    /// The manager has no message bus to route through
    #[error("Session manager is not bound to a message bus")]
    NotBound,

    /// A server is already registered for the protocol
    #[error("Protocol server already registered for {0}")]
    AlreadyRegistered(Protocol),

    /// No server is registered for the protocol
    #[error("No protocol server registered for {0}")]
    NotRegistered(Protocol),

    /// The protocol id is reserved for bus infrastructure
    #[error("Protocol {0} cannot carry sessions")]
    ReservedProtocol(Protocol),

    /// No free session id was found
    #[error("Session id space exhausted after {attempts} attempts")]
    IdSpaceExhausted { attempts: u32 },

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Bus error
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Malformed session frame
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ManagerError {
    /// The reason code reported to a peer when this error ends a handshake
    pub fn result_code(&self) -> ResultCode {
        match self {
            ManagerError::IdSpaceExhausted { .. } => ResultCode::InsufficientMemory,
            ManagerError::NotRegistered(_) => ResultCode::Unavailable,
            ManagerError::Session(err) => err.result_code(),
            _ => ResultCode::Error,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

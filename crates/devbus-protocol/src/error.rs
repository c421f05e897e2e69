//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown session message code
    #[error("Unknown session message code: {0}")]
    UnknownMessageType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Incomplete frame or payload received
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

//! Addressing and sequencing types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic per-direction sequence number. Zero is never used on the wire.
pub type Sequence = u64;

/// Sub-protocol version number
pub type Version = u16;

/// Advertised receive-window availability
pub type WindowSize = u16;

/// Identifier of an endpoint attached to the message bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u16);

impl ClientId {
    /// Create a new client ID
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Reserved broadcast address; never a valid session peer
    pub const BROADCAST: ClientId = ClientId(0);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

impl From<u16> for ClientId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

/// Identifier of a session, unique among the open sessions of one manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Create a new session ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the reserved invalid ID
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Reserved value that never identifies a session
    pub const INVALID: SessionId = SessionId(0);
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{:#010x}", self.0)
    }
}

impl From<u32> for SessionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        let id = SessionId::new(0x0001_002a);
        assert_eq!(format!("{}", id), "session-0x0001002a");
    }

    #[test]
    fn test_reserved_ids() {
        assert!(!SessionId::INVALID.is_valid());
        assert!(SessionId::new(1).is_valid());
        assert_eq!(ClientId::BROADCAST.as_u16(), 0);
    }

    #[test]
    fn test_client_id_display() {
        assert_eq!(format!("{}", ClientId::new(7)), "client-7");
    }
}

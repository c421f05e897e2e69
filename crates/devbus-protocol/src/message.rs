//! Session-layer message codes and handshake payloads
//!
//! Every frame whose protocol id is [`Protocol::SESSION`] carries one of the
//! [`SessionMessage`] codes in its `message_id` field.
//!
//! # Handshake
//!
//! 1. Client queues `Syn` carrying its version range and a provisional session id
//! 2. Server answers `SynAck` with the final session id and negotiated version
//! 3. Client answers `Ack`; either side may now send `Data`
//! 4. `Fin` closes gracefully, `Rst` aborts and carries a [`ResultCode`] in the
//!    header's sequence field

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::error::ProtocolError;
use crate::session::{Sequence, SessionId, Version};

/// Session protocol version spoken by this implementation.
pub const SESSION_PROTOCOL_VERSION: u8 = 3;

/// First session version whose `Syn` carries a max version range.
pub const SESSION_VERSION_RANGE: u8 = 2;

/// First session version whose `SynAck` carries the negotiated version and
/// whose close handshake waits for every queued frame to be acknowledged.
pub const SESSION_VERSION_SYNACK: u8 = 3;

/// Sub-protocol identifier carried in every frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Protocol(pub u8);

impl Protocol {
    pub const DRIVER_CONTROL: Protocol = Protocol(0);
    pub const RGP: Protocol = Protocol(3);
    pub const ETW: Protocol = Protocol(4);
    pub const EVENT: Protocol = Protocol(6);
    /// Highest id available to application protocols
    pub const MAX_USER: Protocol = Protocol(223);
    pub const TRANSFER: Protocol = Protocol(251);
    pub const URI: Protocol = Protocol(252);
    /// The session layer itself
    pub const SESSION: Protocol = Protocol(253);
    pub const CLIENT_MANAGEMENT: Protocol = Protocol(254);
    pub const SYSTEM: Protocol = Protocol(255);

    /// Get the raw protocol id
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Whether sessions may be opened for this protocol
    pub fn is_session_capable(&self) -> bool {
        *self != Self::SESSION && *self != Self::CLIENT_MANAGEMENT && *self != Self::SYSTEM
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol-{}", self.0)
    }
}

/// Session-layer message code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionMessage {
    /// Connection request
    Syn = 1,
    /// Connection accepted
    SynAck = 2,
    /// Graceful close
    Fin = 3,
    /// Application payload
    Data = 4,
    /// Cumulative acknowledgement
    Ack = 5,
    /// Abort, reason in the sequence field
    Rst = 6,
}

impl SessionMessage {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Syn),
            2 => Some(Self::SynAck),
            3 => Some(Self::Fin),
            4 => Some(Self::Data),
            5 => Some(Self::Ack),
            6 => Some(Self::Rst),
            _ => None,
        }
    }
}

/// Outcome codes shared by the session layer and the wire (`Rst` reasons)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    Error = 1,
    NotReady = 2,
    VersionMismatch = 3,
    Unavailable = 4,
    Rejected = 5,
    EndOfStream = 6,
    Aborted = 7,
    InsufficientMemory = 8,
    InvalidParameter = 9,
}

impl ResultCode {
    /// Convert to the raw wire value
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// Decode a reason carried in a `Rst` sequence field.
    ///
    /// Unrecognised values collapse to [`ResultCode::Error`].
    pub fn from_wire(value: Sequence) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::Error,
            2 => Self::NotReady,
            3 => Self::VersionMismatch,
            4 => Self::Unavailable,
            5 => Self::Rejected,
            6 => Self::EndOfStream,
            7 => Self::Aborted,
            8 => Self::InsufficientMemory,
            9 => Self::InvalidParameter,
            _ => Self::Error,
        }
    }

    /// Encode for a `Rst` sequence field
    pub fn to_wire(&self) -> Sequence {
        self.as_u32() as Sequence
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::NotReady => "not ready",
            Self::VersionMismatch => "version mismatch",
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
            Self::EndOfStream => "end of stream",
            Self::Aborted => "aborted",
            Self::InsufficientMemory => "insufficient memory",
            Self::InvalidParameter => "invalid parameter",
        };
        f.write_str(name)
    }
}

/// Payload of a `Syn` frame (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynPayload {
    pub min_version: Version,
    pub protocol: Protocol,
    pub session_version: u8,
    pub max_version: Version,
}

impl SynPayload {
    /// Encoded size in bytes
    pub const SIZE: usize = 8;

    /// Encode into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        dst.put_u16_le(self.min_version);
        dst.put_u8(self.protocol.as_u8());
        dst.put_u8(self.session_version);
        dst.put_u16_le(self.max_version);
        dst.put_bytes(0, 2);
    }

    /// Decode from a frame payload
    pub fn decode(mut src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < Self::SIZE {
            return Err(ProtocolError::IncompleteFrame {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }

        let min_version = src.get_u16_le();
        let protocol = Protocol(src.get_u8());
        let session_version = src.get_u8();
        let max_version = src.get_u16_le();

        Ok(Self {
            min_version,
            protocol,
            session_version,
            max_version,
        })
    }
}

/// Payload of a `SynAck` frame (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynAckPayload {
    /// Sequence of the `Syn` being answered
    pub sequence: Sequence,
    /// Provisional id the client chose for the session
    pub initial_session_id: SessionId,
    /// Negotiated sub-protocol version, 0 from legacy servers
    pub version: Version,
    pub session_version: u8,
}

impl SynAckPayload {
    /// Encoded size in bytes
    pub const SIZE: usize = 16;

    /// Encode into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        dst.put_u64_le(self.sequence);
        dst.put_u32_le(self.initial_session_id.as_u32());
        dst.put_u16_le(self.version);
        dst.put_u8(self.session_version);
        dst.put_u8(0);
    }

    /// Decode from a frame payload
    pub fn decode(mut src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < Self::SIZE {
            return Err(ProtocolError::IncompleteFrame {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }

        let sequence = src.get_u64_le();
        let initial_session_id = SessionId::new(src.get_u32_le());
        let version = src.get_u16_le();
        let session_version = src.get_u8();

        Ok(Self {
            sequence,
            initial_session_id,
            version,
            session_version,
        })
    }
}

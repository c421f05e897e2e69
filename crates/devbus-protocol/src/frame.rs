//! Frame header encoding/decoding
//!
//! Every bus message starts with a fixed 24-byte little-endian header:
//! - src_client_id: 2 bytes (u16)
//! - dst_client_id: 2 bytes (u16)
//! - protocol_id: 1 byte (u8)
//! - message_id: 1 byte (u8)
//! - window_size: 2 bytes (u16)
//! - payload_size: 4 bytes (u32)
//! - session_id: 4 bytes (u32)
//! - sequence: 8 bytes (u64)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::{Protocol, SessionMessage};
use crate::session::{ClientId, Sequence, SessionId, WindowSize};

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 24;

/// Largest frame the bus will carry, header included
pub const MAX_MESSAGE_SIZE: usize = 1408;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

/// Frame header containing routing, sequencing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub src_client_id: ClientId,
    pub dst_client_id: ClientId,
    pub protocol_id: Protocol,
    /// Protocol-specific message code
    pub message_id: u8,
    /// Receiver availability advertised by the sender
    pub window_size: WindowSize,
    pub payload_size: u32,
    pub session_id: SessionId,
    /// Session sequence number, or protocol metadata outside sessions
    pub sequence: Sequence,
}

impl MessageHeader {
    /// Create a session-layer header with an empty payload
    pub fn session(
        src: ClientId,
        dst: ClientId,
        message: SessionMessage,
        session_id: SessionId,
        sequence: Sequence,
    ) -> Self {
        Self {
            src_client_id: src,
            dst_client_id: dst,
            protocol_id: Protocol::SESSION,
            message_id: message.as_u8(),
            window_size: 0,
            payload_size: 0,
            session_id,
            sequence,
        }
    }

    /// The session message code, if this is a session-layer frame
    pub fn session_message(&self) -> Option<SessionMessage> {
        if self.protocol_id == Protocol::SESSION {
            SessionMessage::from_u8(self.message_id)
        } else {
            None
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u16_le(self.src_client_id.as_u16());
        dst.put_u16_le(self.dst_client_id.as_u16());
        dst.put_u8(self.protocol_id.as_u8());
        dst.put_u8(self.message_id);
        dst.put_u16_le(self.window_size);
        dst.put_u32_le(self.payload_size);
        dst.put_u32_le(self.session_id.as_u32());
        dst.put_u64_le(self.sequence);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if a session-layer header carries an unknown message code.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate the session message code before consuming anything
        let protocol_id = Protocol(src[4]);
        let message_id = src[5];
        if protocol_id == Protocol::SESSION && SessionMessage::from_u8(message_id).is_none() {
            return Err(ProtocolError::UnknownMessageType(message_id));
        }

        let src_client_id = ClientId::new(src.get_u16_le());
        let dst_client_id = ClientId::new(src.get_u16_le());
        let _ = src.get_u8(); // protocol_id already parsed
        let _ = src.get_u8(); // message_id already parsed
        let window_size = src.get_u16_le();
        let payload_size = src.get_u32_le();
        let session_id = SessionId::new(src.get_u32_le());
        let sequence = src.get_u64_le();

        Ok(Some(Self {
            src_client_id,
            dst_client_id,
            protocol_id,
            message_id,
            window_size,
            payload_size,
            session_id,
            sequence,
        }))
    }
}

//! devbus-protocol: Wire format for the devbus session layer
//!
//! This crate defines the fixed-size frame carried by the message bus, the
//! session-layer message codes and handshake payloads, and a codec for
//! moving frames across byte-stream transports.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod session;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{MessageHeader, HEADER_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    Protocol, ResultCode, SessionMessage, SynAckPayload, SynPayload, SESSION_PROTOCOL_VERSION,
    SESSION_VERSION_RANGE, SESSION_VERSION_SYNACK,
};
pub use session::{ClientId, Sequence, SessionId, Version, WindowSize};

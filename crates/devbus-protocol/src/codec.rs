//! Frames and a Tokio codec for byte-stream transports

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{MessageHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::SessionMessage;

/// A complete bus message: header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame, fixing up the header's payload size
    pub fn new(mut header: MessageHeader, payload: Bytes) -> Self {
        header.payload_size = payload.len() as u32;
        Self { header, payload }
    }

    /// Create a frame with no payload
    pub fn control(header: MessageHeader) -> Self {
        Self::new(header, Bytes::new())
    }

    /// The session message code, if this is a session-layer frame
    pub fn session_message(&self) -> Option<SessionMessage> {
        self.header.session_message()
    }

    /// Total encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode header and payload into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(self.encoded_len());
        self.header.encode(dst);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// Codec for encoding/decoding frames on a byte stream
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<MessageHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Try to decode header if we don't have one
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match MessageHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        // Check payload length
        let payload_len = header.payload_size as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        // Check if we have enough data for the payload
        if src.len() < payload_len {
            // Save header and wait for more data
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode(dst)
    }
}

//! Message bus abstraction consumed by the session layer

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::BusError;
use devbus_protocol::{ClientId, Frame, MessageHeader, Protocol, Sequence, SessionId, MAX_PAYLOAD_SIZE};

/// A best-effort, unordered frame transport that clients attach to
///
/// Delivery and ordering are not guaranteed; the session layer builds
/// reliable ordered channels on top.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Id assigned to this endpoint on the bus
    fn client_id(&self) -> ClientId;

    /// Whether the bus connection is still usable
    fn is_connected(&self) -> bool;

    /// Queue a fully built frame for delivery without blocking
    ///
    /// Returns [`BusError::NotReady`] when the outgoing path is momentarily
    /// full.
    fn forward(&self, frame: &Frame) -> Result<(), BusError>;

    /// Build and forward a frame outside any session
    fn send(
        &self,
        dst: ClientId,
        protocol: Protocol,
        message_id: u8,
        metadata: Sequence,
        payload: &[u8],
    ) -> Result<(), BusError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(devbus_protocol::ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }

        let header = MessageHeader {
            src_client_id: self.client_id(),
            dst_client_id: dst,
            protocol_id: protocol,
            message_id,
            window_size: 0,
            payload_size: 0,
            session_id: SessionId::INVALID,
            sequence: metadata,
        };
        self.forward(&Frame::new(header, Bytes::copy_from_slice(payload)))
    }

    /// Wait up to `timeout` for the next inbound frame
    ///
    /// A zero timeout polls. `Ok(None)` means nothing arrived in time.
    async fn receive(&self, timeout: Duration) -> Result<Option<Frame>, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        sent: Mutex<Vec<Frame>>,
    }

    #[async_trait]
    impl MessageBus for Recorder {
        fn client_id(&self) -> ClientId {
            ClientId::new(3)
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn forward(&self, frame: &Frame) -> Result<(), BusError> {
            self.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }

        async fn receive(&self, _timeout: Duration) -> Result<Option<Frame>, BusError> {
            Ok(None)
        }
    }

    #[test]
    fn test_send_builds_header() {
        let bus = Recorder {
            sent: Mutex::new(Vec::new()),
        };
        bus.send(ClientId::new(9), Protocol::SYSTEM, 7, 0xABCD, b"ping")
            .unwrap();

        let sent = bus.sent.lock().unwrap();
        let frame = &sent[0];
        assert_eq!(frame.header.src_client_id, ClientId::new(3));
        assert_eq!(frame.header.dst_client_id, ClientId::new(9));
        assert_eq!(frame.header.sequence, 0xABCD);
        assert_eq!(frame.header.payload_size, 4);
    }

    #[test]
    fn test_send_rejects_oversized_payload() {
        let bus = Recorder {
            sent: Mutex::new(Vec::new()),
        };
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let result = bus.send(ClientId::new(9), Protocol::SYSTEM, 7, 0, &payload);
        assert!(matches!(result, Err(BusError::Protocol(_))));
    }
}

//! Message bus over a byte stream
//!
//! Frames are written back to back with [`FrameCodec`]. A reader task and a
//! writer task own the two halves of the stream; the bus itself only touches
//! bounded queues, so [`MessageBus::forward`] never blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use devbus_core::{BusError, MessageBus};
use devbus_protocol::{ClientId, Frame, FrameCodec};

/// Frames buffered in each direction by default
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// [`MessageBus`] endpoint speaking to one peer over a byte stream
pub struct StreamBus {
    client_id: ClientId,
    outgoing: mpsc::Sender<Frame>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl StreamBus {
    /// Start the reader and writer tasks for `stream`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(stream: S, client_id: ClientId) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_queue_depth(stream, client_id, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth<S>(stream: S, client_id: ClientId, queue_depth: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut sink, mut source) = Framed::new(stream, FrameCodec::new()).split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(queue_depth.max(1));
        let (in_tx, in_rx) = mpsc::channel::<Frame>(queue_depth.max(1));
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let writer_connected = Arc::clone(&connected);
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    next = out_rx.recv() => {
                        let Some(frame) = next else { break };
                        if let Err(e) = sink.send(frame).await {
                            tracing::warn!("Stream bus write failed for {}: {}", client_id, e);
                            break;
                        }
                    }
                }
            }
            writer_connected.store(false, Ordering::Release);
            writer_cancel.cancel();
        });

        let reader_connected = Arc::clone(&connected);
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    next = source.next() => match next {
                        Some(Ok(frame)) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!("Stream bus read failed for {}: {}", client_id, e);
                            break;
                        }
                        None => {
                            tracing::debug!("Stream bus for {} reached end of stream", client_id);
                            break;
                        }
                    }
                }
            }
            reader_connected.store(false, Ordering::Release);
            reader_cancel.cancel();
        });

        Self {
            client_id,
            outgoing: out_tx,
            incoming: tokio::sync::Mutex::new(in_rx),
            connected,
            cancel,
        }
    }

    /// Stop both tasks; pending outgoing frames are discarded
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.cancel.cancel();
    }
}

impl Drop for StreamBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl MessageBus for StreamBus {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn forward(&self, frame: &Frame) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        match self.outgoing.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BusError::NotReady),
            Err(TrySendError::Closed(_)) => Err(BusError::Disconnected),
        }
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        let mut incoming = self.incoming.lock().await;
        if timeout.is_zero() {
            return match incoming.try_recv() {
                Ok(frame) => Ok(Some(frame)),
                Err(TryRecvError::Empty) if self.is_connected() => Ok(None),
                Err(_) => Err(BusError::Disconnected),
            };
        }

        match tokio::time::timeout(timeout, incoming.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(BusError::Disconnected),
            Err(_) => Ok(None),
        }
    }
}

impl std::fmt::Debug for StreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBus")
            .field("client_id", &self.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use devbus_protocol::{MessageHeader, SessionId, SessionMessage};

    fn data(src: ClientId, dst: ClientId, sequence: u64, payload: &'static [u8]) -> Frame {
        let header =
            MessageHeader::session(src, dst, SessionMessage::Data, SessionId::new(9), sequence);
        Frame::new(header, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_frames_cross_duplex_stream() {
        let (left, right) = tokio::io::duplex(4096);
        let a = StreamBus::spawn(left, ClientId::new(1));
        let b = StreamBus::spawn(right, ClientId::new(2));

        a.forward(&data(a.client_id(), b.client_id(), 1, b"first")).unwrap();
        a.forward(&data(a.client_id(), b.client_id(), 2, b"second")).unwrap();

        let first = b.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        let second = b.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"first");
        assert_eq!(second.header.sequence, 2);
        assert!(b.receive(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_close_disconnects() {
        let (left, right) = tokio::io::duplex(4096);
        let a = StreamBus::spawn(left, ClientId::new(1));
        drop(right);

        let result = a.receive(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BusError::Disconnected)));
        assert!(!a.is_connected());
        assert!(matches!(
            a.forward(&data(a.client_id(), ClientId::new(2), 1, b"late")),
            Err(BusError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_full_queue_is_not_ready() {
        let (left, _right) = tokio::io::duplex(64);
        let a = StreamBus::with_queue_depth(left, ClientId::new(1), 1);
        let frame = data(a.client_id(), ClientId::new(2), 1, &[0u8; 512]);

        let mut saw_not_ready = false;
        for _ in 0..64 {
            match a.forward(&frame) {
                Ok(()) => {}
                Err(BusError::NotReady) => {
                    saw_not_ready = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(saw_not_ready);
    }
}

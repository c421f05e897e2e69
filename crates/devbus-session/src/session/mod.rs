//! Reliable, ordered sessions over the message bus
//!
//! A [`Session`] pairs a handshake state machine with two fixed-depth
//! sliding windows. The session manager feeds it inbound frames through
//! [`Session::handle_message`] and ticks it with [`Session::update`];
//! application tasks call [`Session::send`] and [`Session::receive`]
//! concurrently from anywhere.
//!
//! # Locking
//!
//! Each session owns three locks, always taken in the order
//! control, then transmit, then receive. The transmit and receive locks are
//! never held together. No lock is held across an `.await`, and protocol
//! server callbacks run after every lock is released.

mod retransmit;
mod state;
mod window;

pub use retransmit::{RetransmitBackoff, RttEstimator};
pub use state::{SessionRole, SessionState};
pub use window::{ReceiveSnapshot, TransmitSnapshot, WindowSnapshot};

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{watch, Semaphore};

use devbus_core::config::SessionConfig;
use devbus_core::{BusError, MessageBus, SessionError};
use devbus_protocol::{
    ClientId, Frame, MessageHeader, Protocol, ResultCode, Sequence, SessionId, SessionMessage,
    SynAckPayload, SynPayload, Version, WindowSize, MAX_PAYLOAD_SIZE, SESSION_PROTOCOL_VERSION,
    SESSION_VERSION_SYNACK,
};

use crate::server::ProtocolServer;
use state::CallbackState;
use window::{Arrival, ReceiveWindow, Retransmit, TransmitWindow};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Error returned once a session has closed
fn closed_error(reason: ResultCode) -> SessionError {
    match reason {
        ResultCode::Success => SessionError::Closed(ResultCode::EndOfStream),
        other => SessionError::Closed(other),
    }
}

/// Handshake and termination bookkeeping, guarded by the control lock
struct Control {
    state: SessionState,
    reason: ResultCode,
    protocol_version: Version,
    min_client_version: Version,
    session_version: u8,
    callbacks: CallbackState,
    server: Option<Arc<dyn ProtocolServer>>,
    /// When a local close was requested but the Fin not yet queued
    fin_wait_since: Option<Instant>,
}

/// Server callback to run once the locks are released
enum Callback {
    Established(Arc<dyn ProtocolServer>),
    Update(Arc<dyn ProtocolServer>),
    Terminated(Arc<dyn ProtocolServer>, ResultCode),
}

/// One ordered, reliable logical connection to a remote client
pub struct Session {
    bus: Arc<dyn MessageBus>,
    local_client_id: ClientId,
    protocol: Protocol,
    role: SessionRole,
    config: SessionConfig,
    session_id: AtomicU32,
    remote_client_id: AtomicU16,
    control: Mutex<Control>,
    transmit: Mutex<TransmitWindow>,
    receive: Mutex<ReceiveWindow>,
    /// Mirror of the receive window's advertised availability
    advertised: AtomicU16,
    /// One permit per free transmit slot
    free_slots: Semaphore,
    /// One permit per in-order frame ready to read
    ready: Semaphore,
    state_tx: watch::Sender<SessionState>,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Session {
    /// Create a closed session attached to `bus`
    pub fn new(
        bus: Arc<dyn MessageBus>,
        role: SessionRole,
        protocol: Protocol,
        config: SessionConfig,
    ) -> Self {
        let transmit = TransmitWindow::new(&config);
        let receive = ReceiveWindow::new(&config);
        let advertised = receive.available();
        let (state_tx, _) = watch::channel(SessionState::Closed);

        Self {
            local_client_id: bus.client_id(),
            bus,
            protocol,
            role,
            session_id: AtomicU32::new(SessionId::INVALID.as_u32()),
            remote_client_id: AtomicU16::new(ClientId::BROADCAST.as_u16()),
            control: Mutex::new(Control {
                state: SessionState::Closed,
                reason: ResultCode::Success,
                protocol_version: 0,
                min_client_version: 0,
                session_version: SESSION_PROTOCOL_VERSION,
                callbacks: CallbackState::None,
                server: None,
                fin_wait_since: None,
            }),
            transmit: Mutex::new(transmit),
            receive: Mutex::new(receive),
            advertised: AtomicU16::new(advertised),
            free_slots: Semaphore::new(config.window_depth),
            ready: Semaphore::new(0),
            state_tx,
            user_data: Mutex::new(None),
            config,
        }
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::new(self.session_id.load(Ordering::Acquire))
    }

    pub fn remote_client_id(&self) -> ClientId {
        ClientId::new(self.remote_client_id.load(Ordering::Acquire))
    }

    pub fn local_client_id(&self) -> ClientId {
        self.local_client_id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        lock(&self.control).state
    }

    /// Negotiated sub-protocol version
    pub fn protocol_version(&self) -> Version {
        lock(&self.control).protocol_version
    }

    /// Session-layer version agreed with the peer
    pub fn session_version(&self) -> u8 {
        lock(&self.control).session_version
    }

    /// Why the session closed, or is closing
    pub fn termination_reason(&self) -> ResultCode {
        lock(&self.control).reason
    }

    /// Attach an application value to the session
    pub fn set_user_data<T: Any + Send + Sync>(&self, value: T) {
        *lock(&self.user_data) = Some(Arc::new(value));
    }

    /// The attached application value, if it has type `T`
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = lock(&self.user_data).clone()?;
        data.downcast::<T>().ok()
    }

    /// Remove the attached application value
    pub fn clear_user_data(&self) {
        lock(&self.user_data).take();
    }

    /// Scalar state of both windows
    pub fn window_snapshot(&self) -> WindowSnapshot {
        let transmit = lock(&self.transmit).snapshot();
        let receive = lock(&self.receive).snapshot();
        WindowSnapshot { transmit, receive }
    }

    /// Queue a Syn to `remote` and enter [`SessionState::SynSent`]
    ///
    /// Returns once the Syn is queued; use
    /// [`Session::wait_for_connection`] to wait for the peer.
    pub fn connect(
        &self,
        remote: ClientId,
        session_id: SessionId,
        min_version: Version,
        max_version: Version,
    ) -> Result<(), SessionError> {
        if self.role != SessionRole::Client {
            return Err(SessionError::InvalidState(
                "only client sessions can connect".to_string(),
            ));
        }
        if remote == ClientId::BROADCAST {
            return Err(SessionError::InvalidParameter("remote client id"));
        }
        if !session_id.is_valid() {
            return Err(SessionError::InvalidParameter("session id"));
        }

        let mut ctl = lock(&self.control);
        if ctl.state != SessionState::Closed {
            return Err(SessionError::InvalidState(format!(
                "cannot connect a session that is {}",
                ctl.state
            )));
        }

        self.remote_client_id.store(remote.as_u16(), Ordering::Release);
        self.session_id.store(session_id.as_u32(), Ordering::Release);
        ctl.min_client_version = min_version;

        let mut payload = BytesMut::with_capacity(SynPayload::SIZE);
        SynPayload {
            min_version,
            protocol: self.protocol,
            session_version: ctl.session_version,
            max_version,
        }
        .encode(&mut payload);

        if !self.try_enqueue(SessionMessage::Syn, payload.freeze()) {
            return Err(SessionError::NotReady);
        }
        self.set_state(&mut ctl, SessionState::SynSent);
        tracing::debug!(
            "Connecting {} to {} for {} (versions {}..={})",
            session_id,
            remote,
            self.protocol,
            min_version,
            max_version
        );

        if let Err(e) = self.flush() {
            tracing::warn!("Failed to transmit Syn for {}: {}", session_id, e);
            self.shutdown_locked(&mut ctl, ResultCode::Error);
            return Err(SessionError::Closed(ResultCode::Error));
        }
        Ok(())
    }

    /// Prepare a server session for the peer's Syn
    ///
    /// Moves the session to [`SessionState::Listening`]; the Syn itself is
    /// then delivered through [`Session::handle_message`].
    pub fn bind_to_server(
        &self,
        server: Arc<dyn ProtocolServer>,
        remote: ClientId,
        peer_session_version: u8,
        protocol_version: Version,
        session_id: SessionId,
    ) -> Result<(), SessionError> {
        if self.role != SessionRole::Server {
            return Err(SessionError::InvalidState(
                "only server sessions can bind to a server".to_string(),
            ));
        }
        if remote == ClientId::BROADCAST {
            return Err(SessionError::InvalidParameter("remote client id"));
        }
        if !session_id.is_valid() {
            return Err(SessionError::InvalidParameter("session id"));
        }

        let mut ctl = lock(&self.control);
        if ctl.state != SessionState::Closed {
            return Err(SessionError::InvalidState(format!(
                "cannot bind a session that is {}",
                ctl.state
            )));
        }

        self.remote_client_id.store(remote.as_u16(), Ordering::Release);
        self.session_id.store(session_id.as_u32(), Ordering::Release);
        ctl.session_version = peer_session_version.min(SESSION_PROTOCOL_VERSION);
        ctl.protocol_version = protocol_version;
        ctl.server = Some(server);
        self.set_state(&mut ctl, SessionState::Listening);
        Ok(())
    }

    /// Queue `payload` for delivery, waiting up to `timeout` for a free slot
    ///
    /// A zero timeout never waits.
    pub async fn send(&self, payload: &[u8], timeout: Duration) -> Result<(), SessionError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SessionError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        self.check_sendable()?;

        let permit = match tokio::time::timeout(timeout, self.free_slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(closed_error(self.termination_reason())),
            Err(_) => return Err(SessionError::Timeout),
        };

        let mut ctl = lock(&self.control);
        if ctl.state != SessionState::Established {
            return Err(Self::state_error(&ctl));
        }
        permit.forget();

        let frame = self.frame(SessionMessage::Data, Bytes::copy_from_slice(payload));
        let result = {
            let mut tx = lock(&self.transmit);
            match tx.enqueue(frame) {
                Some(sequence) => {
                    tracing::trace!("Queued data sequence {} on {}", sequence, self.session_id());
                    self.transmit_locked(&mut tx)
                }
                None => {
                    self.free_slots.add_permits(1);
                    return Err(SessionError::NotReady);
                }
            }
        };

        if let Err(e) = result {
            tracing::warn!("Bus failure while sending on {}: {}", self.session_id(), e);
            self.shutdown_locked(&mut ctl, ResultCode::Error);
            return Err(SessionError::Closed(ResultCode::Error));
        }
        Ok(())
    }

    /// Copy the next in-order message into `buf`, waiting up to `timeout`
    ///
    /// Returns the number of bytes written. If `buf` is too small the
    /// message stays queued and [`SessionError::BufferTooSmall`] is returned.
    pub async fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, SessionError> {
        self.receive_with(timeout, |payload| {
            if payload.len() > buf.len() {
                return Err(SessionError::BufferTooSmall {
                    needed: payload.len(),
                    available: buf.len(),
                });
            }
            buf[..payload.len()].copy_from_slice(payload);
            Ok(payload.len())
        })
        .await
    }

    /// Take the next in-order message, waiting up to `timeout`
    pub async fn receive_bytes(&self, timeout: Duration) -> Result<Bytes, SessionError> {
        self.receive_with(timeout, |payload| Ok(Bytes::copy_from_slice(payload)))
            .await
    }

    async fn receive_with<R, F>(&self, timeout: Duration, take: F) -> Result<R, SessionError>
    where
        F: FnOnce(&[u8]) -> Result<R, SessionError>,
    {
        {
            let ctl = lock(&self.control);
            if ctl.state < SessionState::Established {
                return Err(Self::state_error(&ctl));
            }
        }

        let permit = match tokio::time::timeout(timeout, self.ready.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(closed_error(self.termination_reason())),
            Err(_) => return Err(SessionError::Timeout),
        };

        let mut ctl = lock(&self.control);
        if ctl.state == SessionState::Closed {
            return Err(closed_error(ctl.reason));
        }

        let mut rx = lock(&self.receive);
        let message = match rx.peek() {
            Some(frame) => frame.session_message(),
            None => return Err(SessionError::NotReady),
        };

        if message == Some(SessionMessage::Fin) {
            rx.pop();
            permit.forget();
            self.advertised.store(rx.available(), Ordering::Release);
            drop(rx);
            tracing::debug!("Read end of stream on {}", self.session_id());
            ctl.reason = ResultCode::Success;
            self.close_locked(&mut ctl);
            return Err(closed_error(ctl.reason));
        }

        let value = match rx.peek() {
            Some(frame) => take(&frame.payload[..])?,
            None => return Err(SessionError::NotReady),
        };
        rx.pop();
        permit.forget();
        self.advertised.store(rx.available(), Ordering::Release);
        Ok(value)
    }

    /// Wait up to `timeout` for the handshake to complete
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), SessionError> {
        let state = self
            .wait_for_state(timeout, |state| {
                state.is_closed() || *state >= SessionState::Established
            })
            .await?;

        if state.is_closed() {
            Err(closed_error(self.termination_reason()))
        } else {
            Ok(())
        }
    }

    /// Wait up to `timeout` for the session to close; returns the reason
    pub async fn wait_for_disconnection(&self, timeout: Duration) -> Result<ResultCode, SessionError> {
        self.wait_for_state(timeout, SessionState::is_closed).await?;
        Ok(self.termination_reason())
    }

    async fn wait_for_state<P>(
        &self,
        timeout: Duration,
        predicate: P,
    ) -> Result<SessionState, SessionError>
    where
        P: FnMut(&SessionState) -> bool,
    {
        let mut rx = self.state_tx.subscribe();
        let wait = async { rx.wait_for(predicate).await.map(|state| *state) };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(closed_error(self.termination_reason())),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Request shutdown with `reason`; never blocks
    ///
    /// [`ResultCode::Success`] on an established session starts the
    /// graceful close handshake. Any other reason, or any session that is
    /// not established, closes immediately and releases every task blocked
    /// in [`Session::send`] or [`Session::receive`]. Repeated calls have no
    /// further effect once the session is closed.
    pub fn shutdown(&self, reason: ResultCode) {
        let mut ctl = lock(&self.control);
        self.shutdown_locked(&mut ctl, reason);
    }

    /// Start a graceful close
    pub fn close(&self) {
        self.shutdown(ResultCode::Success);
    }

    /// Tell the peer the session is being torn down, then close with `reason`
    pub(crate) fn abort(&self, reason: ResultCode) {
        let mut ctl = lock(&self.control);
        if ctl.state.is_closed() {
            return;
        }
        if let Err(e) = self.send_control(SessionMessage::Rst, reason.to_wire()) {
            tracing::debug!("Failed to send Rst on {}: {}", self.session_id(), e);
        }
        self.shutdown_locked(&mut ctl, reason);
    }

    /// Close a client session nobody outside the manager holds anymore
    pub(crate) fn release_orphan(&self) {
        let mut ctl = lock(&self.control);
        match ctl.state {
            SessionState::Closed => {}
            SessionState::Closing => {
                ctl.reason = ResultCode::Success;
                self.close_locked(&mut ctl);
            }
            _ => self.shutdown_locked(&mut ctl, ResultCode::Success),
        }
    }

    /// Detach the protocol server; returns it if its termination callback
    /// is still owed
    pub(crate) fn detach_server(&self) -> Option<Arc<dyn ProtocolServer>> {
        let mut ctl = lock(&self.control);
        let server = ctl.server.take();
        if ctl.callbacks == CallbackState::EstablishedCalled {
            ctl.callbacks = CallbackState::TerminatedCalled;
            server
        } else {
            None
        }
    }

    /// Process one inbound session-layer frame addressed to this session
    pub fn handle_message(self: &Arc<Self>, frame: &Frame) {
        let Some(message) = frame.session_message() else {
            tracing::warn!("Ignoring non-session frame on {}", self.session_id());
            return;
        };

        let callback = {
            let mut ctl = lock(&self.control);
            let before = ctl.state;
            lock(&self.transmit).set_peer_available(frame.header.window_size);

            let result = match message {
                SessionMessage::Syn => self.on_syn(&mut ctl, frame),
                SessionMessage::SynAck => self.on_syn_ack(&mut ctl, frame),
                SessionMessage::Fin => self.on_fin(&mut ctl, frame),
                SessionMessage::Data => self.on_data(&mut ctl, frame),
                SessionMessage::Ack => self.on_ack(&mut ctl, frame),
                SessionMessage::Rst => {
                    let reason = ResultCode::from_wire(frame.header.sequence);
                    tracing::debug!("{} reset by peer: {}", self.session_id(), reason);
                    self.shutdown_locked(&mut ctl, reason);
                    Ok(())
                }
            };

            let result = result.and_then(|()| {
                if ctl.state.is_closed() {
                    Ok(())
                } else {
                    self.flush()
                }
            });
            if let Err(e) = result {
                tracing::warn!("Bus failure on {}: {}", self.session_id(), e);
                self.shutdown_locked(&mut ctl, ResultCode::Error);
            }

            let established = before != ctl.state && ctl.state == SessionState::Established;
            if established
                && self.role == SessionRole::Server
                && ctl.callbacks == CallbackState::None
            {
                ctl.callbacks = CallbackState::EstablishedCalled;
                ctl.server.clone().map(Callback::Established)
            } else {
                None
            }
        };

        if let Some(callback) = callback {
            self.run_callback(callback);
        }
    }

    /// Periodic tick: acknowledge, retransmit, transmit, and advance the
    /// close handshake. Returns the state afterwards.
    pub fn update(self: &Arc<Self>) -> SessionState {
        let (state, callback) = {
            let mut ctl = lock(&self.control);

            if ctl.state.is_closed() {
                if ctl.reason == ResultCode::Success {
                    self.flush_pending_ack();
                }
            } else {
                if let Err(e) = self.update_windows(&mut ctl) {
                    tracing::warn!("Bus failure on {}: {}", self.session_id(), e);
                    self.shutdown_locked(&mut ctl, ResultCode::Error);
                }
                self.update_close_handshake(&mut ctl);
            }

            let mut callback = None;
            if self.role == SessionRole::Server {
                match (ctl.state, ctl.callbacks) {
                    (SessionState::Established, CallbackState::EstablishedCalled) => {
                        callback = ctl.server.clone().map(Callback::Update);
                    }
                    (SessionState::Closed, CallbackState::EstablishedCalled) => {
                        ctl.callbacks = CallbackState::TerminatedCalled;
                        let reason = ctl.reason;
                        tracing::debug!("{} terminated: {}", self.session_id(), reason);
                        callback = ctl
                            .server
                            .clone()
                            .map(|server| Callback::Terminated(server, reason));
                    }
                    _ => {}
                }
            }
            (ctl.state, callback)
        };

        if let Some(callback) = callback {
            self.run_callback(callback);
        }
        state
    }

    fn run_callback(self: &Arc<Self>, callback: Callback) {
        match callback {
            Callback::Established(server) => server.session_established(self),
            Callback::Update(server) => server.update_session(self),
            Callback::Terminated(server, reason) => server.session_terminated(self, reason),
        }
    }

    fn on_syn(&self, ctl: &mut Control, frame: &Frame) -> Result<(), BusError> {
        if self.role != SessionRole::Server || ctl.state != SessionState::Listening {
            tracing::debug!("Ignoring Syn on {} in state {}", self.session_id(), ctl.state);
            return Ok(());
        }

        let Some(next_sequence) = frame.header.sequence.checked_add(1) else {
            tracing::warn!("Syn on {} starts at the last sequence number", self.session_id());
            self.shutdown_locked(ctl, ResultCode::Error);
            return Ok(());
        };

        let mut payload = BytesMut::with_capacity(SynAckPayload::SIZE);
        SynAckPayload {
            sequence: frame.header.sequence,
            initial_session_id: frame.header.session_id,
            version: ctl.protocol_version,
            session_version: ctl.session_version,
        }
        .encode(&mut payload);

        if self.try_enqueue(SessionMessage::SynAck, payload.freeze()) {
            self.set_state(ctl, SessionState::SynReceived);
            let mut rx = lock(&self.receive);
            rx.reset(next_sequence);
            self.advertised.store(rx.available(), Ordering::Release);
        } else {
            tracing::warn!("No transmit slot for SynAck on {}", self.session_id());
            self.shutdown_locked(ctl, ResultCode::Error);
        }
        Ok(())
    }

    fn on_syn_ack(&self, ctl: &mut Control, frame: &Frame) -> Result<(), BusError> {
        match ctl.state {
            SessionState::SynSent => {
                let Some(next_sequence) = frame.header.sequence.checked_add(1) else {
                    tracing::warn!(
                        "Dropping SynAck on {} at the last sequence number",
                        self.session_id()
                    );
                    return Ok(());
                };
                let payload = match SynAckPayload::decode(&frame.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Malformed SynAck on {}: {}", self.session_id(), e);
                        return Ok(());
                    }
                };

                self.acknowledge(payload.sequence)?;

                ctl.session_version = payload.session_version;
                ctl.protocol_version = if payload.version != 0 {
                    payload.version
                } else {
                    ctl.min_client_version
                };
                self.session_id
                    .store(frame.header.session_id.as_u32(), Ordering::Release);

                let mut rx = lock(&self.receive);
                rx.reset(next_sequence);
                self.set_state(ctl, SessionState::Established);
                tracing::debug!(
                    "Established {} with {} (version {}, session version {})",
                    frame.header.session_id,
                    self.remote_client_id(),
                    ctl.protocol_version,
                    ctl.session_version
                );
                self.send_ack_locked(&mut rx)
            }
            SessionState::Established
            | SessionState::FinWait1
            | SessionState::FinWait2
            | SessionState::Closing => {
                // Our ack for the SynAck was lost; repeat it
                let mut rx = lock(&self.receive);
                self.send_ack_locked(&mut rx)
            }
            _ => Ok(()),
        }
    }

    fn on_fin(&self, ctl: &mut Control, frame: &Frame) -> Result<(), BusError> {
        match ctl.state {
            SessionState::Closed => Ok(()),
            SessionState::FinWait2 => {
                let mut rx = lock(&self.receive);
                self.write_receive(&mut rx, frame)?;
                self.send_ack_locked(&mut rx)?;
                drop(rx);
                ctl.reason = ResultCode::Success;
                self.close_locked(ctl);
                Ok(())
            }
            state if state < SessionState::Closing => {
                let violation = {
                    let mut rx = lock(&self.receive);
                    self.write_receive(&mut rx, frame)?
                };
                if violation {
                    return self.reset_for_violation(ctl);
                }
                ctl.reason = ResultCode::Success;
                self.set_state(ctl, SessionState::Closing);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_data(&self, ctl: &mut Control, frame: &Frame) -> Result<(), BusError> {
        match ctl.state {
            SessionState::SynReceived => {
                // The peer only sends data after seeing our SynAck
                self.set_state(ctl, SessionState::Established);
            }
            SessionState::Established | SessionState::FinWait1 | SessionState::FinWait2 => {}
            state => {
                tracing::debug!("Dropping data on {} in state {}", self.session_id(), state);
                return Ok(());
            }
        }

        let violation = {
            let mut rx = lock(&self.receive);
            self.write_receive(&mut rx, frame)?
        };
        if violation {
            return self.reset_for_violation(ctl);
        }
        Ok(())
    }

    fn on_ack(&self, ctl: &mut Control, frame: &Frame) -> Result<(), BusError> {
        match ctl.state {
            SessionState::SynReceived => {
                self.set_state(ctl, SessionState::Established);
                self.acknowledge(frame.header.sequence)
            }
            SessionState::Established
            | SessionState::FinWait1
            | SessionState::FinWait2
            | SessionState::Closing => self.acknowledge(frame.header.sequence),
            _ => Ok(()),
        }
    }

    fn reset_for_violation(&self, ctl: &mut Control) -> Result<(), BusError> {
        self.send_control(SessionMessage::Rst, ResultCode::Error.to_wire())?;
        self.shutdown_locked(ctl, ResultCode::Error);
        Ok(())
    }

    /// Buffer an inbound Data or Fin frame; returns true on a window violation
    /// that should reset the session
    fn write_receive(&self, rx: &mut ReceiveWindow, frame: &Frame) -> Result<bool, BusError> {
        match rx.insert(frame) {
            Arrival::Accepted { ready, ack_now } => {
                if ready > 0 {
                    self.ready.add_permits(ready);
                }
                if ack_now {
                    self.send_ack_locked(rx)?;
                }
                Ok(false)
            }
            Arrival::Duplicate => {
                tracing::trace!(
                    "Duplicate sequence {} on {}",
                    frame.header.sequence,
                    self.session_id()
                );
                self.send_ack_locked(rx)?;
                Ok(false)
            }
            Arrival::OutOfWindow => {
                tracing::warn!(
                    "Sequence {} outside the receive window of {}",
                    frame.header.sequence,
                    self.session_id()
                );
                Ok(self.config.reset_on_window_violation)
            }
        }
    }

    /// Apply a cumulative ack from the peer
    fn acknowledge(&self, ack: Sequence) -> Result<(), BusError> {
        let mut tx = lock(&self.transmit);
        let now = Instant::now();
        let outcome = tx.acknowledge(ack, now);
        if outcome.freed > 0 {
            self.free_slots.add_permits(outcome.freed);
        }
        if let Some(sequence) = outcome.fast_retransmit {
            tracing::debug!("Fast retransmit of sequence {} on {}", sequence, self.session_id());
            let window = self.advertised();
            tx.resend(sequence, window, now, &mut |frame| self.bus.forward(frame))?;
        }
        Ok(())
    }

    fn update_windows(&self, ctl: &mut Control) -> Result<(), BusError> {
        {
            let mut rx = lock(&self.receive);
            if rx.has_pending_ack() {
                self.send_ack_locked(&mut rx)?;
            }
        }

        let mut tx = lock(&self.transmit);
        let now = Instant::now();
        let window = self.advertised();
        let mut forward = |frame: &Frame| self.bus.forward(frame);

        match tx.retransmit_expired(now, window, &mut forward)? {
            Retransmit::Exhausted => {
                drop(tx);
                tracing::warn!(
                    "{} made no progress after {} retransmissions",
                    self.session_id(),
                    self.config.retransmit.max_retransmits
                );
                self.shutdown_locked(ctl, ResultCode::NotReady);
                return Ok(());
            }
            Retransmit::Sent(count) => {
                tracing::debug!("Retransmitted {} frames on {}", count, self.session_id());
            }
            Retransmit::Idle => {}
        }

        tx.transmit_new(now, window, &mut forward)?;
        Ok(())
    }

    fn update_close_handshake(&self, ctl: &mut Control) {
        if ctl.state == SessionState::FinWait1 {
            if self.try_enqueue(SessionMessage::Fin, Bytes::new()) {
                tracing::debug!("Queued Fin on {}", self.session_id());
                ctl.fin_wait_since = None;
                self.set_state(ctl, SessionState::FinWait2);
                if let Err(e) = self.flush() {
                    tracing::warn!("Bus failure on {}: {}", self.session_id(), e);
                    self.shutdown_locked(ctl, ResultCode::Error);
                    return;
                }
            } else {
                let since = *ctl.fin_wait_since.get_or_insert_with(Instant::now);
                if since.elapsed() > self.config.control_timeout {
                    tracing::warn!("No transmit slot for Fin on {}", self.session_id());
                    self.shutdown_locked(ctl, ResultCode::Aborted);
                    return;
                }
            }
        }

        if ctl.state == SessionState::FinWait2 {
            let strict = ctl.session_version >= SESSION_VERSION_SYNACK;
            if lock(&self.transmit).is_drained(strict) {
                self.close_locked(ctl);
            }
        }

        if ctl.state == SessionState::Closing {
            let terminated = self.role == SessionRole::Server
                && ctl.callbacks == CallbackState::TerminatedCalled;
            if terminated || lock(&self.receive).fin_is_next() {
                self.close_locked(ctl);
            }
        }
    }

    fn flush_pending_ack(&self) {
        let mut rx = lock(&self.receive);
        if rx.has_pending_ack() {
            if let Err(e) = self.send_ack_locked(&mut rx) {
                tracing::debug!("Failed final ack on {}: {}", self.session_id(), e);
            }
        }
    }

    fn shutdown_locked(&self, ctl: &mut Control, reason: ResultCode) {
        match ctl.state {
            SessionState::Closed => {}
            SessionState::Established if reason == ResultCode::Success => {
                ctl.reason = reason;
                ctl.fin_wait_since = Some(Instant::now());
                self.set_state(ctl, SessionState::FinWait1);
            }
            SessionState::FinWait1 | SessionState::FinWait2 | SessionState::Closing => {
                ctl.reason = reason;
                if reason != ResultCode::Success {
                    self.close_locked(ctl);
                }
            }
            _ => {
                ctl.reason = reason;
                self.close_locked(ctl);
            }
        }
    }

    fn close_locked(&self, ctl: &mut Control) {
        self.set_state(ctl, SessionState::Closed);
        self.free_slots.close();
        self.ready.close();
    }

    fn set_state(&self, ctl: &mut Control, state: SessionState) {
        if ctl.state != state {
            tracing::debug!(
                "{} ({}) {} -> {}",
                self.session_id(),
                self.role,
                ctl.state,
                state
            );
            ctl.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn check_sendable(&self) -> Result<(), SessionError> {
        let ctl = lock(&self.control);
        if ctl.state == SessionState::Established {
            Ok(())
        } else {
            Err(Self::state_error(&ctl))
        }
    }

    fn state_error(ctl: &Control) -> SessionError {
        match ctl.state {
            SessionState::Closed => closed_error(ctl.reason),
            SessionState::Listening | SessionState::SynSent | SessionState::SynReceived => {
                SessionError::NotReady
            }
            state => SessionError::InvalidState(format!("session is {}", state)),
        }
    }

    fn advertised(&self) -> WindowSize {
        self.advertised.load(Ordering::Acquire)
    }

    fn frame(&self, message: SessionMessage, payload: Bytes) -> Frame {
        let mut header = MessageHeader::session(
            self.local_client_id,
            self.remote_client_id(),
            message,
            self.session_id(),
            0,
        );
        header.window_size = self.advertised();
        Frame::new(header, payload)
    }

    /// Queue a handshake frame without waiting for a slot
    fn try_enqueue(&self, message: SessionMessage, payload: Bytes) -> bool {
        match self.free_slots.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => return false,
        }

        let frame = self.frame(message, payload);
        if lock(&self.transmit).enqueue(frame).is_some() {
            true
        } else {
            self.free_slots.add_permits(1);
            false
        }
    }

    /// Transmit queued frames the peer has room for
    fn flush(&self) -> Result<(), BusError> {
        let mut tx = lock(&self.transmit);
        self.transmit_locked(&mut tx)
    }

    fn transmit_locked(&self, tx: &mut TransmitWindow) -> Result<(), BusError> {
        let window = self.advertised();
        tx.transmit_new(Instant::now(), window, &mut |frame| self.bus.forward(frame))?;
        Ok(())
    }

    fn send_ack_locked(&self, rx: &mut ReceiveWindow) -> Result<(), BusError> {
        let ack = rx.take_ack();
        self.advertised.store(rx.available(), Ordering::Release);
        tracing::trace!("Acknowledging through {} on {}", ack, self.session_id());
        self.send_control(SessionMessage::Ack, ack)
    }

    /// Send an unsequenced control frame directly on the bus
    fn send_control(&self, message: SessionMessage, sequence: Sequence) -> Result<(), BusError> {
        let mut frame = self.frame(message, Bytes::new());
        frame.header.sequence = sequence;
        match self.bus.forward(&frame) {
            Ok(()) => Ok(()),
            Err(BusError::NotReady) => {
                tracing::trace!("Bus busy, dropped {:?} on {}", message, self.session_id());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("remote_client_id", &self.remote_client_id())
            .field("protocol", &self.protocol)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

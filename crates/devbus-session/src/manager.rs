//! Session manager: routing, lifecycle and id allocation
//!
//! The [`SessionManager`] owns every session opened through one message bus
//! endpoint. Inbound session-layer frames are routed by
//! [`SessionManager::handle_received_session_message`]; sessions are ticked
//! and reaped by [`SessionManager::update_sessions`], which is the only place
//! a closed session leaves the registry.
//!
//! # Locking
//!
//! One mutex guards the session map and the protocol server map together.
//! It is taken before any session lock and is never held while a protocol
//! server or client callback runs, nor across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use devbus_core::{ManagerConfig, ManagerError, MessageBus, SessionError};
use devbus_protocol::{
    ClientId, Frame, MessageHeader, Protocol, ResultCode, SessionId, SessionMessage,
    SynAckPayload, SynPayload, Version, SESSION_VERSION_RANGE,
};

use crate::server::{EstablishSessionInfo, ProtocolClient, ProtocolServer};
use crate::session::{lock, Session, SessionRole, SessionState};

/// Bits of a session id chosen by its owner
const CLIENT_SESSION_ID_BITS: u32 = 16;
const CLIENT_SESSION_ID_MASK: u32 = (1 << CLIENT_SESSION_ID_BITS) - 1;

/// Frames drained from the bus by one [`SessionManager::pump`] call
const MAX_FRAMES_PER_PUMP: usize = 1024;

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<Session>>,
    servers: HashMap<Protocol, Arc<dyn ProtocolServer>>,
}

/// Routes session-layer frames and owns the lifecycle of every session
pub struct SessionManager {
    config: ManagerConfig,
    bus: RwLock<Option<Arc<dyn MessageBus>>>,
    registry: Mutex<Registry>,
    last_session_id: AtomicU32,
}

impl SessionManager {
    /// Create an unbound manager
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            bus: RwLock::new(None),
            registry: Mutex::new(Registry::default()),
            last_session_id: AtomicU32::new(rand::random()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Attach the manager to a message bus endpoint
    pub fn bind(&self, bus: Arc<dyn MessageBus>) {
        tracing::debug!("Session manager bound as {}", bus.client_id());
        *self.bus.write().unwrap_or_else(|e| e.into_inner()) = Some(bus);
    }

    /// Detach from the message bus, returning it
    pub fn unbind(&self) -> Option<Arc<dyn MessageBus>> {
        self.bus.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_bound(&self) -> bool {
        self.bus.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Client id of the bound bus endpoint
    pub fn client_id(&self) -> Option<ClientId> {
        self.bus().ok().map(|bus| bus.client_id())
    }

    fn bus(&self) -> Result<Arc<dyn MessageBus>, ManagerError> {
        self.bus
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ManagerError::NotBound)
    }

    /// Look up an open or closing session by id
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        lock(&self.registry).sessions.get(&id).cloned()
    }

    /// Every session currently tracked
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.registry).sessions.values().cloned().collect()
    }

    /// Number of sessions currently tracked
    pub fn session_count(&self) -> usize {
        lock(&self.registry).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.session_count() == 0
    }

    pub fn has_protocol_server(&self, protocol: Protocol) -> bool {
        lock(&self.registry).servers.contains_key(&protocol)
    }

    /// Make `server` the handler for incoming sessions on its protocol
    pub fn register_protocol_server(
        &self,
        server: Arc<dyn ProtocolServer>,
    ) -> Result<(), ManagerError> {
        let protocol = server.protocol();
        if !protocol.is_session_capable() {
            return Err(ManagerError::ReservedProtocol(protocol));
        }

        let mut registry = lock(&self.registry);
        if registry.servers.contains_key(&protocol) {
            return Err(ManagerError::AlreadyRegistered(protocol));
        }
        registry.servers.insert(protocol, server);
        tracing::info!("Registered protocol server for {}", protocol);
        Ok(())
    }

    /// Remove the server for `protocol` and close every session bound to it
    ///
    /// Each established session gets its termination callback before this
    /// returns, and its peer is sent a `Rst`. Returns the number of sessions
    /// closed.
    pub fn unregister_protocol_server(&self, protocol: Protocol) -> Result<usize, ManagerError> {
        let affected: Vec<Arc<Session>> = {
            let mut registry = lock(&self.registry);
            if registry.servers.remove(&protocol).is_none() {
                return Err(ManagerError::NotRegistered(protocol));
            }
            registry
                .sessions
                .values()
                .filter(|s| s.role() == SessionRole::Server && s.protocol() == protocol)
                .cloned()
                .collect()
        };

        let mut closed = 0;
        for session in &affected {
            let owed = session.detach_server();
            let reason = if session.state().is_closed() {
                session.termination_reason()
            } else {
                session.abort(ResultCode::EndOfStream);
                closed += 1;
                ResultCode::EndOfStream
            };
            if let Some(server) = owed {
                server.session_terminated(session, reason);
            }
        }

        tracing::info!(
            "Unregistered protocol server for {} ({} sessions closed)",
            protocol,
            closed
        );
        Ok(closed)
    }

    /// Open a client session to `info.remote_client_id`
    ///
    /// The returned session is in [`SessionState::SynSent`]; use
    /// [`Session::wait_for_connection`] to wait for the peer. On failure no
    /// session is left behind.
    pub fn establish_session_for_client(
        &self,
        info: EstablishSessionInfo,
    ) -> Result<Arc<Session>, ManagerError> {
        let bus = self.bus()?;
        if !info.protocol.is_session_capable() {
            return Err(ManagerError::ReservedProtocol(info.protocol));
        }
        if info.remote_client_id == ClientId::BROADCAST {
            return Err(SessionError::InvalidParameter("remote client id").into());
        }
        if info.min_protocol_version > info.max_protocol_version {
            return Err(SessionError::InvalidParameter("protocol version range").into());
        }

        let session = Arc::new(Session::new(
            bus,
            SessionRole::Client,
            info.protocol,
            self.config.session.clone(),
        ));

        let mut registry = lock(&self.registry);
        let session_id =
            self.allocate_session_id(&registry.sessions, |counter| counter & CLIENT_SESSION_ID_MASK)?;

        session.connect(
            info.remote_client_id,
            session_id,
            info.min_protocol_version,
            info.max_protocol_version,
        )?;
        registry.sessions.insert(session_id, Arc::clone(&session));
        drop(registry);

        tracing::debug!(
            "Opened {} to {} for {}",
            session_id,
            info.remote_client_id,
            info.protocol
        );
        Ok(session)
    }

    /// Open a session for `client`, wait up to `timeout` for the handshake,
    /// and check the negotiated version against the client's range
    ///
    /// The client's callbacks are driven accordingly. Frames must be pumped
    /// by another task, typically a [`crate::MessageChannel`], while this
    /// waits.
    pub async fn connect_client(
        &self,
        client: &dyn ProtocolClient,
        remote: ClientId,
        timeout: Duration,
    ) -> Result<Arc<Session>, ManagerError> {
        let (min, max) = client.version_range();
        let info = EstablishSessionInfo::new(client.protocol(), remote, min, max);
        let session = self.establish_session_for_client(info)?;

        if let Err(e) = session.wait_for_connection(timeout).await {
            let reason = e.result_code();
            session.shutdown(reason);
            client.session_terminated(&session, reason);
            return Err(e.into());
        }

        let negotiated = session.protocol_version();
        if negotiated < min || negotiated > max {
            tracing::warn!(
                "{} negotiated version {} outside {}..={}",
                session.session_id(),
                negotiated,
                min,
                max
            );
            session.abort(ResultCode::VersionMismatch);
            client.session_terminated(&session, ResultCode::VersionMismatch);
            return Err(SessionError::VersionMismatch {
                negotiated,
                min,
                max,
            }
            .into());
        }

        client.session_established(&session);
        Ok(session)
    }

    /// Route one inbound session-layer frame
    pub fn handle_received_session_message(&self, frame: &Frame) -> Result<(), ManagerError> {
        let bus = self.bus()?;
        let Some(message) = frame.session_message() else {
            tracing::warn!(
                "Ignoring {} frame from {} in session routing",
                frame.header.protocol_id,
                frame.header.src_client_id
            );
            return Ok(());
        };

        tracing::trace!(
            "{:?} from {} for {} (sequence {})",
            message,
            frame.header.src_client_id,
            frame.header.session_id,
            frame.header.sequence
        );

        match message {
            SessionMessage::Syn => self.accept_syn(&bus, frame),
            SessionMessage::SynAck => self.route_syn_ack(&bus, frame),
            SessionMessage::Fin
            | SessionMessage::Data
            | SessionMessage::Ack
            | SessionMessage::Rst => {
                match self.find_open_session(frame.header.session_id, frame.header.src_client_id) {
                    Some(session) => session.handle_message(frame),
                    None if message == SessionMessage::Rst => {
                        tracing::trace!("Dropping Rst for unknown {}", frame.header.session_id);
                    }
                    None => send_reset(&bus, frame, ResultCode::Unavailable, 0),
                }
            }
        }
        Ok(())
    }

    fn accept_syn(&self, bus: &Arc<dyn MessageBus>, frame: &Frame) {
        let syn = match SynPayload::decode(&frame.payload) {
            Ok(syn) => syn,
            Err(e) => {
                tracing::warn!("Malformed Syn from {}: {}", frame.header.src_client_id, e);
                send_reset(bus, frame, ResultCode::Error, 0);
                return;
            }
        };
        if frame.header.sequence == u64::MAX {
            tracing::warn!(
                "Syn from {} starts at the last sequence number",
                frame.header.src_client_id
            );
            send_reset(bus, frame, ResultCode::Error, 0);
            return;
        }

        let server = {
            let registry = lock(&self.registry);
            if self.is_duplicate_syn(&registry, frame) {
                tracing::trace!("Duplicate Syn for {}", frame.header.session_id);
                return;
            }
            registry.servers.get(&syn.protocol).cloned()
        };
        let Some(server) = server else {
            tracing::debug!(
                "No server for {} requested by {}",
                syn.protocol,
                frame.header.src_client_id
            );
            send_reset(bus, frame, ResultCode::Unavailable, 0);
            return;
        };

        let min = syn.min_version;
        let max = if syn.session_version >= SESSION_VERSION_RANGE {
            syn.max_version.max(min)
        } else {
            min
        };
        let Some(version) = server.get_supported_version(min, max) else {
            let preferred = server.preferred_version();
            tracing::debug!(
                "{} cannot serve versions {}..={} (prefers {})",
                syn.protocol,
                min,
                max,
                preferred
            );
            send_reset(bus, frame, ResultCode::VersionMismatch, preferred);
            return;
        };

        let session = match self.bind_server_session(bus, &server, frame, syn.session_version, version)
        {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Could not open session for {}: {}", syn.protocol, e);
                send_reset(bus, frame, e.result_code(), version);
                return;
            }
        };

        if !server.accept_session(&session) {
            tracing::debug!("{} rejected {}", syn.protocol, session.session_id());
            self.remove(&session);
            session.shutdown(ResultCode::Rejected);
            send_reset(bus, frame, ResultCode::Rejected, version);
            return;
        }

        session.handle_message(frame);
    }

    fn bind_server_session(
        &self,
        bus: &Arc<dyn MessageBus>,
        server: &Arc<dyn ProtocolServer>,
        frame: &Frame,
        peer_session_version: u8,
        version: Version,
    ) -> Result<Arc<Session>, ManagerError> {
        let session = Arc::new(Session::new(
            Arc::clone(bus),
            SessionRole::Server,
            server.protocol(),
            self.config.session.clone(),
        ));

        let remote_prefix = frame.header.session_id.as_u32() << CLIENT_SESSION_ID_BITS;
        let mut registry = lock(&self.registry);
        // The server may have been unregistered since it was looked up
        let still_registered = registry
            .servers
            .get(&server.protocol())
            .is_some_and(|current| Arc::ptr_eq(current, server));
        if !still_registered {
            return Err(ManagerError::NotRegistered(server.protocol()));
        }
        let session_id = self.allocate_session_id(&registry.sessions, |counter| {
            (counter & CLIENT_SESSION_ID_MASK) | remote_prefix
        })?;

        session.bind_to_server(
            Arc::clone(server),
            frame.header.src_client_id,
            peer_session_version,
            version,
            session_id,
        )?;
        registry.sessions.insert(session_id, Arc::clone(&session));
        Ok(session)
    }

    /// A retransmitted Syn for a session that is already open
    fn is_duplicate_syn(&self, registry: &Registry, frame: &Frame) -> bool {
        let initial = frame.header.session_id.as_u32() & CLIENT_SESSION_ID_MASK;
        registry.sessions.values().any(|session| {
            session.role() == SessionRole::Server
                && session.remote_client_id() == frame.header.src_client_id
                && session.session_id().as_u32() >> CLIENT_SESSION_ID_BITS == initial
                && !session.state().is_closed()
        })
    }

    fn route_syn_ack(&self, bus: &Arc<dyn MessageBus>, frame: &Frame) {
        let final_id = frame.header.session_id;
        let source = frame.header.src_client_id;
        if frame.header.sequence == u64::MAX {
            tracing::warn!("Dropping SynAck from {} at the last sequence number", source);
            return;
        }

        let routed = {
            let mut registry = lock(&self.registry);
            let existing = registry
                .sessions
                .get(&final_id)
                .filter(|s| s.remote_client_id() == source)
                .cloned();

            match existing {
                Some(session) => Ok(Some(session)),
                None => match SynAckPayload::decode(&frame.payload) {
                    Ok(payload) => Ok(self.rekey(&mut registry, payload.initial_session_id, frame)),
                    Err(e) => Err(e),
                },
            }
        };

        match routed {
            Ok(Some(session)) => session.handle_message(frame),
            Ok(None) => send_reset(bus, frame, ResultCode::Unavailable, 0),
            Err(e) => {
                tracing::warn!("Malformed SynAck from {}: {}", source, e);
            }
        }
    }

    /// Move a client session from its provisional id to the peer-assigned one
    ///
    /// Returns `None` when no session matches, or when the final id collides
    /// with another session, in which case the session is closed.
    fn rekey(
        &self,
        registry: &mut Registry,
        initial: SessionId,
        frame: &Frame,
    ) -> Option<Arc<Session>> {
        let final_id = frame.header.session_id;
        let session = registry
            .sessions
            .get(&initial)
            .filter(|s| {
                s.role() == SessionRole::Client
                    && s.remote_client_id() == frame.header.src_client_id
                    && s.state() == SessionState::SynSent
            })
            .cloned()?;

        registry.sessions.remove(&initial);
        if !final_id.is_valid() || registry.sessions.contains_key(&final_id) {
            tracing::warn!("Cannot re-key {} to {}: id in use", initial, final_id);
            session.shutdown(ResultCode::Error);
            return None;
        }

        tracing::debug!("Re-keyed {} to {}", initial, final_id);
        registry.sessions.insert(final_id, Arc::clone(&session));
        Some(session)
    }

    fn find_open_session(&self, id: SessionId, source: ClientId) -> Option<Arc<Session>> {
        let session = self.session(id)?;
        if session.remote_client_id() != source {
            tracing::debug!(
                "{} belongs to {}, not {}",
                id,
                session.remote_client_id(),
                source
            );
            return None;
        }
        if session.state().is_closed() {
            return None;
        }
        Some(session)
    }

    fn allocate_session_id<F>(
        &self,
        sessions: &HashMap<SessionId, Arc<Session>>,
        compose: F,
    ) -> Result<SessionId, ManagerError>
    where
        F: Fn(u32) -> u32,
    {
        let attempts = self.config.max_id_attempts;
        for _ in 0..attempts {
            let counter = self
                .last_session_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            let candidate = SessionId::new(compose(counter));
            if candidate.is_valid() && !sessions.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ManagerError::IdSpaceExhausted { attempts })
    }

    fn remove(&self, session: &Arc<Session>) {
        lock(&self.registry)
            .sessions
            .retain(|_, tracked| !Arc::ptr_eq(tracked, session));
    }

    /// Tick every session and drop the ones that have closed
    ///
    /// A client session that nobody outside the manager still holds is
    /// closed gracefully. Returns the number of sessions removed.
    pub fn update_sessions(&self) -> usize {
        let sessions = self.sessions();
        let mut closed = Vec::new();

        for session in sessions.iter() {
            // The registry and this snapshot hold the only references
            if session.role() == SessionRole::Client && Arc::strong_count(session) <= 2 {
                session.release_orphan();
            }
            if session.update() == SessionState::Closed {
                closed.push(Arc::clone(session));
            }
        }

        if closed.is_empty() {
            return 0;
        }

        let mut registry = lock(&self.registry);
        let before = registry.sessions.len();
        registry
            .sessions
            .retain(|_, tracked| !closed.iter().any(|c| Arc::ptr_eq(c, tracked)));
        let removed = before - registry.sessions.len();
        drop(registry);

        for session in &closed {
            tracing::debug!(
                "Removed {} ({})",
                session.session_id(),
                session.termination_reason()
            );
        }
        removed
    }

    /// Drain inbound frames from the bus, waiting up to `timeout` for the
    /// first one, and route the session-layer ones
    ///
    /// Returns the number of frames routed.
    pub async fn pump(&self, timeout: Duration) -> Result<usize, ManagerError> {
        let bus = self.bus()?;
        let local = bus.client_id();
        let mut wait = timeout;
        let mut routed = 0;

        for _ in 0..MAX_FRAMES_PER_PUMP {
            let Some(frame) = bus.receive(wait).await? else {
                break;
            };
            wait = Duration::ZERO;

            if frame.header.protocol_id != Protocol::SESSION {
                tracing::trace!(
                    "Skipping {} frame from {}",
                    frame.header.protocol_id,
                    frame.header.src_client_id
                );
                continue;
            }
            if frame.header.dst_client_id != local {
                tracing::warn!(
                    "Session frame for {} delivered to {}",
                    frame.header.dst_client_id,
                    local
                );
                continue;
            }

            self.handle_received_session_message(&frame)?;
            routed += 1;
        }
        Ok(routed)
    }

    /// Shut down every session to `client`, which has left the bus
    pub fn handle_client_disconnection(&self, client: ClientId) -> usize {
        let affected: Vec<_> = self
            .sessions()
            .into_iter()
            .filter(|s| s.remote_client_id() == client)
            .collect();

        for session in &affected {
            session.shutdown(ResultCode::NotReady);
        }
        if !affected.is_empty() {
            tracing::info!("{} disconnected; closing {} sessions", client, affected.len());
        }
        affected.len()
    }

    /// The bus connection itself is gone
    pub async fn handle_transport_disconnect(&self) {
        tracing::warn!("Transport disconnected; shutting down all sessions");
        self.shut_down_all_sessions().await;
    }

    /// Close every session, gracefully if possible
    ///
    /// Sessions are first asked to close with [`ResultCode::Success`] while
    /// the bus keeps being pumped, for at most the configured shutdown
    /// timeout. Whatever remains is then closed with
    /// [`ResultCode::EndOfStream`]. The registry is empty on return.
    pub async fn shut_down_all_sessions(&self) {
        let sessions = self.sessions();
        if sessions.is_empty() {
            return;
        }

        tracing::info!("Shutting down {} sessions", sessions.len());
        for session in &sessions {
            session.close();
        }
        drop(sessions);

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !self.is_empty() && Instant::now() < deadline {
            let connected = self.bus().map(|bus| bus.is_connected()).unwrap_or(false);
            if !connected {
                break;
            }
            if let Err(e) = self.pump(self.config.update_interval).await {
                tracing::warn!("Stopped draining sessions: {}", e);
                break;
            }
            self.update_sessions();
        }

        let remaining = self.sessions();
        if !remaining.is_empty() {
            tracing::info!("Forcing {} sessions closed", remaining.len());
            for session in &remaining {
                session.shutdown(ResultCode::EndOfStream);
            }
        }
        drop(remaining);
        self.update_sessions();

        let mut registry = lock(&self.registry);
        if !registry.sessions.is_empty() {
            tracing::warn!("Dropping {} sessions that did not close", registry.sessions.len());
            registry.sessions.clear();
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("client_id", &self.client_id())
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// Answer `frame` with a `Rst` so the peer stops waiting on it
fn send_reset(bus: &Arc<dyn MessageBus>, frame: &Frame, reason: ResultCode, version: Version) {
    let mut header = MessageHeader::session(
        bus.client_id(),
        frame.header.src_client_id,
        SessionMessage::Rst,
        frame.header.session_id,
        reason.to_wire(),
    );
    header.window_size = version;

    tracing::debug!(
        "Resetting {} from {}: {}",
        frame.header.session_id,
        frame.header.src_client_id,
        reason
    );
    if let Err(e) = bus.forward(&Frame::control(header)) {
        tracing::debug!("Failed to send Rst to {}: {}", frame.header.src_client_id, e);
    }
}

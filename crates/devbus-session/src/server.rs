//! Collaborator traits for the sub-protocols that run over sessions

use std::sync::Arc;

use devbus_protocol::{ClientId, Protocol, ResultCode, Version};

use crate::session::Session;

/// Handler that accepts sessions for one sub-protocol
///
/// Callbacks run on the thread driving the session manager and must not
/// block on session I/O.
pub trait ProtocolServer: Send + Sync {
    /// Protocol this server handles
    fn protocol(&self) -> Protocol;

    /// Pick a version inside `min..=max`, or `None` if none is supported
    fn get_supported_version(&self, min: Version, max: Version) -> Option<Version>;

    /// Version advertised to a client whose range could not be satisfied
    fn preferred_version(&self) -> Version {
        0
    }

    /// Decide whether to take an incoming session
    fn accept_session(&self, session: &Arc<Session>) -> bool;

    /// The peer completed the handshake
    fn session_established(&self, session: &Arc<Session>);

    /// Periodic tick for an established session
    fn update_session(&self, session: &Arc<Session>);

    /// The session ended; called at most once, and only after
    /// [`ProtocolServer::session_established`]
    fn session_terminated(&self, session: &Arc<Session>, reason: ResultCode);
}

/// Handler that originates sessions for one sub-protocol
pub trait ProtocolClient: Send + Sync {
    /// Protocol this client speaks
    fn protocol(&self) -> Protocol;

    /// Versions this client can speak, as `(min, max)`
    fn version_range(&self) -> (Version, Version);

    /// The session reached the established state with an acceptable version
    fn session_established(&self, _session: &Arc<Session>) {}

    /// The session ended or never came up
    fn session_terminated(&self, _session: &Arc<Session>, _reason: ResultCode) {}
}

/// Parameters for opening a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishSessionInfo {
    pub protocol: Protocol,
    pub remote_client_id: ClientId,
    pub min_protocol_version: Version,
    pub max_protocol_version: Version,
}

impl EstablishSessionInfo {
    /// Describe a session to `remote` accepting versions `min..=max`
    pub fn new(protocol: Protocol, remote: ClientId, min: Version, max: Version) -> Self {
        Self {
            protocol,
            remote_client_id: remote,
            min_protocol_version: min,
            max_protocol_version: max,
        }
    }
}

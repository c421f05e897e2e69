//! Session handshake states and roles

use std::fmt;

/// Connection state of a session
///
/// The ordering follows the handshake: every state after
/// [`SessionState::Established`] is part of a close sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Initial and terminal state
    Closed = 0,
    /// Bound to a server, waiting for the peer's Syn
    Listening = 1,
    /// Client queued its Syn
    SynSent = 2,
    /// Server queued its SynAck
    SynReceived = 3,
    /// Data may flow in both directions
    Established = 4,
    /// Local close requested, Fin not yet queued
    FinWait1 = 5,
    /// Peer sent Fin first
    Closing = 6,
    /// Fin queued, draining the transmit window
    FinWait2 = 7,
}

impl SessionState {
    /// Whether the session has finished
    pub fn is_closed(&self) -> bool {
        *self == SessionState::Closed
    }

    /// Whether the session is shutting down but not yet closed
    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            SessionState::FinWait1 | SessionState::Closing | SessionState::FinWait2
        )
    }

    /// Whether the handshake is still in progress
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            SessionState::Listening | SessionState::SynSent | SessionState::SynReceived
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "closed",
            SessionState::Listening => "listening",
            SessionState::SynSent => "syn-sent",
            SessionState::SynReceived => "syn-received",
            SessionState::Established => "established",
            SessionState::FinWait1 => "fin-wait-1",
            SessionState::Closing => "closing",
            SessionState::FinWait2 => "fin-wait-2",
        };
        f.write_str(name)
    }
}

/// Which side of the handshake a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Originated the session with a Syn
    Client,
    /// Accepted the session on behalf of a protocol server
    Server,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Client => f.write_str("client"),
            SessionRole::Server => f.write_str("server"),
        }
    }
}

/// Progress of the protocol server callbacks for a server session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallbackState {
    None,
    EstablishedCalled,
    TerminatedCalled,
}

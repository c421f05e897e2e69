//! devbus-session: Reliable, ordered sessions over an unreliable message bus
//!
//! Clients attached to a shared, best-effort message bus open sessions to
//! each other for a single sub-protocol. Each [`Session`] runs a
//! three-way handshake, sliding-window flow control with retransmission,
//! and an orderly close. A [`SessionManager`] routes inbound frames to
//! sessions, hands incoming sessions to registered [`ProtocolServer`]s and
//! reaps closed sessions. A [`MessageChannel`] drives the manager from a
//! bus endpoint.

pub mod channel;
pub mod manager;
pub mod server;
pub mod session;
pub mod transport;

pub use channel::MessageChannel;
pub use manager::SessionManager;
pub use server::{EstablishSessionInfo, ProtocolClient, ProtocolServer};
pub use session::{Session, SessionRole, SessionState, WindowSnapshot};
pub use transport::{LinkConditions, LinkStats, MemoryBus, MemoryRouter, StreamBus};

//! devbus-core: Core abstractions and configuration for devbus
//!
//! This crate provides the error taxonomy, configuration structures and the
//! message-bus collaborator trait shared by the session layer and tools.

pub mod config;
pub mod error;
pub mod traits;

pub use error::{BusError, ConfigError, DevbusError, ManagerError, SessionError};
pub use config::{ManagerConfig, RetransmitConfig, SessionConfig};
pub use traits::MessageBus;

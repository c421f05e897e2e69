//! Core trait definitions

mod bus;

pub use bus::MessageBus;

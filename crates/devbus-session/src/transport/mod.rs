//! Message bus adapters
//!
//! - [`MemoryRouter`] / [`MemoryBus`]: in-process bus with optional seeded
//!   loss, duplication and reordering
//! - [`StreamBus`]: frames over any byte stream using [`devbus_protocol::FrameCodec`]

mod memory;
mod stream;

pub use memory::{LinkConditions, LinkStats, MemoryBus, MemoryRouter};
pub use stream::StreamBus;

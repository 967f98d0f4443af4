//! Event serialization and buffering.
pub mod event;
pub mod ring_buffer;

pub use event::{EventDecoder, EventRecord};
pub use ring_buffer::EventRingBuffer;

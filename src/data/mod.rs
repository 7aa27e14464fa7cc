//! Decoded sample storage.
pub mod frame;
pub mod ring_buffer;

pub use frame::SampleFrame;
pub use ring_buffer::RingBuffer;

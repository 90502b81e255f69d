//! Tether Pump - fixed-capacity byte storage for captured child output.
//!
//! The pump sits between a child's pipes and the code that consumes its
//! output. Bytes land in a [`RingBuffer`] without ever blocking or growing,
//! and are read back out as raw chunks, lines, or a byte-at-a-time stream.

mod error;
mod ring_buffer;
mod sink;

pub use error::RingError;
pub use ring_buffer::RingBuffer;
pub use sink::ByteSink;

/// Ring capacity for the "small" pipe preset.
pub const SMALL_CAPACITY: usize = 256;

/// Ring capacity for the "large" pipe preset.
pub const LARGE_CAPACITY: usize = 8192;

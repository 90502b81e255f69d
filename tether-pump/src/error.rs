//! Ring buffer error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RingError {
    /// The buffer is full and holds no newline, so no line can ever complete
    /// until the caller consumes bytes some other way.
    #[error("ring buffer full ({capacity} bytes) without a line terminator")]
    LineTooLong { capacity: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

//! Byte-at-a-time consumers for ring contents.

/// Receives bytes pushed out of a [`RingBuffer`](crate::RingBuffer).
///
/// `begin` is called once with the number of bytes about to arrive, then
/// `push` once per byte, then `end`.
pub trait ByteSink {
    fn begin(&mut self, _len: usize) {}

    fn push(&mut self, byte: u8);

    fn end(&mut self) {}
}

impl ByteSink for Vec<u8> {
    fn begin(&mut self, len: usize) {
        self.reserve(len);
    }

    fn push(&mut self, byte: u8) {
        Vec::push(self, byte);
    }
}

//! Fixed-capacity ring buffer for capturing child output.
//!
//! Unlike an overwriting log ring, this buffer never drops old data to make
//! room for new data: a write that does not fit is truncated to the free
//! space and the caller sees the short count. The producer never blocks.
//!
//! Cursors are offsets into the owned storage. Equal cursors mean the buffer
//! is either empty or completely full; the `full` flag tells the two apart.
//! All wrap arithmetic lives in `advance`, `occupied` and `free`.

use std::fmt;
use std::io::{self, Read, Write};

use crate::error::RingError;
use crate::sink::ByteSink;

/// Buffers below this capacity include their raw contents in `Debug` output.
const PREVIEW_LIMIT: usize = 100;

/// A fixed-size byte ring with independent read and write cursors.
///
/// Single owner, no internal locking. A capacity of zero is valid and turns
/// the buffer into a sink that accepts nothing.
pub struct RingBuffer {
    /// The buffer storage.
    data: Box<[u8]>,

    /// Offset of the next byte to read.
    read_pos: usize,

    /// Offset where the next byte is written.
    write_pos: usize,

    /// Set when the cursors meet because the buffer filled up.
    full: bool,

    /// Bytes moved by the most recent read; the default `unread` distance.
    last_transfer: usize,

    /// Bytes consumed since the last clear that still sit behind the read
    /// cursor and can be rewound over.
    consumed: usize,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            full: false,
            last_transfer: 0,
            consumed: 0,
        }
    }

    /// Replace the storage with a new one of `capacity` bytes. Buffered data
    /// is discarded.
    pub fn reallocate(&mut self, capacity: usize) {
        *self = Self::new(capacity);
    }

    /// Total number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes waiting to be read.
    pub fn size(&self) -> usize {
        self.occupied()
    }

    /// Number of bytes that can still be written.
    pub fn capacity_remaining(&self) -> usize {
        self.free()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Number of bytes moved by the most recent read.
    pub fn last_transfer(&self) -> usize {
        self.last_transfer
    }

    /// Drop everything buffered. Used between runs so a reused buffer never
    /// hands out output from a previous child.
    pub fn clear(&mut self) {
        self.read_pos = self.write_pos;
        self.full = false;
        self.last_transfer = 0;
        self.consumed = 0;
    }

    /// Copy as much of `input` as fits. Returns the number of bytes accepted.
    pub fn write(&mut self, input: &[u8]) -> usize {
        let len = input.len().min(self.free());
        if len == 0 {
            return 0;
        }

        let start = self.write_pos;
        let first = (self.capacity() - start).min(len);
        self.data[start..start + first].copy_from_slice(&input[..first]);
        self.data[..len - first].copy_from_slice(&input[first..len]);
        self.commit_write(len);
        len
    }

    /// Read directly from `source` into free storage.
    ///
    /// Performs at most two reads, split where the write cursor wraps. A
    /// source that would block (or was interrupted) ends the transfer
    /// without error; any other read error is returned. End of stream also
    /// yields whatever was read so far, possibly 0.
    pub fn write_from<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<usize> {
        let mut total = 0;

        for _ in 0..2 {
            let span = self.contiguous_free();
            if span == 0 {
                break;
            }

            let start = self.write_pos;
            let n = match source.read(&mut self.data[start..start + span]) {
                Ok(n) => n,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    break;
                }
                Err(e) => return Err(e),
            };
            if n == 0 {
                break;
            }

            self.commit_write(n);
            total += n;
            if n < span {
                break;
            }
        }

        Ok(total)
    }

    /// Copy up to `dest.len()` bytes out of the buffer and consume them.
    pub fn read_data(&mut self, dest: &mut [u8]) -> usize {
        let len = dest.len().min(self.occupied());
        if len == 0 {
            return 0;
        }

        self.copy_out(&mut dest[..len]);
        self.consume(len);
        self.last_transfer = len;
        len
    }

    /// Copy up to `dest.len()` bytes without consuming them.
    pub fn peek(&self, dest: &mut [u8]) -> usize {
        let len = dest.len().min(self.occupied());
        self.copy_out(&mut dest[..len]);
        len
    }

    /// Read one line into `dest`, excluding the `\n`.
    ///
    /// Returns `Ok(None)` when no line is available. With `partial_ok` the
    /// bytes buffered so far count as a line even without a terminator.
    /// A line longer than `dest` is returned in pieces: the first
    /// `dest.len()` bytes now, the rest (and its terminator) on later calls.
    ///
    /// A full buffer without any `\n` is an error when `partial_ok` is false,
    /// since nothing short of consuming bytes can make a line appear.
    /// An empty `dest` only ever takes empty lines; a pending non-empty line
    /// yields `Ok(None)` and stays buffered.
    pub fn read_line(
        &mut self,
        dest: &mut [u8],
        partial_ok: bool,
    ) -> Result<Option<usize>, RingError> {
        let Some((line_len, terminated)) = self.next_line(partial_ok)? else {
            return Ok(None);
        };
        if dest.is_empty() && line_len > 0 {
            return Ok(None);
        }

        let copied = line_len.min(dest.len());
        self.copy_out(&mut dest[..copied]);
        let consumed = if terminated && copied == line_len {
            copied + 1
        } else {
            copied
        };
        self.consume(consumed);
        self.last_transfer = consumed;
        Ok(Some(copied))
    }

    /// Like [`read_line`](Self::read_line) but writes the whole line to `out`.
    pub fn read_line_to<W: Write + ?Sized>(
        &mut self,
        out: &mut W,
        partial_ok: bool,
    ) -> Result<Option<usize>, RingError> {
        let Some((line_len, terminated)) = self.next_line(partial_ok)? else {
            return Ok(None);
        };

        let (head, tail) = self.segments(line_len);
        out.write_all(head)?;
        out.write_all(tail)?;
        let consumed = line_len + usize::from(terminated);
        self.consume(consumed);
        self.last_transfer = consumed;
        Ok(Some(line_len))
    }

    /// Write everything buffered to `out` and consume it.
    pub fn read_to<W: Write + ?Sized>(&mut self, out: &mut W) -> io::Result<usize> {
        let len = self.occupied();
        if len == 0 {
            return Ok(0);
        }

        let (head, tail) = self.segments(len);
        out.write_all(head)?;
        out.write_all(tail)?;
        self.consume(len);
        self.last_transfer = len;
        Ok(len)
    }

    /// Append everything buffered to `out`.
    pub fn read_into_vec(&mut self, out: &mut Vec<u8>) -> usize {
        let len = self.occupied();
        if len == 0 {
            return 0;
        }

        let (head, tail) = self.segments(len);
        out.reserve(len);
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        self.consume(len);
        self.last_transfer = len;
        len
    }

    /// Append everything buffered to `out`, replacing invalid UTF-8.
    pub fn read_into_string(&mut self, out: &mut String) -> usize {
        let mut bytes = Vec::new();
        let len = self.read_into_vec(&mut bytes);
        out.push_str(&String::from_utf8_lossy(&bytes));
        len
    }

    /// Consume exactly `min(max, size)` bytes.
    ///
    /// When `dest` can hold `max` bytes this is a plain read. Otherwise a
    /// prefix is copied only if `partial_ok`, and the remainder is
    /// discarded either way.
    pub fn read_max(&mut self, dest: &mut [u8], max: usize, partial_ok: bool) -> usize {
        if dest.len() >= max {
            return self.read_data(&mut dest[..max]);
        }

        let copied = if partial_ok { self.read_data(dest) } else { 0 };
        self.discard(max - copied);
        copied
    }

    /// Skip up to `n` bytes. Returns the number skipped.
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.occupied());
        self.consume(n);
        n
    }

    /// Rewind the read cursor by `len` bytes, or by the size of the most
    /// recent read when `len` is 0.
    ///
    /// Fails without moving when asked to rewind past data that has not been
    /// read, or over bytes that have since been overwritten.
    pub fn unread(&mut self, len: usize) -> bool {
        let rewind = if len == 0 { self.last_transfer } else { len };
        if rewind == 0 {
            return true;
        }
        if rewind > self.free().min(self.consumed) {
            return false;
        }

        let cap = self.capacity();
        self.read_pos = (self.read_pos + cap - rewind) % cap;
        if self.read_pos == self.write_pos {
            self.full = true;
        }
        self.consumed -= rewind;
        self.last_transfer = 0;
        true
    }

    /// Move up to `n` bytes into `target`, bounded by its free space.
    pub fn copy_to(&mut self, target: &mut RingBuffer, n: usize) -> usize {
        let len = n.min(self.occupied()).min(target.free());
        if len == 0 {
            return 0;
        }

        let (head, tail) = self.segments(len);
        target.write(head);
        target.write(tail);
        self.consume(len);
        self.last_transfer = len;
        len
    }

    /// Feed up to `n` bytes to `sink` one at a time.
    pub fn push_to(&mut self, sink: &mut dyn ByteSink, n: usize) -> usize {
        let len = n.min(self.occupied());
        if len == 0 {
            return 0;
        }

        sink.begin(len);
        let (head, tail) = self.segments(len);
        for &byte in head.iter().chain(tail) {
            sink.push(byte);
        }
        sink.end();
        self.consume(len);
        self.last_transfer = len;
        len
    }

    // -------------------------------------------------------------------------
    // Cursor arithmetic
    // -------------------------------------------------------------------------

    fn advance(&self, cursor: usize, n: usize) -> usize {
        match self.capacity() {
            0 => 0,
            cap => (cursor + n) % cap,
        }
    }

    fn occupied(&self) -> usize {
        if self.full {
            self.capacity()
        } else if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.capacity() - self.read_pos + self.write_pos
        }
    }

    fn free(&self) -> usize {
        self.capacity() - self.occupied()
    }

    /// Free bytes reachable from the write cursor without wrapping.
    fn contiguous_free(&self) -> usize {
        if self.full {
            0
        } else if self.write_pos >= self.read_pos {
            self.capacity() - self.write_pos
        } else {
            self.read_pos - self.write_pos
        }
    }

    fn commit_write(&mut self, n: usize) {
        self.write_pos = self.advance(self.write_pos, n);
        if n > 0 && self.write_pos == self.read_pos {
            self.full = true;
        }
        // Writes eat into the rewindable region from the far end.
        self.consumed = self.consumed.min(self.free());
    }

    fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.read_pos = self.advance(self.read_pos, n);
        self.full = false;
        self.consumed = (self.consumed + n).min(self.capacity());
    }

    /// The first `len` buffered bytes as up to two slices in logical order.
    fn segments(&self, len: usize) -> (&[u8], &[u8]) {
        let start = self.read_pos;
        let first = (self.capacity() - start).min(len);
        (&self.data[start..start + first], &self.data[..len - first])
    }

    fn copy_out(&self, dest: &mut [u8]) {
        let (head, tail) = self.segments(dest.len());
        dest[..head.len()].copy_from_slice(head);
        dest[head.len()..].copy_from_slice(tail);
    }

    /// Offset of the first `\n` relative to the read cursor. Does not consume.
    fn find_newline(&self) -> Option<usize> {
        let (head, tail) = self.segments(self.occupied());
        head.iter()
            .position(|&b| b == b'\n')
            .or_else(|| tail.iter().position(|&b| b == b'\n').map(|p| p + head.len()))
    }

    /// Length of the next line and whether it ends in `\n`.
    fn next_line(&self, partial_ok: bool) -> Result<Option<(usize, bool)>, RingError> {
        match self.find_newline() {
            Some(pos) => Ok(Some((pos, true))),
            None if self.is_empty() => Ok(None),
            None if partial_ok => Ok(Some((self.occupied(), false))),
            None if self.full => Err(RingError::LineTooLong {
                capacity: self.capacity(),
            }),
            None => Ok(None),
        }
    }
}

impl Read for RingBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_data(buf))
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("RingBuffer");
        dbg.field("capacity", &self.capacity())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .field("size", &self.occupied())
            .field("free", &self.free())
            .field("full", &self.full);
        if self.capacity() > 0 && self.capacity() < PREVIEW_LIMIT {
            let preview: String = self
                .data
                .iter()
                .map(|&b| if (32..127).contains(&b) { char::from(b) } else { '.' })
                .collect();
            dbg.field("chars", &preview);
        }
        dbg.finish()
    }
}

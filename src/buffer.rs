//! Growable byte buffer with a contiguous readable window.
//!
//! Socket reads land at the write position, the parser consumes from the
//! read position. `read_from` performs one vectored read into the spare
//! tail plus a stack scratch block, so a single call can pull in more
//! bytes than the buffer currently has room for.

#![allow(dead_code)]

use std::io::{self, IoSliceMut, Read, Write};

const INITIAL_SIZE: usize = 1024;
const READ_SCRATCH: usize = 65535;

/// Byte buffer with separate read and write positions.
///
/// The readable window is `[read_pos, write_pos)`. Space consumed at the
/// front is reclaimed by compaction when an append needs it.
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(size: usize) -> Self {
        Self {
            buf: vec![0; size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Spare capacity after the write position.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// The readable window.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Consume `n` bytes from the front of the readable window.
    ///
    /// # Panics
    /// Panics if `n` exceeds the readable byte count.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes(), "retrieve past readable window");
        self.read_pos += n;
    }

    /// Discard the whole readable window and rewind both positions.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Append bytes, compacting or growing as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.writable_bytes() + self.read_pos < n {
            self.buf.resize(self.write_pos + n, 0);
        } else {
            // Enough room once the consumed prefix is reclaimed.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Fill the buffer from `reader` with one vectored read.
    ///
    /// Bytes beyond the spare capacity land in the scratch block and are
    /// appended afterwards. Returns the count from the underlying read;
    /// `Ok(0)` means the reader hit EOF.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut scratch = [0u8; READ_SCRATCH];
        let writable = self.writable_bytes();
        let n = {
            let mut iovs = [
                IoSliceMut::new(&mut self.buf[self.write_pos..]),
                IoSliceMut::new(&mut scratch),
            ];
            reader.read_vectored(&mut iovs)?
        };
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Drain the readable window into `writer` with one write call.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(self.peek())?;
        self.retrieve(n);
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_peek_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");

        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_compaction_reclaims_consumed_prefix() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789");
        buf.retrieve(8);

        // 6 spare + 8 reclaimed fit the append without growing
        buf.append(b"abcdefghij");
        assert_eq!(buf.peek(), b"89abcdefghij");
        assert_eq!(buf.writable_bytes(), 4);
    }

    #[test]
    fn test_growth_when_compaction_is_not_enough() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"0123456789abcdef");
        assert_eq!(buf.peek(), b"0123456789abcdef");
    }

    #[test]
    fn test_read_from_spills_into_scratch() {
        let mut buf = Buffer::with_capacity(8);
        let data: Vec<u8> = (0u8..100).collect();
        let mut reader: &[u8] = &data;

        let n = buf.read_from(&mut reader).unwrap();
        assert_eq!(n, 100);
        assert_eq!(buf.peek(), &data[..]);
    }

    #[test]
    fn test_read_from_eof() {
        let mut buf = Buffer::new();
        let mut reader: &[u8] = &[];
        assert_eq!(buf.read_from(&mut reader).unwrap(), 0);
    }

    #[test]
    fn test_write_to_drains_window() {
        let mut buf = Buffer::new();
        buf.append(b"response bytes");

        let mut out = Vec::new();
        let n = buf.write_to(&mut out).unwrap();
        assert_eq!(n, 14);
        assert_eq!(out, b"response bytes");
        assert_eq!(buf.readable_bytes(), 0);
    }
}

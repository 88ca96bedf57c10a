//! A growable byte queue laid out as `[prependable | readable | writable]`,
//! modeled on `examples/original_source/src/include/buffer.h`.
//!
//! The prependable region exists so that short framing headers (a length
//! prefix, say) can be written in front of already-buffered data without a
//! reallocation — this crate doesn't impose framing itself (spec §6.3) but
//! leaves the room for callers who do.

use std::io::{self, IoSliceMut, Read};
use std::os::unix::io::RawFd;

/// Bytes reserved at the front of every buffer for cheap prepending.
pub const CHEAP_PREPEND_SIZE: usize = 8;
/// Size of the initial writable region.
pub const INITIAL_SIZE: usize = 1024;

const SPILLOVER_SIZE: usize = 65536;

/// A growable byte buffer with a prependable region and scatter-read
/// support.
///
/// Invariant: `0 <= reader_idx <= writer_idx <= storage.len()`.
pub struct Buffer {
    storage: Vec<u8>,
    reader_idx: usize,
    writer_idx: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            storage: vec![0u8; CHEAP_PREPEND_SIZE + INITIAL_SIZE],
            reader_idx: CHEAP_PREPEND_SIZE,
            writer_idx: CHEAP_PREPEND_SIZE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_idx - self.reader_idx
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.writer_idx
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_idx
    }

    /// Borrows the readable region without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.reader_idx..self.writer_idx]
    }

    /// Advances the reader index by `len`, discarding those bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_idx += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Retrieves everything up to (not including) `end`, a pointer
    /// previously obtained from [`Buffer::peek`] or arithmetic on it.
    pub fn retrieve_until(&mut self, end: *const u8) {
        let start = self.peek().as_ptr();
        let len = (end as usize) - (start as usize);
        self.retrieve(len);
    }

    pub fn retrieve_all(&mut self) {
        self.reader_idx = CHEAP_PREPEND_SIZE;
        self.writer_idx = CHEAP_PREPEND_SIZE;
    }

    pub fn retrieve_as_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    pub fn retrieve_as_string(&mut self) -> String {
        let bytes = self.retrieve_as_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer_idx;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.writer_idx += data.len();
    }

    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_idx -= data.len();
        let start = self.reader_idx;
        self.storage[start..start + data.len()].copy_from_slice(data);
    }

    /// Grows the buffer so that `writable_bytes() >= len` holds afterward.
    ///
    /// Compacts in place when the combined prependable + writable slack
    /// is enough; otherwise reallocates. See spec §4.1.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }

        if self.writable_bytes() + self.prependable_bytes() >= len + CHEAP_PREPEND_SIZE {
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.reader_idx..self.writer_idx, CHEAP_PREPEND_SIZE);
            self.reader_idx = CHEAP_PREPEND_SIZE;
            self.writer_idx = self.reader_idx + readable;
        } else {
            self.storage.resize(self.writer_idx + len, 0);
        }

        debug_assert!(self.writable_bytes() >= len);
    }

    /// Reads as much as is available from `fd` in one syscall, scattering
    /// into the buffer's writable tail and a stack-allocated spillover
    /// region so a single fast arrival is drained without growing the
    /// buffer past what a slow consumer actually needs.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; SPILLOVER_SIZE];
        let writable = self.writable_bytes();

        let mut file = std::mem::ManuallyDrop::new(unsafe {
            <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(fd)
        });

        let n = {
            let tail = &mut self.storage[self.writer_idx..];
            let mut slices = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra_buf)];
            file.read_vectored(&mut slices)?
        };

        if n <= writable {
            self.writer_idx += n;
        } else {
            self.writer_idx = self.storage.len();
            self.append(&extra_buf[..n - writable]);
        }

        Ok(n)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_has_expected_shape() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND_SIZE);
    }

    #[test]
    fn append_then_retrieve_as_string_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.retrieve_as_string(), "hello");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND_SIZE);
    }

    #[test]
    fn partial_retrieve_advances_reader() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
    }

    #[test]
    fn prepend_writes_into_reserved_region() {
        let mut buf = Buffer::new();
        buf.append(b"world");
        buf.prepend(b"hello ");
        assert_eq!(buf.peek(), b"hello world");
    }

    #[test]
    fn ensure_writable_is_idempotent_once_satisfied() {
        let mut buf = Buffer::new();
        buf.ensure_writable(4000);
        let writable_after_first = buf.writable_bytes();
        buf.ensure_writable(4000);
        assert_eq!(buf.writable_bytes(), writable_after_first);
    }

    #[test]
    fn ensure_writable_compacts_before_reallocating() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; 1000]);
        buf.retrieve(990);
        // 10 readable bytes left, plenty of prependable + writable slack
        // to satisfy via compaction rather than growth.
        let cap_before = buf.writable_bytes() + buf.prependable_bytes() + buf.readable_bytes();
        buf.ensure_writable(500);
        let cap_after = buf.writable_bytes() + buf.prependable_bytes() + buf.readable_bytes();
        assert_eq!(cap_before, cap_after);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND_SIZE);
    }

    #[test]
    fn retrieve_until_stops_at_pointer() {
        let mut buf = Buffer::new();
        buf.append(b"hello\nworld");
        let nl = buf.peek().iter().position(|&b| b == b'\n').unwrap();
        let end = unsafe { buf.peek().as_ptr().add(nl) };
        buf.retrieve_until(end);
        assert_eq!(buf.peek(), b"\nworld");
    }
}

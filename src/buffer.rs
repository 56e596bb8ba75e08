//! Growable byte buffer with a cheap prepend region.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0        <=       reader     <=      writer     <=      size
//! ```
//!
//! The reader advances as bytes are consumed; appends extend the writer.
//! The prepend region lets a length header be written in front of a payload
//! that has already been serialized.

use std::io;
use std::os::unix::io::RawFd;

/// Size of the extra stack segment used by [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 64 * 1024;

pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Buffer {
    pub const INITIAL_SIZE: usize = 1024;
    pub const PREPEND_INITIAL: usize = 8;

    pub fn new() -> Buffer {
        Buffer {
            buf: vec![0; Self::PREPEND_INITIAL + Self::INITIAL_SIZE],
            reader: Self::PREPEND_INITIAL,
            writer: Self::PREPEND_INITIAL,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Consume `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes(), "retrieve exceeds readable bytes");
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consume everything and reset both indices to the prepend mark.
    pub fn retrieve_all(&mut self) {
        self.reader = Self::PREPEND_INITIAL;
        self.writer = Self::PREPEND_INITIAL;
    }

    /// Take the readable region as an owned vector, leaving the buffer empty.
    pub fn retrieve_as_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    /// Take the readable region as a string, leaving the buffer empty.
    /// Invalid UTF-8 is replaced, not rejected.
    pub fn retrieve_as_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Grow or compact so at least `len` bytes can be appended.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Write `data` immediately in front of the readable region.
    ///
    /// The caller must have left room: `data.len() <= prependable_bytes()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes(), "prepend exceeds reserved space");
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// Drop spare capacity down to the readable bytes plus `reserve`.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut buf = vec![0; Self::PREPEND_INITIAL + readable + reserve];
        buf[Self::PREPEND_INITIAL..Self::PREPEND_INITIAL + readable].copy_from_slice(self.peek());
        self.buf = buf;
        self.reader = Self::PREPEND_INITIAL;
        self.writer = self.reader + readable;
    }

    /// Scatter-read from `fd` into the writable region plus a 64 KiB stack
    /// segment, so one syscall can pull in more than the buffer's spare
    /// capacity without growing it up front. Overflow into the stack
    /// segment is appended through the normal growth path.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + Self::PREPEND_INITIAL {
            self.buf.resize(self.writer + len, 0);
        } else {
            // Enough total slack: slide the readable bytes forward and
            // reuse the capacity instead of reallocating.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, Self::PREPEND_INITIAL);
            self.reader = Self::PREPEND_INITIAL;
            self.writer = self.reader + readable;
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

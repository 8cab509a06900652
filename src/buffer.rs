use std::io;
use std::os::fd::RawFd;

use crate::sys::syscall;

/// Size of the reserved zone in front of the readable data, so small length
/// headers can be prepended without shifting the payload.
const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;

/// Size of the stack buffer that backs the second vector of the scatter read.
const EXTRA_BUF_SIZE: usize = 65536;

/// A growable byte buffer modelled as three regions over one allocation:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=        reader     <=      writer      <=      size
/// ```
///
/// Inbound data is appended at the writer index and consumed from the reader
/// index, so a connection can scatter-read into the tail while user code
/// drains the head sequentially.
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
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

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Consume `n` readable bytes. Consuming everything resets both indices
    /// to the prepend boundary so the whole buffer becomes writable again.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        assert!(n <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..n]).into_owned();
        self.retrieve(n);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Make room for at least `n` writable bytes, either by shifting the
    /// readable region back to the prepend boundary or by growing the
    /// backing storage.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            self.buf.resize(self.writer + n, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = CHEAP_PREPEND + readable;
        }
    }

    /// Write `data` in front of the readable region. There must be enough
    /// prependable room; the 8-byte cheap-prepend zone guarantees that for
    /// small length headers.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// Prepend a big-endian length header.
    pub fn prepend_u32(&mut self, value: u32) {
        self.prepend(&value.to_be_bytes());
    }

    /// Read a big-endian `u32` from the head of the readable region without
    /// consuming it. Requires four readable bytes.
    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&self.peek()[..4]);
        u32::from_be_bytes(bytes)
    }

    /// Consume and return a big-endian `u32`.
    pub fn read_u32(&mut self) -> u32 {
        let value = self.peek_u32();
        self.retrieve(4);
        value
    }

    /// Position of the first `\r\n` in the readable region, relative to the
    /// start of [`peek`](Buffer::peek).
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|pos| start + pos)
    }

    /// Scatter-read from `fd` into the writable tail plus a 64 KiB stack
    /// buffer, so one `readv(2)` drains even a large kernel receive buffer.
    /// Whatever lands in the stack buffer is appended afterwards.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.buf[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // When the tail alone is at least as large as the stack buffer, one
        // vector is enough.
        let iovcnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

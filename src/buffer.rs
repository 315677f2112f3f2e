//! Growable byte buffer with separate read and write cursors.

use std::io;
use std::os::fd::RawFd;

/// How much stack space a single scatter-gather read may spill into.
/// This bounds one `append_from` call to `EXTRA_BUF + spare capacity`
/// bytes without forcing the buffer to grow ahead of demand.
const EXTRA_BUF: usize = 65_536;

const INITIAL_CAPACITY: usize = 1_024;

/// A byte buffer with a read index and a write index.
///
/// Bytes are appended at the write index and consumed from the read
/// index; `as_slice` exposes the unconsumed span. Consumed space at the
/// front is reclaimed by compaction when it dominates the allocation,
/// so a long-lived connection buffer does not creep.
#[derive(Default)]
pub struct Buffer {
    data: Vec<u8>,
    read: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(capacity),
            read: 0,
        }
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.data.len()
    }

    /// The unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read..]
    }

    /// Marks `n` bytes as consumed.
    pub fn advance(&mut self, n: usize) {
        self.read = (self.read + n).min(self.data.len());
        if self.read == self.data.len() {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.read = 0;
    }

    /// Appends bytes at the write index.
    pub fn append(&mut self, bytes: &[u8]) {
        self.compact_if_worthwhile();
        self.data.extend_from_slice(bytes);
    }

    /// Consumes the whole buffer into a `Vec`.
    pub fn take(&mut self) -> Vec<u8> {
        let out = self.data.split_off(self.read);
        self.clear();
        out
    }

    // Reclaims the consumed prefix once it exceeds half the allocation.
    fn compact_if_worthwhile(&mut self) {
        if self.read > 0 && self.read * 2 >= self.data.capacity() {
            self.data.drain(..self.read);
            self.read = 0;
        }
    }

    /// Reads from `fd` with a scatter-gather read into the spare
    /// capacity plus a stack-side extension buffer.
    ///
    /// Returns the number of bytes appended; `Ok(0)` means the peer
    /// closed its write half.
    pub fn append_from(&mut self, fd: RawFd) -> io::Result<usize> {
        self.compact_if_worthwhile();
        if self.data.capacity() == self.data.len() {
            self.data.reserve(INITIAL_CAPACITY);
        }

        let len = self.data.len();
        let spare = self.data.capacity() - len;
        let mut extra = [0u8; EXTRA_BUF];

        let iov = [
            libc::iovec {
                iov_base: unsafe { self.data.as_mut_ptr().add(len) as *mut libc::c_void },
                iov_len: spare,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];

        let n = syscall!(readv(fd, iov.as_ptr(), iov.len() as libc::c_int))? as usize;
        if n <= spare {
            // All bytes landed in the spare capacity.
            unsafe { self.data.set_len(len + n) };
        } else {
            unsafe { self.data.set_len(len + spare) };
            self.data.extend_from_slice(&extra[..n - spare]);
        }
        Ok(n)
    }

    /// Writes unconsumed bytes to `fd`, advancing past what was
    /// accepted. Returns the number of bytes written.
    pub fn write_to(&mut self, fd: RawFd) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let slice = self.as_slice();
        let n = syscall!(send(
            fd,
            slice.as_ptr() as *const libc::c_void,
            slice.len(),
            libc::MSG_NOSIGNAL,
        ))? as usize;
        self.advance(n);
        Ok(n)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_advance() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.len(), 11);
        buf.advance(6);
        assert_eq!(buf.as_slice(), b"world");
        buf.advance(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn take_returns_unconsumed_tail() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.advance(2);
        assert_eq!(buf.take(), b"cdef");
        assert!(buf.is_empty());
    }

    #[test]
    fn advancing_past_end_clears() {
        let mut buf = Buffer::new();
        buf.append(b"ab");
        buf.advance(100);
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn compaction_preserves_contents() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[b'x'; 12]);
        buf.advance(10);
        // Triggers compaction: the consumed prefix dominates.
        buf.append(b"yz");
        assert_eq!(buf.as_slice(), b"xxyz");
    }

    #[test]
    fn pipe_roundtrip() {
        let mut fds = [0; 2];
        syscall!(pipe(fds.as_mut_ptr())).unwrap();
        let [rx, tx] = fds;

        let mut out = Buffer::new();
        out.append(b"ping");
        assert_eq!(out.write_to_pipe(tx), 4);

        let mut input = Buffer::new();
        assert_eq!(input.append_from(rx).unwrap(), 4);
        assert_eq!(input.as_slice(), b"ping");

        syscall!(close(rx)).unwrap();
        syscall!(close(tx)).unwrap();
    }

    impl Buffer {
        // `write_to` uses send(2), which only works on sockets; tests
        // going through a pipe use a plain write instead.
        fn write_to_pipe(&mut self, fd: RawFd) -> usize {
            let slice = self.as_slice();
            let n = syscall!(write(fd, slice.as_ptr() as *const libc::c_void, slice.len()))
                .unwrap() as usize;
            self.advance(n);
            n
        }
    }
}

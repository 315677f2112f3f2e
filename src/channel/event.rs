use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::OnceLock;

use log::warn;

use crate::channel::Channel;
use crate::event::Ready;
use crate::time::Timestamp;

/// The wake-up channel: an `eventfd` that producers write to interrupt
/// a blocked selector.
///
/// `eventfd` is effectively a 64-bit counter. All writes must be 8
/// bytes and are added to the count; reads must be 8 bytes and reset
/// the count to zero. The descriptor is readable iff the count is
/// non-zero, which is exactly "at least one wake is pending".
pub(crate) struct EventChannel {
    fd: std::fs::File,
    on_wake: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl EventChannel {
    pub(crate) fn new() -> io::Result<EventChannel> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(EventChannel {
            // SAFETY: `eventfd(2)` returned a valid, owned descriptor.
            fd: unsafe { std::fs::File::from_raw_fd(fd) },
            on_wake: OnceLock::new(),
        })
    }

    /// Installs the drain hook the loop runs when the channel fires.
    /// Only the first call takes effect.
    pub(crate) fn set_on_wake(&self, hook: Box<dyn Fn() + Send + Sync>) {
        let _ = self.on_wake.set(hook);
    }

    /// Makes the descriptor readable, interrupting a blocked wait.
    /// Callable from any thread.
    #[allow(clippy::unused_io_amount)] // Writes of 8 bytes don't split.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is about to
                // overflow; reset it to zero and wake again.
                self.reset();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Drains the counter so the descriptor stops being readable.
    #[allow(clippy::unused_io_amount)]
    pub(crate) fn reset(&self) {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        match (&self.fd).read(&mut buf) {
            Ok(_) => {}
            // Nothing pending; nothing to drain.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!("failed to drain event channel: {}", err),
        }
    }
}

impl Channel for EventChannel {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn handle_events(&self, _ready: Ready, _now: Timestamp) {
        self.reset();
        if let Some(hook) = self.on_wake.get() {
            hook();
        }
    }

    // Pending tasks run before socket dispatch in the same wake.
    fn priority(&self) -> i32 {
        2
    }
}

impl AsRawFd for EventChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn wake_then_dispatch_runs_hook() {
        let channel = EventChannel::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        channel.set_on_wake(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        channel.wake().unwrap();
        channel.wake().unwrap();
        channel.handle_events(Ready::READABLE, Timestamp::now());
        // Coalesced: two wakes, one dispatch.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_without_wake_is_fine() {
        let channel = EventChannel::new().unwrap();
        channel.reset();
    }
}

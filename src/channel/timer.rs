use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, OnceLock};

use log::warn;

use crate::channel::Channel;
use crate::event::Ready;
use crate::time::{Duration, Timestamp, MICROS_PER_SEC, NANOS_PER_MICRO};

/// Smallest delta the timerfd is armed with; anything shorter thrashes
/// the kernel timer without improving observable latency.
const MIN_ARM: Duration = Duration::from_micros(100);

/// The timer channel: a `timerfd` whose expirations wake the selector
/// so the loop drains its timer queue.
///
/// The channel tracks the earliest requested wake-up in an atomic and
/// only re-arms the kernel timer when a strictly earlier wake-up is
/// requested. A dispatch resets the atomic to "infinitely far away";
/// the timer queue re-arms for whatever is due next.
pub(crate) struct TimerChannel {
    fd: std::fs::File,
    // Earliest pending wake-up as a relative delay in microseconds;
    // i64::MAX when nothing is armed.
    next_wake_us: AtomicI64,
    // Serializes timerfd_settime and the expiration read.
    arm: Mutex<()>,
    on_expiry: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerChannel {
    pub(crate) fn new() -> io::Result<TimerChannel> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        Ok(TimerChannel {
            // SAFETY: `timerfd_create(2)` returned a valid descriptor.
            fd: unsafe { std::fs::File::from_raw_fd(fd) },
            next_wake_us: AtomicI64::new(i64::MAX),
            arm: Mutex::new(()),
            on_expiry: OnceLock::new(),
        })
    }

    /// Installs the expiry hook the loop runs when the channel fires.
    /// Only the first call takes effect.
    pub(crate) fn set_on_expiry(&self, hook: Box<dyn Fn() + Send + Sync>) {
        let _ = self.on_expiry.set(hook);
    }

    /// Requests a wake-up at `when`. Callable from any thread.
    pub(crate) fn wake_at(&self, when: Timestamp) {
        self.wake_after(when - Timestamp::now());
    }

    /// Requests a wake-up after `delay`, clamped to the minimum arming
    /// delta. A request later than the currently armed wake-up is a
    /// no-op.
    pub(crate) fn wake_after(&self, delay: Duration) {
        let micros = delay.max(MIN_ARM).as_micros();

        let mut current = self.next_wake_us.load(Ordering::Acquire);
        loop {
            if micros >= current {
                return;
            }
            match self.next_wake_us.compare_exchange(
                current,
                micros,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (micros / MICROS_PER_SEC) as libc::time_t,
                tv_nsec: ((micros % MICROS_PER_SEC) * NANOS_PER_MICRO) as libc::c_long,
            },
        };

        let _guard = self.arm.lock().unwrap();
        if let Err(err) = syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &spec,
            std::ptr::null_mut(),
        )) {
            warn!("failed to arm timer channel: {}", err);
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 8];
        let _guard = self.arm.lock().unwrap();
        match (&self.fd).read(&mut buf) {
            Ok(_) => {}
            // The wake came from the event channel racing an expiry;
            // the timerfd simply has not fired yet.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!("failed to read timer channel: {}", err),
        }
    }
}

impl Channel for TimerChannel {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn handle_events(&self, _ready: Ready, _now: Timestamp) {
        self.next_wake_us.store(i64::MAX, Ordering::Release);
        self.drain();
        if let Some(hook) = self.on_expiry.get() {
            hook();
        }
    }

    fn priority(&self) -> i32 {
        1
    }
}

impl AsRawFd for TimerChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for TimerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerChannel")
            .field("fd", &self.fd.as_raw_fd())
            .field("next_wake_us", &self.next_wake_us.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn later_request_does_not_rearm() {
        let channel = TimerChannel::new().unwrap();
        channel.wake_after(Duration::from_millis(10));
        let armed = channel.next_wake_us.load(Ordering::Acquire);
        channel.wake_after(Duration::from_millis(50));
        assert_eq!(channel.next_wake_us.load(Ordering::Acquire), armed);
        channel.wake_after(Duration::from_millis(1));
        assert!(channel.next_wake_us.load(Ordering::Acquire) < armed);
    }

    #[test]
    fn short_delays_are_clamped() {
        let channel = TimerChannel::new().unwrap();
        channel.wake_after(Duration::from_micros(-1_000));
        assert_eq!(
            channel.next_wake_us.load(Ordering::Acquire),
            MIN_ARM.as_micros()
        );
    }

    #[test]
    fn dispatch_resets_and_runs_hook() {
        let channel = TimerChannel::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        channel.set_on_expiry(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        channel.wake_after(Duration::from_millis(1));
        std::thread::sleep(std::time::Duration::from_millis(5));
        channel.handle_events(Ready::READABLE, Timestamp::now());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(channel.next_wake_us.load(Ordering::Acquire), i64::MAX);
    }
}

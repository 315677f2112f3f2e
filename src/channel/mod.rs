//! Channels: file descriptors bound to an event-handling policy.
//!
//! Three kinds of descriptor feed a loop's selector: stream sockets,
//! the eventfd that carries cross-thread wake-ups, and the timerfd that
//! carries timer expirations. Whatever owns the registration implements
//! [`Channel`] and receives the readiness the selector collected.

use std::os::fd::RawFd;

use crate::event::Ready;
use crate::time::Timestamp;

mod event;
mod socket;
mod timer;

pub(crate) use self::event::EventChannel;
pub(crate) use self::socket::SocketChannel;
pub(crate) use self::timer::TimerChannel;

/// A registered event target.
///
/// Implementors own exactly one file descriptor. A channel is
/// registered with at most one selector at a time and must be
/// deregistered before it is dropped; the event loop's channel table
/// enforces both by being the only owner of registrations.
pub(crate) trait Channel: Send + Sync {
    /// The descriptor behind this channel.
    fn fd(&self) -> RawFd;

    /// Dispatches readiness collected by the selector. Runs only on
    /// the loop thread.
    fn handle_events(&self, ready: Ready, now: Timestamp);

    /// Relative dispatch order within a single wake; higher runs
    /// first.
    fn priority(&self) -> i32 {
        0
    }
}

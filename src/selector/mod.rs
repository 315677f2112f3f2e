//! Kernel multiplexer backends.
//!
//! A selector maintains the kernel-side registrations of a loop's
//! channels and produces batches of `(Token, Ready)` pairs on demand.
//! Both backends deliver identical readiness semantics; epoll is the
//! primary and poll(2) the fallback for kernels without it.
//!
//! All operations are invoked only from the owning loop thread.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration as StdDuration;

use crate::event::{Interest, Ready};
use crate::options::SelectorType;
use crate::time::Duration;
use crate::token::Token;

mod epoll;
mod poll;

pub(crate) use self::epoll::EpollSelector;
pub(crate) use self::poll::PollSelector;

/// The ready buffer starts here and doubles whenever a wait fills it.
const INITIAL_EVENTS: usize = 256;
/// Cap on ready-buffer growth.
const MAX_EVENTS: usize = 65_536;

pub(crate) enum Selector {
    Epoll(EpollSelector),
    Poll(PollSelector),
}

impl Selector {
    pub(crate) fn new(kind: SelectorType) -> io::Result<Selector> {
        match kind {
            SelectorType::Epoll => EpollSelector::new().map(Selector::Epoll),
            SelectorType::Poll => Ok(Selector::Poll(PollSelector::new())),
        }
    }

    /// Registers `fd` under `token`.
    ///
    /// Panics on a duplicate token: double registration means the
    /// loop's channel table and the kernel state have diverged, and
    /// nothing sensible can run after that.
    pub(crate) fn add(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self {
            Selector::Epoll(s) => s.add(token, fd, interest),
            Selector::Poll(s) => s.add(token, fd, interest),
        }
    }

    pub(crate) fn update(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Selector::Epoll(s) => s.update(token, interest),
            Selector::Poll(s) => s.update(token, interest),
        }
    }

    pub(crate) fn remove(&mut self, token: Token) -> io::Result<()> {
        match self {
            Selector::Epoll(s) => s.remove(token),
            Selector::Poll(s) => s.remove(token),
        }
    }

    pub(crate) fn contains(&self, token: Token) -> bool {
        match self {
            Selector::Epoll(s) => s.contains(token),
            Selector::Poll(s) => s.contains(token),
        }
    }

    /// Blocks up to `timeout` for readiness. Interrupt-class returns
    /// yield an empty batch and `Ok`; everything else is an error.
    pub(crate) fn select(&mut self, timeout: Duration) -> io::Result<()> {
        match self {
            Selector::Epoll(s) => s.select(timeout),
            Selector::Poll(s) => s.select(timeout),
        }
    }

    /// The batch produced by the last `select`.
    pub(crate) fn ready(&self) -> &[(Token, Ready)] {
        match self {
            Selector::Epoll(s) => s.ready(),
            Selector::Poll(s) => s.ready(),
        }
    }
}

// `Duration::as_millis` truncates, so round up. This avoids turning a
// sub-millisecond timeout into a busy-looping zero timeout, unless the
// caller explicitly asked for zero.
fn timeout_millis(timeout: Duration) -> libc::c_int {
    match timeout.to_std() {
        Some(t) => t
            .checked_add(StdDuration::from_nanos(999_999))
            .unwrap_or(t)
            .as_millis()
            .min(libc::c_int::MAX as u128) as libc::c_int,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_millis(Duration::from_micros(1)), 1);
        assert_eq!(timeout_millis(Duration::from_millis(10)), 10);
        assert_eq!(timeout_millis(Duration::ZERO), 0);
        assert_eq!(timeout_millis(Duration::from_micros(-5)), 0);
    }

    #[test]
    fn backends_share_semantics() {
        use std::os::fd::AsRawFd;

        for kind in [SelectorType::Epoll, SelectorType::Poll] {
            let mut selector = Selector::new(kind).unwrap();
            let waker = crate::channel::EventChannel::new().unwrap();

            let token = Token(7);
            selector
                .add(token, waker.as_raw_fd(), Interest::READABLE)
                .unwrap();
            assert!(selector.contains(token));

            // Nothing pending: an immediate wait returns empty.
            selector.select(Duration::ZERO).unwrap();
            assert!(selector.ready().is_empty());

            waker.wake().unwrap();
            selector.select(Duration::from_millis(100)).unwrap();
            let ready = selector.ready();
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].0, token);
            assert!(ready[0].1.is_readable());

            selector.remove(token).unwrap();
            assert!(!selector.contains(token));
        }
    }

    #[test]
    #[should_panic]
    fn duplicate_registration_panics() {
        let mut selector = Selector::new(SelectorType::Epoll).unwrap();
        let waker = crate::channel::EventChannel::new().unwrap();
        use std::os::fd::AsRawFd;
        let fd = waker.as_raw_fd();
        selector.add(Token(1), fd, Interest::READABLE).unwrap();
        let _ = selector.add(Token(1), fd, Interest::READABLE);
    }
}

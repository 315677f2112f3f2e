use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::event::{Interest, Ready};
use crate::time::Duration;
use crate::token::Token;

use super::{timeout_millis, INITIAL_EVENTS, MAX_EVENTS};

pub(crate) struct EpollSelector {
    ep: OwnedFd,
    // Registered descriptors by token; the source of truth for
    // `contains` since the kernel set cannot be queried.
    fds: HashMap<Token, RawFd>,
    events: Vec<libc::epoll_event>,
    ready: Vec<(Token, Ready)>,
}

impl EpollSelector {
    pub(crate) fn new() -> io::Result<EpollSelector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(EpollSelector {
            ep,
            fds: HashMap::new(),
            events: Vec::with_capacity(INITIAL_EVENTS),
            ready: Vec::new(),
        })
    }

    pub(crate) fn add(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.fds.insert(token, fd).is_some() {
            panic!("duplicate registration of {:?}", token);
        }
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn update(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let fd = match self.fds.get(&token) {
            Some(fd) => *fd,
            None => return Err(io::ErrorKind::NotFound.into()),
        };
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn remove(&mut self, token: Token) -> io::Result<()> {
        let fd = match self.fds.remove(&token) {
            Some(fd) => fd,
            None => return Err(io::ErrorKind::NotFound.into()),
        };
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())).map(|_| ())
    }

    pub(crate) fn contains(&self, token: Token) -> bool {
        self.fds.contains_key(&token)
    }

    pub(crate) fn select(&mut self, timeout: Duration) -> io::Result<()> {
        self.ready.clear();
        self.events.clear();

        let n = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_millis(timeout),
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        // SAFETY: `epoll_wait` wrote `n` entries.
        unsafe { self.events.set_len(n) };

        for event in &self.events {
            self.ready
                .push((Token(event.u64 as usize), epoll_to_ready(event.events)));
        }

        // A full buffer probably clipped the batch; double it for the
        // next wait, up to the cap.
        if n == self.events.capacity() && n < MAX_EVENTS {
            self.events = Vec::with_capacity(n * 2);
        }
        Ok(())
    }

    pub(crate) fn ready(&self) -> &[(Token, Ready)] {
        &self.ready
    }
}

impl AsRawFd for EpollSelector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= EPOLLIN | EPOLLRDHUP;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

fn epoll_to_ready(events: u32) -> Ready {
    let events = events as libc::c_int;
    let mut ready = Ready::EMPTY;
    if events & (EPOLLIN | EPOLLPRI) != 0 {
        ready |= Ready::READABLE;
    }
    if events & EPOLLOUT != 0 {
        ready |= Ready::WRITABLE;
    }
    if events & EPOLLERR != 0 {
        ready |= Ready::ERROR;
    }
    if events & EPOLLHUP != 0 {
        ready |= Ready::HUP;
    }
    if events & EPOLLRDHUP != 0 {
        ready |= Ready::READ_CLOSED;
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_mapping() {
        assert_eq!(interest_to_epoll(Interest::NONE), 0);
        let r = interest_to_epoll(Interest::READABLE);
        assert_ne!(r & EPOLLIN as u32, 0);
        assert_ne!(r & EPOLLRDHUP as u32, 0);
        let w = interest_to_epoll(Interest::WRITABLE);
        assert_eq!(w, EPOLLOUT as u32);
    }

    #[test]
    fn ready_mapping() {
        let ready = epoll_to_ready((EPOLLIN | EPOLLERR | EPOLLHUP) as u32);
        assert!(ready.is_readable());
        assert!(ready.is_error());
        assert!(ready.is_hup());
        assert!(!ready.is_writable());
    }
}

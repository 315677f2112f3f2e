use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use libc::{POLLERR, POLLHUP, POLLIN, POLLOUT, POLLPRI, POLLRDHUP};

use crate::event::{Interest, Ready};
use crate::time::Duration;
use crate::token::Token;

use super::timeout_millis;

/// poll(2)-backed selector for kernels without epoll.
///
/// Registrations live in a flat `pollfd` vector handed to the kernel on
/// every wait. Removal only drops the index entry and marks the vector
/// dirty; the stale slots are compacted lazily at the top of the next
/// wait, so removing during dispatch stays O(1).
pub(crate) struct PollSelector {
    dirty: bool,
    entries: Vec<libc::pollfd>,
    // fd -> (slot in `entries`, token)
    index: HashMap<RawFd, (usize, Token)>,
    tokens: HashMap<Token, RawFd>,
    ready: Vec<(Token, Ready)>,
}

impl PollSelector {
    pub(crate) fn new() -> PollSelector {
        PollSelector {
            dirty: false,
            entries: Vec::new(),
            index: HashMap::new(),
            tokens: HashMap::new(),
            ready: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, token: Token, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.tokens.insert(token, fd).is_some() {
            panic!("duplicate registration of {:?}", token);
        }
        self.entries.push(libc::pollfd {
            fd,
            events: interest_to_poll(interest),
            revents: 0,
        });
        self.index.insert(fd, (self.entries.len() - 1, token));
        Ok(())
    }

    pub(crate) fn update(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let fd = match self.tokens.get(&token) {
            Some(fd) => *fd,
            None => return Err(io::ErrorKind::NotFound.into()),
        };
        let slot = self.index[&fd].0;
        self.entries[slot].events = interest_to_poll(interest);
        Ok(())
    }

    pub(crate) fn remove(&mut self, token: Token) -> io::Result<()> {
        let fd = match self.tokens.remove(&token) {
            Some(fd) => fd,
            None => return Err(io::ErrorKind::NotFound.into()),
        };
        self.index.remove(&fd);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn contains(&self, token: Token) -> bool {
        self.tokens.contains_key(&token)
    }

    pub(crate) fn select(&mut self, timeout: Duration) -> io::Result<()> {
        if self.dirty {
            self.compact();
        }
        self.ready.clear();

        let n = match syscall!(poll(
            self.entries.as_mut_ptr(),
            self.entries.len() as libc::nfds_t,
            timeout_millis(timeout),
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        if n == 0 {
            return Ok(());
        }

        for entry in &mut self.entries {
            if entry.revents == 0 {
                continue;
            }
            if let Some(&(_, token)) = self.index.get(&entry.fd) {
                self.ready.push((token, poll_to_ready(entry.revents)));
            }
            entry.revents = 0;
            if self.ready.len() == n {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn ready(&self) -> &[(Token, Ready)] {
        &self.ready
    }

    // Drops slots whose fd is no longer registered, fixing up the
    // index as survivors shift down.
    fn compact(&mut self) {
        let mut head = 0;
        for i in 0..self.entries.len() {
            let entry = self.entries[i];
            if let Some(loc) = self.index.get_mut(&entry.fd) {
                self.entries[head] = entry;
                loc.0 = head;
                head += 1;
            }
        }
        self.entries.truncate(head);
        self.dirty = false;
    }
}

fn interest_to_poll(interest: Interest) -> libc::c_short {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= POLLIN | POLLRDHUP;
    }
    if interest.is_writable() {
        kind |= POLLOUT;
    }
    kind
}

fn poll_to_ready(revents: libc::c_short) -> Ready {
    let mut ready = Ready::EMPTY;
    if revents & (POLLIN | POLLPRI) != 0 {
        ready |= Ready::READABLE;
    }
    if revents & POLLOUT != 0 {
        ready |= Ready::WRITABLE;
    }
    if revents & POLLERR != 0 {
        ready |= Ready::ERROR;
    }
    if revents & POLLHUP != 0 {
        ready |= Ready::HUP;
    }
    if revents & POLLRDHUP != 0 {
        ready |= Ready::READ_CLOSED;
    }
    ready
}

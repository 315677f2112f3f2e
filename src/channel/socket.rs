use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::event::Interest;
use crate::event_loop::EventLoop;
use crate::net::Socket;
use crate::token::Token;

/// A stream socket bound to its registration in an event loop.
///
/// The channel tracks the interest set its owner wants and pushes every
/// change through to the loop's selector. Interest changes happen only
/// on the loop thread (the connection marshals first), so the interest
/// word needs no stronger ordering than the selector call that follows
/// it.
pub(crate) struct SocketChannel {
    socket: Socket,
    token: Token,
    interest: AtomicU8,
    event_loop: EventLoop,
}

impl SocketChannel {
    pub(crate) fn new(socket: Socket, token: Token, event_loop: EventLoop) -> SocketChannel {
        SocketChannel {
            socket,
            token,
            interest: AtomicU8::new(Interest::NONE.bits()),
            event_loop,
        }
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.socket
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub(crate) fn interest(&self) -> Interest {
        Interest::from_bits(self.interest.load(Ordering::Relaxed))
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.interest().is_readable()
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.interest().is_writable()
    }

    pub(crate) fn set_readable(&self, on: bool) {
        let interest = if on {
            self.interest().add(Interest::READABLE)
        } else {
            self.interest().remove(Interest::READABLE)
        };
        self.set_interest(interest);
    }

    pub(crate) fn set_writable(&self, on: bool) {
        let interest = if on {
            self.interest().add(Interest::WRITABLE)
        } else {
            self.interest().remove(Interest::WRITABLE)
        };
        self.set_interest(interest);
    }

    fn set_interest(&self, interest: Interest) {
        self.interest.store(interest.bits(), Ordering::Relaxed);
        self.event_loop.update_interest(self.token, interest);
    }
}

impl std::fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketChannel")
            .field("fd", &self.fd())
            .field("token", &self.token)
            .field("interest", &self.interest())
            .finish()
    }
}

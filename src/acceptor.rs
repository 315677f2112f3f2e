//! The listening socket that feeds a server with connections.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use log::{error, trace};

use crate::channel::{Channel, SocketChannel};
use crate::event::Ready;
use crate::event_loop::EventLoop;
use crate::net::Socket;
use crate::options::SocketOptions;
use crate::queue::Task;
use crate::time::Timestamp;
use crate::util::Latch;

pub(crate) type AcceptCallback = Box<dyn Fn(Socket) + Send + Sync>;

/// Owns a listening socket on a boss loop and drains `accept` on every
/// read-readiness, handing each new socket to the accept callback.
pub(crate) struct Acceptor {
    address: SocketAddr,
    channel: SocketChannel,
    event_loop: EventLoop,
    on_accept: OnceLock<AcceptCallback>,
}

impl Acceptor {
    pub(crate) fn new(
        event_loop: EventLoop,
        address: SocketAddr,
        options: &SocketOptions,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new(&address)?;
        socket.apply(options)?;
        let token = event_loop.next_token();
        Ok(Arc::new(Acceptor {
            address,
            channel: SocketChannel::new(socket, token, event_loop.clone()),
            event_loop,
            on_accept: OnceLock::new(),
        }))
    }

    pub(crate) fn set_on_accept(&self, callback: AcceptCallback) {
        let _ = self.on_accept.set(callback);
    }

    pub(crate) fn bind(&self) -> io::Result<()> {
        self.channel.socket().bind(self.address)
    }

    /// The bound address; the port is real even when binding port 0.
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.channel.socket().local_addr()
    }

    /// Registers with the loop and starts listening.
    pub(crate) fn listen(self: &Arc<Self>) {
        let acceptor = Arc::clone(self);
        let on_register: Task = Box::new(move || {
            acceptor.channel.set_readable(true);
            if let Err(err) = acceptor.channel.socket().listen() {
                error!("failed to listen on {}: {}", acceptor.address, err);
            }
        });
        self.event_loop.register(
            Arc::clone(self) as Arc<dyn Channel>,
            self.channel.token(),
            Some(on_register),
            None,
        );
    }

    /// Deregisters the listening socket and waits until the loop has
    /// let go of it; no accept callback runs after this returns.
    pub(crate) fn close(&self) {
        trace!("closing acceptor on {}", self.address);
        if !self.event_loop.is_running() && !self.event_loop.is_under_loop() {
            // The loop already stopped (or never started); there is
            // nothing left that could race an accept.
            return;
        }
        let latch = Arc::new(Latch::new(1));
        let done = Arc::clone(&latch);
        self.event_loop
            .deregister(self.channel.token(), Some(Box::new(move || done.count_down())));
        latch.wait();
    }
}

impl Channel for Acceptor {
    fn fd(&self) -> std::os::fd::RawFd {
        self.channel.fd()
    }

    fn handle_events(&self, _ready: Ready, _now: Timestamp) {
        loop {
            match self.channel.socket().accept() {
                Ok(socket) => {
                    trace!("accepted connection on {}", self.address);
                    if let Some(callback) = self.on_accept.get() {
                        callback(socket);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Out of descriptors and friends; drop the rest of
                    // the backlog until the next readiness event.
                    error!("failed to accept on {}: {}", self.address, err);
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("address", &self.address)
            .field("fd", &self.channel.fd())
            .finish()
    }
}

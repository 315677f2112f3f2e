//! TCP connections and their handler surface.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::{error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::{Channel, SocketChannel};
use crate::event::Ready;
use crate::event_loop::EventLoop;
use crate::net::Socket;
use crate::queue::Task;
use crate::time::Timestamp;
use crate::util::Latch;

const CONNECTING: u32 = 0;
const CONNECTED: u32 = 1;
const DISCONNECTING: u32 = 2;
const DISCONNECTED: u32 = 3;

/// Lifecycle state of a [`TcpConnection`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not yet registered with its loop.
    Connecting,
    /// Registered and exchanging data.
    Connected,
    /// Write half closing once the output buffer drains.
    Disconnecting,
    /// Terminal; `on_close` has fired or is about to.
    Disconnected,
}

fn state_from(raw: u32) -> ConnectionState {
    match raw {
        CONNECTING => ConnectionState::Connecting,
        CONNECTED => ConnectionState::Connected,
        DISCONNECTING => ConnectionState::Disconnecting,
        _ => ConnectionState::Disconnected,
    }
}

/// Callbacks a connection delivers to its owner.
///
/// All callbacks for one connection run serially on its loop thread.
/// `on_connect` is always first; `on_close` is always last and fires
/// exactly once; nothing runs after it. Transient I/O conditions never
/// surface here: `on_error` only reports errors that tear the
/// connection down.
pub trait Handler: Send + Sync {
    fn on_connect(&self, _now: Timestamp) {}

    /// New bytes were appended to the input buffer. Consume what is
    /// complete and leave the rest; unconsumed bytes stay for the next
    /// call.
    fn on_read(&self, _now: Timestamp, _buffer: &mut Buffer) {}

    /// The output buffer fully drained to the socket.
    fn on_write_complete(&self, _now: Timestamp) {}

    fn on_error(&self, _now: Timestamp, _error: io::Error) {}

    fn on_close(&self, _now: Timestamp) {}
}

/// The handler's view of its connection.
///
/// Handlers hold the context rather than the connection itself; the
/// connection slot is populated when the connection starts and cleared
/// exactly when `on_close` returns, so a handler can never keep a dead
/// connection alive through a reference cycle.
pub struct ChannelContext {
    conn: Mutex<Option<Arc<TcpConnection>>>,
}

impl ChannelContext {
    pub(crate) fn new() -> Arc<ChannelContext> {
        Arc::new(ChannelContext {
            conn: Mutex::new(None),
        })
    }

    /// The live connection, or `None` once teardown finished.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.conn.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelContext")
            .field("live", &self.conn.lock().unwrap().is_some())
            .finish()
    }
}

/// A stream connection bound to one event loop.
///
/// The connection is shared: its loop holds it through the channel
/// table and in-flight tasks, and user code may hold it as long as it
/// likes. Teardown is driven through the state machine exactly once no
/// matter how many owners ask for it; the last owner to let go frees
/// the socket.
///
/// [`send`](TcpConnection::send), [`close`](TcpConnection::close),
/// [`shutdown`](TcpConnection::shutdown) and the `force_` variants are
/// callable from any thread and are idempotent.
pub struct TcpConnection {
    state: AtomicU32,
    event_loop: EventLoop,
    channel: SocketChannel,
    handler: OnceLock<Arc<dyn Handler>>,
    context: Arc<ChannelContext>,
    local: Option<SocketAddr>,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    close_latch: Latch,
}

impl TcpConnection {
    /// Wraps an established socket. The connection does nothing until
    /// [`start`](TcpConnection::start).
    pub fn new(event_loop: EventLoop, socket: Socket) -> Arc<TcpConnection> {
        let token = event_loop.next_token();
        let local = socket.local_addr().ok();
        Arc::new(TcpConnection {
            state: AtomicU32::new(CONNECTING),
            channel: SocketChannel::new(socket, token, event_loop.clone()),
            event_loop,
            handler: OnceLock::new(),
            context: ChannelContext::new(),
            local,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            close_latch: Latch::new(1),
        })
    }

    /// Installs the handler. Must happen before `start`; only the
    /// first call takes effect.
    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        let _ = self.handler.set(handler);
    }

    /// The context handed to this connection's handler.
    pub fn context(&self) -> Arc<ChannelContext> {
        Arc::clone(&self.context)
    }

    pub fn state(&self) -> ConnectionState {
        state_from(self.state.load(Ordering::Acquire))
    }

    /// The local address, cached at construction.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn peer_address(&self) -> io::Result<SocketAddr> {
        self.channel.socket().peer_addr()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    fn handler(&self) -> &Arc<dyn Handler> {
        self.handler.get().expect("connection handler not set")
    }

    /// Registers with the loop and, once registered, transitions to
    /// `Connected`, fires `on_connect` and starts reading.
    pub fn start(self: &Arc<Self>) {
        *self.context.conn.lock().unwrap() = Some(Arc::clone(self));

        let conn = Arc::clone(self);
        let on_register: Task = Box::new(move || {
            if conn
                .state
                .compare_exchange(CONNECTING, CONNECTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                error!("connection registered twice, fd={}", conn.channel.fd());
                return;
            }
            trace!("connection established, fd={}", conn.channel.fd());
            conn.handler().on_connect(Timestamp::now());
            conn.channel.set_readable(true);
        });

        let conn = Arc::clone(self);
        let on_deregister: Task = Box::new(move || conn.handle_remove());

        self.event_loop.register(
            Arc::clone(self) as Arc<dyn Channel>,
            self.channel.token(),
            Some(on_register),
            Some(on_deregister),
        );
    }

    /// Queues `data` for delivery, writing directly when the output
    /// buffer is empty. Bytes from consecutive sends leave the socket
    /// in order. Silently dropped unless the connection is `Connected`.
    pub fn send(self: &Arc<Self>, data: impl Into<Vec<u8>>) {
        let data = data.into();
        if self.event_loop.is_under_loop() {
            self.handle_send(&data);
        } else {
            let conn = Arc::clone(self);
            self.event_loop.schedule(move || conn.handle_send(&data));
        }
    }

    /// Disconnects once the output buffer drains.
    pub fn close(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(CONNECTED, DISCONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        trace!("closing connection, fd={}", self.channel.fd());
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            if conn.output.lock().unwrap().is_empty() {
                conn.event_loop.deregister(conn.channel.token(), None);
            }
            // Otherwise the write path deregisters after the drain.
        });
    }

    /// Closes the write half once the output buffer drains; the
    /// connection fully disconnects when the peer closes its side.
    pub fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                CONNECTED,
                DISCONNECTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            if conn.output.lock().unwrap().is_empty() {
                conn.channel.set_writable(false);
                if let Err(err) = conn.channel.socket().shutdown_write() {
                    warn!("failed to shut down write half: {}", err);
                }
            }
        });
    }

    /// Disconnects immediately, discarding buffered output.
    pub fn force_close(self: &Arc<Self>) {
        if self.state.swap(DISCONNECTED, Ordering::AcqRel) == DISCONNECTED {
            return;
        }
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            conn.event_loop.deregister(conn.channel.token(), None);
        });
    }

    /// Closes the write half immediately, discarding buffered output.
    pub fn force_shutdown(self: &Arc<Self>) {
        if self.state.load(Ordering::Acquire) == DISCONNECTED {
            return;
        }
        self.state.store(DISCONNECTING, Ordering::Release);
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            conn.channel.set_writable(false);
            if let Err(err) = conn.channel.socket().shutdown_write() {
                warn!("failed to shut down write half: {}", err);
            }
        });
    }

    /// Blocks until `on_close` has fired. Must not be called from this
    /// connection's loop thread.
    pub fn wait_closed(&self) {
        self.close_latch.wait();
    }

    fn handle_send(&self, mut data: &[u8]) {
        if self.state.load(Ordering::Acquire) != CONNECTED {
            trace!("dropping send on non-connected connection");
            return;
        }

        let mut output = self.output.lock().unwrap();
        let mut fatal = None;
        let mut completed = false;
        if output.is_empty() && !data.is_empty() {
            // Fast path: nothing queued, try the socket directly.
            match self.channel.socket().send(data) {
                Ok(n) => {
                    data = &data[n..];
                    completed = data.is_empty();
                }
                Err(err) if is_transient(&err) => {}
                Err(err) => fatal = Some(err),
            }
        }
        if fatal.is_none() && !data.is_empty() {
            output.append(data);
            self.channel.set_writable(true);
        }
        drop(output);

        if let Some(err) = fatal {
            self.handle_error(err);
            return;
        }
        if completed {
            // Everything left in one write; there will be no drain to
            // report completion.
            self.handler().on_write_complete(Timestamp::now());
        }
    }

    fn handle_read(&self, now: Timestamp) {
        let mut input = self.input.lock().unwrap();
        match input.append_from(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                trace!("peer closed, fd={}", self.channel.fd());
                self.handle_close();
            }
            Ok(_) => self.handler().on_read(now, &mut input),
            Err(ref err) if is_transient(err) => {}
            Err(err) => {
                drop(input);
                self.handle_error(err);
            }
        }
    }

    fn handle_write(&self) {
        if !self.channel.is_writable() {
            trace!("connection is down, no more writing");
            return;
        }

        let mut output = self.output.lock().unwrap();
        if !output.is_empty() {
            match output.write_to(self.channel.fd()) {
                Ok(_) => {}
                Err(ref err) if is_transient(err) => {}
                Err(err) => {
                    drop(output);
                    self.handle_error(err);
                    return;
                }
            }
        }
        if !output.is_empty() {
            return;
        }
        self.channel.set_writable(false);
        drop(output);

        self.handler().on_write_complete(Timestamp::now());
        match self.state() {
            ConnectionState::Disconnecting => {
                if let Err(err) = self.channel.socket().shutdown_write() {
                    warn!("failed to shut down write half: {}", err);
                }
            }
            ConnectionState::Disconnected => {
                // A close was requested with output pending; it has
                // drained now.
                self.event_loop.deregister(self.channel.token(), None);
            }
            _ => {}
        }
    }

    fn handle_error(&self, err: io::Error) {
        self.handler().on_error(Timestamp::now(), err);
        self.handle_close();
    }

    fn handle_socket_error(&self) {
        match self.channel.socket().take_error() {
            Ok(Some(err)) => self.handle_error(err),
            Ok(None) => self.handle_close(),
            Err(err) => self.handle_error(err),
        }
    }

    // The only close transition that runs on the loop thread; every
    // path into `Disconnected` funnels through here or through the
    // public close methods, and the first one wins.
    fn handle_close(&self) {
        if self.state.swap(DISCONNECTED, Ordering::AcqRel) == DISCONNECTED {
            return;
        }
        trace!("disconnecting, fd={}", self.channel.fd());
        self.event_loop.deregister(self.channel.token(), None);
    }

    // Runs exactly once, after the channel left the selector: the
    // single place `on_close` fires.
    fn handle_remove(&self) {
        if self.state.load(Ordering::Acquire) != DISCONNECTED {
            error!("removing connection that is not disconnected");
        }
        self.handler().on_close(Timestamp::now());
        self.close_latch.count_down();
        *self.context.conn.lock().unwrap() = None;
    }
}

impl Channel for TcpConnection {
    fn fd(&self) -> std::os::fd::RawFd {
        self.channel.fd()
    }

    fn handle_events(&self, ready: Ready, now: Timestamp) {
        if ready.is_hup() && !ready.is_readable() {
            self.handle_close();
            return;
        }
        if ready.is_error() {
            self.handle_socket_error();
            return;
        }
        if ready.is_readable() || ready.is_read_closed() {
            self.handle_read(now);
        }
        if self.state.load(Ordering::Acquire) == DISCONNECTED {
            // The read path tore the connection down.
            return;
        }
        if ready.is_writable() {
            self.handle_write();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        trace!("dropping connection, fd={}", self.channel.fd());
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("fd", &self.channel.fd())
            .field("state", &self.state())
            .field("local", &self.local)
            .finish()
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

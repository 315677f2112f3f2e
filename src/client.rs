//! The outward-facing TCP client.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::{error, trace, warn};

use crate::buffer::Buffer;
use crate::connection::{ChannelContext, Handler, TcpConnection};
use crate::event_loop::EventLoop;
use crate::group::EventLoopGroup;
use crate::net::Socket;
use crate::options::TcpClientOptions;
use crate::server::HandlerBuilder;
use crate::time::{Duration, Timestamp};

const OFFLINE: u32 = 0;
const CONNECTING: u32 = 1;
const CONNECTED: u32 = 2;
const DISCONNECTING: u32 = 3;
const DISCONNECTED: u32 = 4;

/// How long to wait before a connect attempt that failed with a
/// retryable error is repeated.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// A reconnecting TCP client.
///
/// `start` picks a worker loop and begins connecting. Address-in-use,
/// connection-refused and similar transient conditions retry after one
/// second; permission and addressing errors are fatal and the client
/// goes back offline.
pub struct TcpClient {
    address: SocketAddr,
    state: AtomicU32,
    worker_group: Mutex<Option<Arc<EventLoopGroup>>>,
    event_loop: Mutex<Option<EventLoop>>,
    conn: Mutex<Option<Arc<TcpConnection>>>,
    builder: OnceLock<Arc<HandlerBuilder>>,
    options: Mutex<TcpClientOptions>,
}

// Wraps the user handler to keep the client's connection slot and
// state in step with the connection lifecycle.
struct ClientHandler {
    handler: Arc<dyn Handler>,
    client: Arc<TcpClient>,
}

impl Handler for ClientHandler {
    fn on_connect(&self, now: Timestamp) {
        self.handler.on_connect(now);
    }

    fn on_read(&self, now: Timestamp, buffer: &mut Buffer) {
        self.handler.on_read(now, buffer);
    }

    fn on_write_complete(&self, now: Timestamp) {
        self.handler.on_write_complete(now);
    }

    fn on_error(&self, now: Timestamp, error: io::Error) {
        self.handler.on_error(now, error);
    }

    fn on_close(&self, now: Timestamp) {
        self.handler.on_close(now);
        self.client.state.store(DISCONNECTED, Ordering::Release);
        self.client.conn.lock().unwrap().take();
    }
}

impl TcpClient {
    pub fn new(address: SocketAddr) -> Arc<TcpClient> {
        Arc::new(TcpClient {
            address,
            state: AtomicU32::new(OFFLINE),
            worker_group: Mutex::new(None),
            event_loop: Mutex::new(None),
            conn: Mutex::new(None),
            builder: OnceLock::new(),
            options: Mutex::new(TcpClientOptions::default()),
        })
    }

    pub fn set_group(&self, group: Arc<EventLoopGroup>) {
        *self.worker_group.lock().unwrap() = Some(group);
    }

    pub fn set_options(&self, options: TcpClientOptions) {
        *self.options.lock().unwrap() = options;
    }

    /// Sets the handler factory for the (re)established connection.
    /// Only the first call takes effect.
    pub fn set_builder<F>(&self, builder: F)
    where
        F: Fn(Arc<ChannelContext>) -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        let _ = self.builder.set(Arc::new(Box::new(builder)));
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.conn.lock().unwrap().clone()
    }

    /// Begins connecting on a worker loop. A client can be started
    /// once per offline period.
    pub fn start(self: &Arc<Self>) {
        trace!("client connecting to {}", self.address);
        if self
            .state
            .compare_exchange(OFFLINE, CONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("client already started");
            return;
        }

        let event_loop = {
            let group = self.worker_group.lock().unwrap();
            group.as_ref().expect("client group is not set").next().clone()
        };
        *self.event_loop.lock().unwrap() = Some(event_loop.clone());

        let client = Arc::clone(self);
        event_loop.run_in_loop(move || client.raise_connection());
    }

    fn raise_connection(self: &Arc<Self>) {
        if self.state.load(Ordering::Acquire) != CONNECTING {
            warn!("client is no longer connecting, giving up");
            return;
        }

        let socket = match self.create_socket() {
            Ok(socket) => socket,
            Err(err) => {
                error!("failed to create client socket: {}", err);
                self.report_fatal(err);
                return;
            }
        };

        match socket.connect(self.address) {
            Ok(()) => self.handle_connection(socket),
            Err(err) => match err.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                    self.handle_connection(socket)
                }
                Some(libc::EAGAIN)
                | Some(libc::EADDRINUSE)
                | Some(libc::EADDRNOTAVAIL)
                | Some(libc::ECONNREFUSED)
                | Some(libc::ENETUNREACH) => self.retry(socket, err),
                Some(libc::EACCES)
                | Some(libc::EPERM)
                | Some(libc::EAFNOSUPPORT)
                | Some(libc::EALREADY)
                | Some(libc::EBADF)
                | Some(libc::EFAULT)
                | Some(libc::ENOTSOCK) => {
                    error!("failed to connect to {}: {}", self.address, err);
                    self.report_fatal(err);
                }
                _ => {
                    error!("unexpected connect error to {}: {}", self.address, err);
                    self.report_fatal(err);
                }
            },
        }
    }

    // A fatal connect failure never built a connection, so no wrapped
    // handler exists yet; the error still belongs to the caller. Build
    // a handler over a context with an empty connection slot, deliver
    // `on_error`, then go offline.
    fn report_fatal(&self, err: io::Error) {
        let builder = self.builder.get().expect("client builder is not set");
        let handler = (builder.as_ref())(ChannelContext::new());
        handler.on_error(Timestamp::now(), err);
        self.state.store(OFFLINE, Ordering::Release);
    }

    fn create_socket(&self) -> io::Result<Socket> {
        let socket = Socket::new(&self.address)?;
        socket.apply(&self.options.lock().unwrap().options)?;
        Ok(socket)
    }

    fn retry(self: &Arc<Self>, socket: Socket, reason: io::Error) {
        drop(socket);
        trace!("retrying connect to {}: {}", self.address, reason);
        let client = Arc::clone(self);
        let event_loop = self.event_loop.lock().unwrap().clone();
        if let Some(event_loop) = event_loop {
            event_loop.schedule_after(RETRY_DELAY, move || client.raise_connection());
        }
    }

    fn handle_connection(self: &Arc<Self>, socket: Socket) {
        if self
            .state
            .compare_exchange(CONNECTING, CONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("client stopped while connecting, dropping socket");
            return;
        }

        let event_loop = self
            .event_loop
            .lock()
            .unwrap()
            .clone()
            .expect("client loop is not set");
        let conn = TcpConnection::new(event_loop, socket);
        let builder = self.builder.get().expect("client builder is not set");
        conn.set_handler(Arc::new(ClientHandler {
            handler: (builder.as_ref())(conn.context()),
            client: Arc::clone(self),
        }));
        conn.start();
        *self.conn.lock().unwrap() = Some(conn);
    }

    /// Queues `data` on the live connection; dropped when offline.
    pub fn send(&self, data: impl Into<Vec<u8>>) {
        if let Some(conn) = self.connection() {
            conn.send(data);
        }
    }

    /// Disconnects after the output drains.
    pub fn close(&self) {
        if self.transition_to_disconnecting() {
            if let Some(conn) = self.connection() {
                conn.close();
            }
        }
    }

    /// Closes the write half after the output drains.
    pub fn shutdown(&self) {
        if self.transition_to_disconnecting() {
            if let Some(conn) = self.connection() {
                conn.shutdown();
            }
        }
    }

    /// Disconnects immediately.
    pub fn force_close(&self) {
        if self.transition_to_disconnecting() {
            if let Some(conn) = self.connection() {
                conn.force_close();
            }
        }
    }

    /// Closes the write half immediately.
    pub fn force_shutdown(&self) {
        if self.transition_to_disconnecting() {
            if let Some(conn) = self.connection() {
                conn.force_shutdown();
            }
        }
    }

    fn transition_to_disconnecting(&self) -> bool {
        self.state
            .compare_exchange(
                CONNECTED,
                DISCONNECTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("address", &self.address)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

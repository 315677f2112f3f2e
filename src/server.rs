//! The outward-facing TCP server.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{ChannelContext, Handler, TcpConnection};
use crate::group::EventLoopGroup;
use crate::options::TcpServerOptions;
use crate::time::Timestamp;

/// Builds one handler per accepted connection, given the context the
/// handler can reach its connection through.
pub type HandlerBuilder = Box<dyn Fn(Arc<ChannelContext>) -> Arc<dyn Handler> + Send + Sync>;

type ConnectionTable = Mutex<HashMap<usize, Arc<TcpConnection>>>;

/// A multi-loop TCP server.
///
/// A boss group accepts; a worker group runs the connections. Each
/// accepted socket becomes a [`TcpConnection`] on the next worker loop
/// in rotation, wearing a handler produced by the builder.
///
/// # Examples
///
/// ```no_run
/// use nio::{Buffer, EventLoopGroup, Handler, TcpServer, Timestamp};
/// use std::sync::Arc;
///
/// struct Echo(Arc<nio::ChannelContext>);
///
/// impl Handler for Echo {
///     fn on_read(&self, _now: Timestamp, buffer: &mut Buffer) {
///         if let Some(conn) = self.0.connection() {
///             conn.send(buffer.take());
///         }
///     }
/// }
///
/// let group = Arc::new(EventLoopGroup::new(4).unwrap());
/// let mut server = TcpServer::new();
/// server.set_group(Arc::clone(&group), Arc::clone(&group));
/// server.set_builder(|ctx| Arc::new(Echo(ctx)));
/// server.bind("127.0.0.1:1082".parse().unwrap()).unwrap();
/// server.start();
/// group.join();
/// ```
#[derive(Default)]
pub struct TcpServer {
    boss_group: Option<Arc<EventLoopGroup>>,
    worker_group: Option<Arc<EventLoopGroup>>,
    acceptor: Option<Arc<Acceptor>>,
    builder: Option<Arc<HandlerBuilder>>,
    connections: Arc<ConnectionTable>,
    options: TcpServerOptions,
}

// Wraps the user handler to keep the server's live-connection table in
// step with connect/close.
struct ServerHandler {
    handler: Arc<dyn Handler>,
    context: Arc<ChannelContext>,
    connections: Arc<ConnectionTable>,
}

impl Handler for ServerHandler {
    fn on_connect(&self, now: Timestamp) {
        if let Some(conn) = self.context.connection() {
            let key = Arc::as_ptr(&conn) as usize;
            self.connections.lock().unwrap().insert(key, conn);
        }
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
        if let Some(conn) = self.context.connection() {
            let key = Arc::as_ptr(&conn) as usize;
            self.connections.lock().unwrap().remove(&key);
        }
    }
}

impl TcpServer {
    pub fn new() -> TcpServer {
        TcpServer::default()
    }

    pub fn set_options(&mut self, options: TcpServerOptions) {
        self.options = options;
    }

    /// Sets the accepting and working groups. The same group may serve
    /// as both.
    pub fn set_group(&mut self, boss: Arc<EventLoopGroup>, worker: Arc<EventLoopGroup>) {
        self.boss_group = Some(boss);
        self.worker_group = Some(worker);
    }

    /// Sets the per-connection handler factory.
    pub fn set_builder<F>(&mut self, builder: F)
    where
        F: Fn(Arc<ChannelContext>) -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        self.builder = Some(Arc::new(Box::new(builder)));
    }

    /// Creates the listening socket on a boss loop and binds it.
    pub fn bind(&mut self, address: SocketAddr) -> io::Result<()> {
        trace!("binding server to {}", address);
        let boss = self
            .boss_group
            .as_ref()
            .expect("server group is not set")
            .next();
        let acceptor = Acceptor::new(boss.clone(), address, &self.options.boss_options)?;
        acceptor.bind()?;
        self.acceptor = Some(acceptor);
        Ok(())
    }

    /// The bound address, once [`bind`](TcpServer::bind) succeeded.
    /// Binding port 0 resolves to the real ephemeral port here.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.as_ref()?.local_addr().ok()
    }

    /// Starts accepting.
    pub fn start(&mut self) {
        let acceptor = self.acceptor.as_ref().expect("server is not bound").clone();
        let worker_group = Arc::clone(self.worker_group.as_ref().expect("server group is not set"));
        let builder = Arc::clone(self.builder.as_ref().expect("server builder is not set"));
        let connections = Arc::clone(&self.connections);
        let child_options = self.options.child_options;

        acceptor.set_on_accept(Box::new(move |socket| {
            if let Err(err) = socket.apply(&child_options) {
                log::warn!("failed to apply socket options: {}", err);
            }
            let conn = TcpConnection::new(worker_group.next().clone(), socket);
            let context = conn.context();
            conn.set_handler(Arc::new(ServerHandler {
                handler: (builder.as_ref())(Arc::clone(&context)),
                context,
                connections: Arc::clone(&connections),
            }));
            conn.start();
        }));
        acceptor.listen();
    }

    /// Stops accepting and closes every live connection.
    pub fn close(&mut self) {
        trace!("closing server");
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.close();
        }
        let connections = std::mem::take(&mut *self.connections.lock().unwrap());
        for conn in connections.into_values() {
            conn.close();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("acceptor", &self.acceptor)
            .field("connections", &self.connections.lock().unwrap().len())
            .finish()
    }
}

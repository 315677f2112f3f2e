// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use nio::{
    Buffer, ChannelContext, EventLoopGroup, EventLoopOptions, Handler, TcpServer, Timestamp,
};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

pub fn any_local_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// The callbacks a connection delivered, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    Connect,
    Read,
    WriteComplete,
    Error,
    Close,
}

/// Records every callback and forwards to an inner handler.
pub struct Recorder {
    inner: Arc<dyn Handler>,
    events: Arc<Mutex<Vec<Callback>>>,
}

impl Recorder {
    pub fn wrap(inner: Arc<dyn Handler>) -> (Arc<Recorder>, Arc<Mutex<Vec<Callback>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Recorder {
            inner,
            events: Arc::clone(&events),
        });
        (recorder, events)
    }
}

impl Handler for Recorder {
    fn on_connect(&self, now: Timestamp) {
        self.events.lock().unwrap().push(Callback::Connect);
        self.inner.on_connect(now);
    }

    fn on_read(&self, now: Timestamp, buffer: &mut Buffer) {
        self.events.lock().unwrap().push(Callback::Read);
        self.inner.on_read(now, buffer);
    }

    fn on_write_complete(&self, now: Timestamp) {
        self.events.lock().unwrap().push(Callback::WriteComplete);
        self.inner.on_write_complete(now);
    }

    fn on_error(&self, now: Timestamp, error: io::Error) {
        self.events.lock().unwrap().push(Callback::Error);
        self.inner.on_error(now, error);
    }

    fn on_close(&self, now: Timestamp) {
        self.events.lock().unwrap().push(Callback::Close);
        self.inner.on_close(now);
    }
}

/// Echoes every read straight back.
pub struct Echo(pub Arc<ChannelContext>);

impl Handler for Echo {
    fn on_read(&self, _now: Timestamp, buffer: &mut Buffer) {
        if let Some(conn) = self.0.connection() {
            conn.send(buffer.take());
        }
    }
}

/// Ignores everything.
pub struct Sink;

impl Handler for Sink {}

/// Counts connections that reached `on_close`.
pub struct CloseCounter(pub Arc<AtomicUsize>);

impl Handler for CloseCounter {
    fn on_close(&self, _now: Timestamp) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Binds an echo server on an ephemeral port.
pub fn echo_server(group: &Arc<EventLoopGroup>) -> (TcpServer, SocketAddr) {
    let mut server = TcpServer::new();
    server.set_group(Arc::clone(group), Arc::clone(group));
    server.set_builder(|ctx| Arc::new(Echo(ctx)));
    server.bind(any_local_addr()).expect("unable to bind server");
    server.start();
    let addr = server.local_addr().expect("server has no local address");
    (server, addr)
}

/// One group per queue/timer flavour, so every test matrix runs the
/// same assertions over every implementation.
pub fn all_option_flavours() -> Vec<EventLoopOptions> {
    use nio::{EventQueueType, SelectorType, TimerQueueType};

    let mut flavours = Vec::new();
    for event_queue_type in [
        EventQueueType::LockFree,
        EventQueueType::Blocking,
        EventQueueType::DoubleBuffer,
    ] {
        for timer_queue_type in [TimerQueueType::Heap, TimerQueueType::HashWheel] {
            flavours.push(EventLoopOptions {
                event_queue_type,
                timer_queue_type,
                selector_type: SelectorType::Epoll,
                ..EventLoopOptions::default()
            });
        }
    }
    flavours.push(EventLoopOptions {
        selector_type: SelectorType::Poll,
        ..EventLoopOptions::default()
    });
    flavours
}

//! Multi-threaded reactor-style TCP networking.
//!
//! nio runs groups of event-loop threads. Each loop owns a kernel
//! multiplexer and demultiplexes readiness onto registered channels,
//! drains a cross-thread task queue through an `eventfd`, and fires
//! scheduled callbacks through a `timerfd`-backed timer queue.
//! Connections are stateful wrappers over a stream socket delivering
//! their events to a user [`Handler`].
//!
//! Only readiness-based Unix multiplexers are supported: epoll by
//! default, poll(2) as the fallback.
//!
//! # Examples
//!
//! An echo server:
//!
//! ```no_run
//! use nio::{Buffer, EventLoopGroup, Handler, TcpServer, Timestamp};
//! use std::sync::Arc;
//!
//! struct Echo(Arc<nio::ChannelContext>);
//!
//! impl Handler for Echo {
//!     fn on_read(&self, _now: Timestamp, buffer: &mut Buffer) {
//!         if let Some(conn) = self.0.connection() {
//!             conn.send(buffer.take());
//!         }
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let group = Arc::new(EventLoopGroup::new(4)?);
//!
//!     let mut server = nio::TcpServer::new();
//!     server.set_group(Arc::clone(&group), Arc::clone(&group));
//!     server.set_builder(|ctx| Arc::new(Echo(ctx)));
//!     server.bind("127.0.0.1:1082".parse().unwrap())?;
//!     server.start();
//!
//!     group.join();
//!     Ok(())
//! }
//! ```
//!
//! Scheduling work onto a loop from any thread:
//!
//! ```
//! use nio::{Duration, EventLoop};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let driver = event_loop.clone();
//! let thread = std::thread::spawn(move || driver.run());
//!
//! event_loop.schedule(|| println!("on the loop thread"));
//! let id = event_loop.schedule_every(
//!     Duration::ZERO,
//!     Duration::from_millis(100),
//!     || println!("tick"),
//! );
//!
//! event_loop.schedule_cancel(id);
//! event_loop.close();
//! event_loop.join();
//! thread.join().unwrap();
//! ```

#![cfg(unix)]
#![deny(missing_debug_implementations)]

/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that use it.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod acceptor;
mod buffer;
mod channel;
mod client;
mod connection;
mod event;
mod event_loop;
mod group;
mod net;
mod options;
mod queue;
mod selector;
mod server;
mod time;
mod timer;
mod token;
mod util;

pub use crate::buffer::Buffer;
pub use crate::client::TcpClient;
pub use crate::connection::{ChannelContext, ConnectionState, Handler, TcpConnection};
pub use crate::event::{Interest, Ready};
pub use crate::event_loop::EventLoop;
pub use crate::group::EventLoopGroup;
pub use crate::net::Socket;
pub use crate::options::{
    EventLoopOptions, EventQueueType, SelectorType, SocketOptions, TcpClientOptions,
    TcpServerOptions, TimerQueueType,
};
pub use crate::server::{HandlerBuilder, TcpServer};
pub use crate::time::{Duration, Timestamp};
pub use crate::token::Token;

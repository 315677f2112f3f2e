//! Configuration for event loops, servers and clients.

use crate::time::Duration;

/// Which cross-thread task queue an event loop runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum EventQueueType {
    /// Mutex-guarded deque, popped one task at a time.
    Blocking,
    /// Two vectors swapped under a mutex on every drain.
    DoubleBuffer,
    /// Lock-free multi-producer queue with an atomic length.
    #[default]
    LockFree,
}

/// Which timer structure an event loop runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum TimerQueueType {
    /// Binary heap keyed by absolute expiry.
    #[default]
    Heap,
    /// Hashed timing wheel (100 ms ticks, 600 buckets).
    HashWheel,
}

/// Which kernel multiplexer backs the selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum SelectorType {
    #[default]
    Epoll,
    Poll,
}

/// Per-socket options applied when a socket is created.
#[derive(Copy, Clone, Debug)]
pub struct SocketOptions {
    pub reuse_addr: bool,
    pub reuse_port: bool,
    pub keep_alive: bool,
    pub tcp_no_delay: bool,
}

impl Default for SocketOptions {
    fn default() -> SocketOptions {
        SocketOptions {
            reuse_addr: true,
            reuse_port: false,
            keep_alive: true,
            tcp_no_delay: true,
        }
    }
}

/// Options for a single event loop.
#[derive(Copy, Clone, Debug)]
pub struct EventLoopOptions {
    pub event_queue_type: EventQueueType,
    pub timer_queue_type: TimerQueueType,
    pub selector_type: SelectorType,
    /// Upper bound on one blocking wait; the loop re-checks its state
    /// at least this often even when completely idle.
    pub select_timeout: Duration,
}

impl Default for EventLoopOptions {
    fn default() -> EventLoopOptions {
        EventLoopOptions {
            event_queue_type: EventQueueType::default(),
            timer_queue_type: TimerQueueType::default(),
            selector_type: SelectorType::default(),
            select_timeout: Duration::from_secs(10),
        }
    }
}

/// Options for a [`TcpServer`](crate::TcpServer): the listening socket
/// and accepted sockets are configured independently.
#[derive(Copy, Clone, Debug, Default)]
pub struct TcpServerOptions {
    pub boss_options: SocketOptions,
    pub child_options: SocketOptions,
}

/// Options for a [`TcpClient`](crate::TcpClient).
#[derive(Copy, Clone, Debug, Default)]
pub struct TcpClientOptions {
    pub options: SocketOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = EventLoopOptions::default();
        assert_eq!(opts.event_queue_type, EventQueueType::LockFree);
        assert_eq!(opts.timer_queue_type, TimerQueueType::Heap);
        assert_eq!(opts.selector_type, SelectorType::Epoll);
        assert_eq!(opts.select_timeout, Duration::from_secs(10));

        let socket = SocketOptions::default();
        assert!(socket.reuse_addr);
        assert!(!socket.reuse_port);
        assert!(socket.keep_alive);
        assert!(socket.tcp_no_delay);
    }
}

//! Fixed-size groups of event loops, one OS thread each.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use log::trace;

use crate::event_loop::EventLoop;
use crate::options::EventLoopOptions;
use crate::time::Duration;

/// A fixed vector of [`EventLoop`]s, each driven by its own thread.
///
/// New work is spread round-robin through [`next`](EventLoopGroup::next).
/// Dropping the group closes and joins every loop.
///
/// # Examples
///
/// ```
/// use nio::EventLoopGroup;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let group = EventLoopGroup::new(4).unwrap();
/// let hits = Arc::new(AtomicUsize::new(0));
///
/// for _ in 0..16 {
///     let hits = Arc::clone(&hits);
///     group.schedule(move || {
///         hits.fetch_add(1, Ordering::SeqCst);
///     });
/// }
///
/// group.close();
/// group.join();
/// assert_eq!(hits.load(Ordering::SeqCst), 16);
/// ```
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Spawns `threads` loops with default options.
    pub fn new(threads: usize) -> io::Result<EventLoopGroup> {
        EventLoopGroup::with_options(threads, EventLoopOptions::default())
    }

    /// Spawns `threads` loops, each configured with `options`.
    pub fn with_options(threads: usize, options: EventLoopOptions) -> io::Result<EventLoopGroup> {
        assert!(threads > 0, "an event loop group needs at least one loop");

        let mut loops = Vec::with_capacity(threads);
        for _ in 0..threads {
            loops.push(EventLoop::with_options(options)?);
        }
        let handles = loops
            .iter()
            .map(|event_loop| {
                let driver = event_loop.clone();
                thread::spawn(move || driver.run())
            })
            .collect();

        trace!("created event loop group of {}", threads);
        Ok(EventLoopGroup {
            loops,
            threads: Mutex::new(handles),
            next: AtomicUsize::new(0),
        })
    }

    /// The loop that should take the next piece of work.
    pub fn next(&self) -> &EventLoop {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        &self.loops[index % self.loops.len()]
    }

    pub fn size(&self) -> usize {
        self.loops.len()
    }

    /// Enqueues a task on the next loop in rotation.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.next().schedule(task);
    }

    /// Schedules a one-shot timer on the next loop in rotation. The
    /// returned id is scoped to that loop.
    pub fn schedule_after<F>(&self, delay: Duration, callback: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.next().schedule_after(delay, callback)
    }

    /// Schedules a periodic timer on the next loop in rotation.
    pub fn schedule_every<F>(&self, delay: Duration, interval: Duration, callback: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.next().schedule_every(delay, interval, callback)
    }

    /// Cancels a timer id on every loop. Ids are per-loop counters, so
    /// the owning loop drops the entry and the rest find nothing.
    pub fn schedule_cancel(&self, id: u64) {
        for event_loop in &self.loops {
            event_loop.schedule_cancel(id);
        }
    }

    /// Requests every loop to stop.
    pub fn close(&self) {
        for event_loop in &self.loops {
            event_loop.close();
        }
    }

    /// Blocks until every loop has stopped and its thread exited.
    pub fn join(&self) {
        for event_loop in &self.loops {
            event_loop.join();
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.close();
        self.join();
    }
}

impl std::fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("size", &self.loops.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_round_robins() {
        let group = EventLoopGroup::new(3).unwrap();
        let first = group.next() as *const EventLoop;
        let second = group.next() as *const EventLoop;
        let third = group.next() as *const EventLoop;
        let fourth = group.next() as *const EventLoop;
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(first, fourth);
    }

    #[test]
    #[should_panic]
    fn empty_group_is_refused() {
        let _ = EventLoopGroup::new(0);
    }
}

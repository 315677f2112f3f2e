//! Cross-thread task queues draining into a loop thread.
//!
//! Producers on any thread hand tasks in; the owning loop is the sole
//! consumer. Every variant follows the same wake contract: the enqueue
//! that takes the queue from empty to non-empty writes the wake-up
//! channel, which guarantees at least one wake per non-empty-to-drained
//! cycle while coalescing bursts into a single selector wake.

use std::sync::Arc;

use log::warn;

use crate::channel::EventChannel;
use crate::options::EventQueueType;

mod blocking;
mod double_buffer;
mod lock_free;

pub(crate) use self::blocking::BlockingQueue;
pub(crate) use self::double_buffer::DoubleBufferQueue;
pub(crate) use self::lock_free::LockFreeQueue;

/// A deferred unit of work, consumed exactly once by the loop thread.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum EventQueue {
    Blocking(BlockingQueue),
    DoubleBuffer(DoubleBufferQueue),
    LockFree(LockFreeQueue),
}

impl EventQueue {
    pub(crate) fn new(kind: EventQueueType, channel: Arc<EventChannel>) -> EventQueue {
        match kind {
            EventQueueType::Blocking => EventQueue::Blocking(BlockingQueue::new(channel)),
            EventQueueType::DoubleBuffer => {
                EventQueue::DoubleBuffer(DoubleBufferQueue::new(channel))
            }
            EventQueueType::LockFree => EventQueue::LockFree(LockFreeQueue::new(channel)),
        }
    }

    /// Enqueues a task from any thread.
    pub(crate) fn push(&self, task: Task) {
        match self {
            EventQueue::Blocking(q) => q.push(task),
            EventQueue::DoubleBuffer(q) => q.push(task),
            EventQueue::LockFree(q) => q.push(task),
        }
    }

    /// Runs every queued task. Only the loop thread calls this.
    pub(crate) fn process(&self) {
        match self {
            EventQueue::Blocking(q) => q.process(),
            EventQueue::DoubleBuffer(q) => q.process(),
            EventQueue::LockFree(q) => q.process(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        match self {
            EventQueue::Blocking(q) => q.len(),
            EventQueue::DoubleBuffer(q) => q.len(),
            EventQueue::LockFree(q) => q.len(),
        }
    }
}

pub(super) fn wake(channel: &EventChannel) {
    if let Err(err) = channel.wake() {
        warn!("failed to wake event loop: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn variants() -> Vec<EventQueue> {
        [
            EventQueueType::Blocking,
            EventQueueType::DoubleBuffer,
            EventQueueType::LockFree,
        ]
        .into_iter()
        .map(|kind| EventQueue::new(kind, Arc::new(EventChannel::new().unwrap())))
        .collect()
    }

    #[test]
    fn drains_every_task_exactly_once() {
        for queue in variants() {
            let hits = Arc::new(AtomicUsize::new(0));
            for _ in 0..100 {
                let hits = Arc::clone(&hits);
                queue.push(Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }));
            }
            queue.process();
            assert_eq!(hits.load(Ordering::SeqCst), 100);
            assert_eq!(queue.len(), 0);

            // A second drain finds nothing.
            queue.process();
            assert_eq!(hits.load(Ordering::SeqCst), 100);
        }
    }

    #[test]
    fn single_producer_tasks_run_in_order() {
        for queue in variants() {
            let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
            for i in 0..32 {
                let seen = Arc::clone(&seen);
                queue.push(Box::new(move || seen.lock().unwrap().push(i)));
            }
            queue.process();
            assert_eq!(*seen.lock().unwrap(), (0..32).collect::<Vec<_>>());
        }
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        for queue in variants() {
            let queue = Arc::new(queue);
            let hits = Arc::new(AtomicUsize::new(0));

            let producers: Vec<_> = (0..8)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    let hits = Arc::clone(&hits);
                    thread::spawn(move || {
                        for _ in 0..1_000 {
                            let hits = Arc::clone(&hits);
                            queue.push(Box::new(move || {
                                hits.fetch_add(1, Ordering::SeqCst);
                            }));
                        }
                    })
                })
                .collect();
            for p in producers {
                p.join().unwrap();
            }

            queue.process();
            assert_eq!(hits.load(Ordering::SeqCst), 8_000);
        }
    }

    #[test]
    fn first_enqueue_wakes_the_channel() {
        let channel = Arc::new(EventChannel::new().unwrap());
        let queue = EventQueue::new(EventQueueType::LockFree, Arc::clone(&channel));

        let mut selector =
            crate::selector::Selector::new(crate::options::SelectorType::Epoll).unwrap();
        selector
            .add(
                crate::token::Token(0),
                channel.fd(),
                crate::event::Interest::READABLE,
            )
            .unwrap();

        queue.push(Box::new(|| {}));
        selector.select(crate::time::Duration::from_millis(100)).unwrap();
        assert_eq!(selector.ready().len(), 1);
    }
}

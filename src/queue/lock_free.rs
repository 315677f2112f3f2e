use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::channel::EventChannel;
use crate::queue::Task;

/// How many tasks one dequeue round pulls before running them.
const DRAIN_BATCH: usize = 32;

/// Lock-free multi-producer task queue.
///
/// Tasks land in a concurrent FIFO; a separate atomic length decides
/// who wakes the loop. The producer that observes the length going from
/// zero owns the wake, so any number of concurrent enqueues costs at
/// most one eventfd write per drain cycle.
pub(crate) struct LockFreeQueue {
    channel: Arc<EventChannel>,
    len: AtomicUsize,
    queue: SegQueue<Task>,
}

impl LockFreeQueue {
    pub(crate) fn new(channel: Arc<EventChannel>) -> LockFreeQueue {
        LockFreeQueue {
            channel,
            len: AtomicUsize::new(0),
            queue: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        self.queue.push(task);
        if self.len.fetch_add(1, Ordering::AcqRel) == 0 {
            super::wake(&self.channel);
        }
    }

    pub(crate) fn process(&self) {
        let mut batch = Vec::with_capacity(DRAIN_BATCH);
        loop {
            while batch.len() < DRAIN_BATCH {
                match self.queue.pop() {
                    Some(task) => batch.push(task),
                    None => break,
                }
            }
            if batch.is_empty() {
                return;
            }
            self.len.fetch_sub(batch.len(), Ordering::AcqRel);
            for task in batch.drain(..) {
                task();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

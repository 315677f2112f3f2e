use std::mem;
use std::sync::{Arc, Mutex};

use crate::channel::EventChannel;
use crate::queue::Task;

/// Double-buffered task queue.
///
/// Producers append to the pending vector under a mutex; the drain
/// swaps it against the running vector and releases the lock before
/// executing anything, so producers never wait on running tasks.
pub(crate) struct DoubleBufferQueue {
    channel: Arc<EventChannel>,
    pending: Mutex<Vec<Task>>,
    // Only the loop thread touches this; the mutex satisfies Sync and
    // keeps the drained buffer's allocation around between drains.
    running: Mutex<Vec<Task>>,
}

impl DoubleBufferQueue {
    pub(crate) fn new(channel: Arc<EventChannel>) -> DoubleBufferQueue {
        DoubleBufferQueue {
            channel,
            pending: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        let was_empty = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(task);
            pending.len() == 1
        };
        if was_empty {
            super::wake(&self.channel);
        }
    }

    pub(crate) fn process(&self) {
        let mut running = self.running.lock().unwrap();
        mem::swap(&mut *self.pending.lock().unwrap(), &mut *running);

        for task in running.drain(..) {
            task();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

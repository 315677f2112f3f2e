use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::channel::EventChannel;
use crate::queue::Task;

/// Mutex-and-deque task queue.
///
/// The drain pops one task at a time under the lock, so a task that
/// enqueues further work (or a cancellation racing the drain) always
/// observes a consistent queue.
pub(crate) struct BlockingQueue {
    channel: Arc<EventChannel>,
    queue: Mutex<VecDeque<Task>>,
}

impl BlockingQueue {
    pub(crate) fn new(channel: Arc<EventChannel>) -> BlockingQueue {
        BlockingQueue {
            channel,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        let was_empty = {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(task);
            queue.len() == 1
        };
        if was_empty {
            super::wake(&self.channel);
        }
    }

    pub(crate) fn process(&self) {
        loop {
            let task = self.queue.lock().unwrap().pop_front();
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

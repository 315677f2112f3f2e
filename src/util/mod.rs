//! Small synchronization helpers shared across the crate.

use std::sync::{Condvar, Mutex};

/// A counted latch: `wait` blocks until `count_down` has been called as
/// many times as the initial count.
///
/// Used to hand a "done" signal across threads at teardown points: an
/// event loop releases its joiners through one, and a connection
/// releases anyone awaiting its final close callback.
#[derive(Debug)]
pub(crate) struct Latch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new(count: usize) -> Latch {
        Latch {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn count_down(&self) {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cond.notify_all();
            }
        }
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cond.wait(count).unwrap();
        }
    }
}
